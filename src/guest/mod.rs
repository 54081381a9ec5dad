//! Guest side of the widget sandbox, modelled natively: the protocol
//! router, the helper namespace, and the capture pipeline.
pub mod dom;
pub mod helpers;
pub mod raster;
pub mod router;

pub use dom::{Element, Node};
pub use helpers::Helpers;
pub use raster::{BlobStore, CaptureBounds, RasterBackend, RasterError};
pub use router::{GuestContext, GuestOptions, GuestPhase, GuestRouter, RenderContext};
