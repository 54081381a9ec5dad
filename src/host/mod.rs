//! Host side of the widget sandbox: sessions, delivery and the frame
//! boundary.
pub mod controller;
pub mod delivery;
pub mod frame;
pub mod runtime;
pub mod scheduler;
pub mod session;

pub use controller::{HostError, HostNotice, WidgetHost};
pub use frame::{ChannelFrame, GuestFrame};
pub use runtime::{HostCommand, HostRuntime};
pub use session::{SessionToken, SessionManager};
