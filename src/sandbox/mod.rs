//! Guest document construction.
//!
//! The security model is layered:
//!
//! 1. Isolated frame (`sandbox="allow-scripts"`, opaque origin): guest
//!    code cannot touch the host DOM, storage or bridges
//! 2. Fixed CSP: no network, no nested frames, no navigation targets
//! 3. Per-session token on every envelope: stale frames are inert
//! 4. Bridge stripping and tag escaping: defence in depth only
pub mod document;
pub mod template;

#[cfg(test)]
mod runtime_tests;

pub use document::{build, BuildError, DocumentOptions, SandboxDocument};
pub use template::{StatsRange, TemplateError, WidgetDataContext, WidgetTemplate};
