//! Sandboxed hosting of user-authored dashboard widgets.
//!
//! The host builds an isolated guest document per widget, talks to it
//! only through token-authenticated envelopes, delivers data with a
//! bounded retry ladder until the guest acknowledges it, and can ask the
//! guest for a PNG snapshot of what it rendered.
pub mod backoff;
pub mod config;
pub mod guest;
pub mod host;
pub mod protocol;
pub mod sandbox;
