//! Host/guest wire protocol.
//!
//! Every message crossing the isolation boundary is an [`Envelope`]:
//! `{ marker: true, token, type, payload }`. The token is the only
//! authentication; receivers drop anything that does not carry the
//! current session's token.
pub mod capture;
pub mod envelope;

pub use capture::{
    clamp_pixel_ratio, CaptureOptions, CaptureOutcome, CaptureRequest, CaptureResult,
    CapturedImage,
};
pub use envelope::{
    AckPayload, Envelope, ErrorPayload, LogLevel, LogPayload, Message, MessageKind,
    ResizePayload, UpdatePayload,
};

use thiserror::Error;

/// Why an inbound envelope was discarded.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    Malformed(String),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope marker missing")]
    MissingMarker,
    #[error("envelope token does not match the current session")]
    TokenMismatch,
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    BadPayload { kind: &'static str, reason: String },
}

/// Posting to the guest frame failed (frame gone, channel closed).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);
