use tokio::sync::mpsc;

use crate::protocol::{Envelope, TransportError};

/// The isolated browsing context as seen from the host: something that
/// can receive envelopes (`postMessage` on the iframe's window).
pub trait GuestFrame: Send {
    fn post(&mut self, envelope: &Envelope) -> Result<(), TransportError>;
}

/// Forwards serialized envelopes to whatever owns the real frame, e.g.
/// the webview glue that calls `iframe.contentWindow.postMessage`.
pub struct ChannelFrame {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelFrame {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl GuestFrame for ChannelFrame {
    fn post(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        self.tx
            .send(envelope.to_json())
            .map_err(|_| TransportError("frame channel closed".to_string()))
    }
}
