use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::envelope::ResponseEnvelope;
use crate::error::OutboundError;

/// Frames a connection may have queued before new ones are dropped.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Receiving end of a connection's outbound queue, drained by the socket writer.
pub type OutboundReceiver = mpsc::Receiver<String>;

/// A sink for sending response envelopes to one client connection.
///
/// Sends never block: frames are queued for the connection's writer task,
/// and a full queue rejects the frame.
#[derive(Debug, Clone)]
pub struct ConnectionOutbound {
    tx: mpsc::Sender<String>,
}

impl ConnectionOutbound {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Create an outbound sink with the default queue size.
    pub fn channel() -> (Self, OutboundReceiver) {
        Self::with_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }

    /// Create an outbound sink holding at most `capacity` queued frames.
    pub fn with_capacity(capacity: usize) -> (Self, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Encode and queue one envelope.
    pub fn send(&self, envelope: &ResponseEnvelope) -> Result<(), OutboundError> {
        let text = envelope.encode()?;
        self.send_raw(text)
    }

    /// Queue an already-encoded frame.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), OutboundError> {
        self.tx.try_send(text.into()).map_err(|e| match e {
            TrySendError::Full(_) => OutboundError::Full,
            TrySendError::Closed(_) => OutboundError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
