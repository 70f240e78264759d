//! Message-oriented transport seam.
//!
//! The OTA and relay services never see a WebSocket.  They read whole
//! messages from a [`FrameSource`] and write whole messages to a
//! [`FrameSink`].  The infrastructure layer implements both over
//! tokio-tungstenite (client side) and UDP (device side); tests use the
//! in-memory pair returned by [`frame_channel`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// One inbound data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete binary message.
    Binary(Vec<u8>),
    /// A data message the channel does not carry, named by frame type
    /// (e.g. `"text"`).
    Unsupported(&'static str),
}

/// Transport-level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer went away without a clean close.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receiving half of a message connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Waits for the next data message.
    ///
    /// Returns `Ok(None)` when the peer closed cleanly.  Control frames
    /// (ping/pong) are handled below this trait and never surface.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;
}

/// Sending half of a message connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Sends one complete binary message.
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Closes the connection.  Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

// ── In-memory pair ────────────────────────────────────────────────────────────

/// Sink half of an in-memory [`frame_channel`].
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Inbound>>,
}

/// Source half of an in-memory [`frame_channel`].
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<Inbound>,
}

/// Creates a connected in-memory sink/source pair.
///
/// Messages sent into the sink arrive at the source in order.  Closing or
/// dropping the sink ends the source with `Ok(None)` once buffered messages
/// are drained.
pub fn frame_channel(capacity: usize) -> (ChannelSink, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx: Some(tx) }, ChannelSource { rx })
}

impl ChannelSink {
    /// Injects a non-binary message, as a misbehaving client would.
    pub async fn send_unsupported(&mut self, kind: &'static str) -> Result<(), TransportError> {
        self.push(Inbound::Unsupported(kind)).await
    }

    async fn push(&mut self, msg: Inbound) -> Result<(), TransportError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(TransportError::ConnectionLost("sink closed".into()));
        };
        tx.send(msg)
            .await
            .map_err(|_| TransportError::ConnectionLost("receiver dropped".into()))
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.push(Inbound::Binary(frame)).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
