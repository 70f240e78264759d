//! [`FrameSource`] / [`FrameSink`] over a tokio-tungstenite WebSocket.
//!
//! Generic over the underlying byte stream so the same adapters serve the
//! server (`TcpStream`) and the probe client (`MaybeTlsStream<TcpStream>`).

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::application::frames::{FrameSink, FrameSource, Inbound, TransportError};

/// Receiving half of a WebSocket connection.
pub struct WsFrameSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Sending half of a WebSocket connection.
pub struct WsFrameSink<S> {
    inner: SplitSink<WebSocketStream<S>, WsMessage>,
    closed: bool,
}

/// Splits an established WebSocket into sink and source halves.
pub fn split_ws<S>(ws: WebSocketStream<S>) -> (WsFrameSink<S>, WsFrameSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (tx, rx) = ws.split();
    (
        WsFrameSink {
            inner: tx,
            closed: false,
        },
        WsFrameSource { inner: rx },
    )
}

/// Errors that mean the peer is already gone and a close is moot.
fn is_closed(e: &WsError) -> bool {
    matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

#[async_trait]
impl<S> FrameSource for WsFrameSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(Inbound::Binary(data))),
                Some(Ok(WsMessage::Text(_))) => return Ok(Some(Inbound::Unsupported("text"))),
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!("peer sent Close: {frame:?}");
                    return Ok(None);
                }
                // tungstenite answers pings itself.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                Some(Err(e)) if is_closed(&e) => return Ok(None),
                Some(Err(e)) => return Err(TransportError::ConnectionLost(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

impl<S> WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Closes the connection with close code 1011 and a short reason, for
    /// sessions that fail after the handshake was accepted.
    pub async fn close_with_error(&mut self, reason: &str) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = CloseFrame {
            code: CloseCode::Error,
            reason: reason.to_string().into(),
        };
        match self.inner.send(WsMessage::Close(Some(frame))).await {
            Err(e) if !is_closed(&e) => Err(TransportError::ConnectionLost(e.to_string())),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<S> FrameSink for WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionLost("connection closed".into()));
        }
        self.inner
            .send(WsMessage::Binary(frame))
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.inner.close().await {
            Err(e) if !is_closed(&e) => Err(TransportError::ConnectionLost(e.to_string())),
            _ => Ok(()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
