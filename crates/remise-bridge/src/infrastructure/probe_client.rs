//! Probe client for the device's WebSocket channels.
//!
//! Reproduces the manual bench scripts: upload a firmware image over `/ota/`
//! in fixed-size chunks, or push a fixed frame through a relay channel a
//! number of times and collect the replies.

use std::time::{Duration, Instant};

use remise_core::ACK;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tracing::debug;

use crate::application::frames::{FrameSink, FrameSource, Inbound, TransportError};
use crate::infrastructure::ws_frames::{split_ws, WsFrameSink, WsFrameSource};

type ClientStream = MaybeTlsStream<TcpStream>;

/// Z21 frame used by the relay probe.
pub const Z21_PROBE_FRAME: [u8; 7] = [0x07, 0x00, 0x40, 0x00, 0x21, 0x81, 0xA0];

/// Zusi probe payload: 100 bytes counting up from zero.
pub fn zusi_probe_frame() -> Vec<u8> {
    (0..100u8).collect()
}

/// Failure of a probe run.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The server refused the WebSocket upgrade.
    #[error("handshake refused with HTTP {status}: {body}")]
    Refused { status: u16, body: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// How an upload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Every chunk was acknowledged.
    Completed,
    /// The server answered a chunk with this byte.
    Rejected(u8),
    /// The server closed or went silent before answering a chunk.
    NoReply,
}

/// Result of [`upload_firmware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub outcome: UploadOutcome,
    pub chunks_acked: usize,
    pub bytes_acked: usize,
    pub elapsed: Duration,
}

/// Result of [`relay_roundtrips`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    /// One entry per frame sent; `None` when no reply arrived in time.
    pub replies: Vec<Option<Vec<u8>>>,
    pub elapsed: Duration,
}

async fn connect(
    url: &str,
) -> Result<(WsFrameSink<ClientStream>, WsFrameSource<ClientStream>), ProbeError> {
    match connect_async(url).await {
        Ok((ws, _response)) => Ok(split_ws(ws)),
        Err(WsError::Http(response)) => Err(ProbeError::Refused {
            status: response.status().as_u16(),
            body: response
                .body()
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Waits up to `wait` for the next binary reply.
async fn next_reply(
    source: &mut WsFrameSource<ClientStream>,
    wait: Duration,
) -> Result<Option<Vec<u8>>, ProbeError> {
    loop {
        match timeout(wait, source.recv()).await {
            Err(_) => return Ok(None),
            Ok(Ok(Some(Inbound::Binary(data)))) => return Ok(Some(data)),
            Ok(Ok(Some(Inbound::Unsupported(kind)))) => debug!("probe: ignoring {kind} reply"),
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

/// Uploads `image` to `url` in `chunk_size` pieces, waiting for the
/// one-byte reply after each chunk.  Stops at the first non-ACK reply.
pub async fn upload_firmware(
    url: &str,
    image: &[u8],
    chunk_size: usize,
    reply_timeout: Duration,
) -> Result<UploadReport, ProbeError> {
    let started = Instant::now();
    let (mut sink, mut source) = connect(url).await?;

    let mut outcome = UploadOutcome::Completed;
    let mut chunks_acked = 0;
    let mut bytes_acked = 0;

    for chunk in image.chunks(chunk_size.max(1)) {
        sink.send(chunk.to_vec()).await?;
        match next_reply(&mut source, reply_timeout).await? {
            Some(reply) if reply == [ACK] => {
                chunks_acked += 1;
                bytes_acked += chunk.len();
            }
            Some(reply) => {
                outcome = UploadOutcome::Rejected(reply.first().copied().unwrap_or_default());
                break;
            }
            None => {
                outcome = UploadOutcome::NoReply;
                break;
            }
        }
    }

    sink.close().await?;
    // Drain until the server acknowledges the close so it has finished the
    // session before the report is returned.
    while let Ok(Ok(Some(_))) = timeout(reply_timeout, source.recv()).await {}

    Ok(UploadReport {
        outcome,
        chunks_acked,
        bytes_acked,
        elapsed: started.elapsed(),
    })
}

/// Sends `frame` to a relay channel `count` times, collecting one reply per
/// frame.
pub async fn relay_roundtrips(
    url: &str,
    frame: &[u8],
    count: usize,
    reply_timeout: Duration,
) -> Result<RelayReport, ProbeError> {
    let started = Instant::now();
    let (mut sink, mut source) = connect(url).await?;

    let mut replies = Vec::with_capacity(count);
    for _ in 0..count {
        sink.send(frame.to_vec()).await?;
        replies.push(next_reply(&mut source, reply_timeout).await?);
    }
    sink.close().await?;

    Ok(RelayReport {
        replies,
        elapsed: started.elapsed(),
    })
}
