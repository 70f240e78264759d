//! Firmware update use case.
//!
//! [`OtaTransfer`] couples the core [`OtaSession`] state machine with a
//! [`Flasher`], the device-side write target.  [`run_ota_session`] drives one
//! transfer over a client connection:
//!
//! ```text
//! client ──chunk──▶ feed() ──write──▶ Flasher
//! client ◀─reply── (one byte per chunk, ACK or the rejecting byte)
//! ```
//!
//! Pacing is stop-and-wait: the next client message is not read until the
//! current chunk's reply has been sent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use remise_core::{
    Abort, Ack, ExclusivityManager, GateError, OtaLock, OtaSession, OtaState, OtaSummary, Reply,
    ACK, NAK,
};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::frames::{FrameSink, FrameSource, Inbound, TransportError};

/// Failure of the device-side write target.
#[derive(Debug, Error)]
pub enum FlashError {
    /// Writing the chunk would exceed the configured maximum image size.
    #[error("image exceeds maximum size of {max} bytes")]
    TooLarge { max: u64 },

    /// `apply` was called but nothing was ever written.
    #[error("no image data was written")]
    NothingWritten,

    #[error("flash I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device-side write target for one firmware image.
///
/// The first [`Flasher::write`] opens the target; [`Flasher::apply`]
/// finalizes it and marks it bootable; [`Flasher::abort`] discards whatever
/// was written.
#[async_trait]
pub trait Flasher: Send {
    /// Writes one chunk and returns the device's single-byte reply.
    async fn write(&mut self, chunk: &[u8]) -> u8;

    /// Finalizes the written image.
    async fn apply(&mut self) -> Result<(), FlashError>;

    /// Discards a partial image.  Safe to call more than once.
    async fn abort(&mut self);
}

/// Produces a fresh [`Flasher`] for each accepted OTA connection.
pub type FlasherFactory = Arc<dyn Fn() -> Box<dyn Flasher> + Send + Sync>;

// ── OtaTransfer ───────────────────────────────────────────────────────────────

/// One firmware upload bound to a flasher.
pub struct OtaTransfer {
    session: OtaSession,
    flasher: Box<dyn Flasher>,
    ack_timeout: Duration,
}

impl std::fmt::Debug for OtaTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaTransfer")
            .field("session", &self.session)
            .field("ack_timeout", &self.ack_timeout)
            .finish_non_exhaustive()
    }
}

impl OtaTransfer {
    /// Acquires the flashing lock and binds it to `flasher`.
    ///
    /// # Errors
    ///
    /// [`GateError::Busy`] when another session (or an exclusive relay)
    /// holds the device.
    pub fn open(
        gate: &ExclusivityManager,
        flasher: Box<dyn Flasher>,
        ack_timeout: Duration,
    ) -> Result<Self, GateError> {
        let session = OtaSession::open(gate)?;
        Ok(Self {
            session,
            flasher,
            ack_timeout,
        })
    }

    /// Binds a lock acquired during the connection handshake.
    pub fn with_lock(lock: OtaLock, flasher: Box<dyn Flasher>, ack_timeout: Duration) -> Self {
        Self {
            session: OtaSession::from_lock(lock),
            flasher,
            ack_timeout,
        }
    }

    /// Forwards one chunk to the flasher and waits for its reply.
    ///
    /// # Errors
    ///
    /// - [`Abort::Rejected`] carrying the flasher's non-ACK byte.
    /// - [`Abort::AckTimeout`] if no reply arrives within `ack_timeout`.
    /// - [`Abort::NotStreaming`] if the session already ended.
    ///
    /// Any error leaves the session aborted and the flasher discarded.
    pub async fn feed(&mut self, chunk: &[u8]) -> Result<Ack, Abort> {
        self.session.begin_chunk(chunk.len())?;

        let reply = match timeout(self.ack_timeout, self.flasher.write(chunk)).await {
            Ok(byte) => Reply::Byte(byte),
            Err(_) => Reply::Timeout,
        };

        match self.session.on_reply(reply) {
            Ok(ack) => Ok(ack),
            Err(reason) => {
                self.flasher.abort().await;
                Err(reason)
            }
        }
    }

    /// The client closed the stream: apply the image if anything was
    /// received, then complete the session.
    ///
    /// An empty upload completes without touching the flasher.
    pub async fn finish(&mut self) -> OtaState {
        if !self.session.state().is_terminal() && self.session.round_trips() > 0 {
            if let Err(e) = self.flasher.apply().await {
                warn!("ota: failed to apply image: {e}");
                self.fail(Abort::ApplyFailed).await;
                return self.session.state();
            }
        }
        self.session.on_end_of_stream()
    }

    /// Aborts the session and discards the partial image.
    pub async fn fail(&mut self, reason: Abort) {
        if !self.session.state().is_terminal() {
            self.session.abort(reason);
            self.flasher.abort().await;
        }
    }

    pub fn state(&self) -> OtaState {
        self.session.state()
    }

    /// Ends the transfer and returns the flashing lock.
    pub async fn close(mut self) -> OtaSummary {
        self.fail(Abort::ConnectionLost).await;
        self.session.close()
    }
}

// ── Session runner ────────────────────────────────────────────────────────────

/// Which side answered first while a chunk was in flight.
enum Fed {
    /// The flasher replied (or timed out).
    Device(Result<Ack, Abort>),
    /// The client produced a message, a close or an error before the reply.
    Client(Result<Option<Inbound>, TransportError>),
}

/// Feeds `chunk` while watching the client, so a client that goes away
/// cancels the pending reply wait.  The flasher gets the first poll; a reply
/// that is ready at once always wins.
async fn feed_watching_client(
    transfer: &mut OtaTransfer,
    source: &mut dyn FrameSource,
    chunk: &[u8],
) -> Fed {
    tokio::select! {
        biased;
        fed = transfer.feed(chunk) => Fed::Device(fed),
        early = source.recv() => Fed::Client(early),
    }
}

/// Drives `transfer` over one client connection until it reaches a terminal
/// state, then closes the connection and releases the lock.
///
/// - Every acknowledged chunk is answered with a one-byte `ACK` message.
/// - A rejected chunk is answered with the rejecting byte, then the
///   connection is closed.
/// - An ack timeout closes the connection without a reply.
/// - A non-binary message is answered with `NAK` and aborts the session.
/// - A client close or error while a chunk is in flight cancels the reply
///   wait and aborts with [`Abort::ConnectionLost`]; any other message in
///   that window aborts with [`Abort::OutOfTurn`].
/// - No message within `idle_timeout` aborts with [`Abort::ClientTimeout`].
pub async fn run_ota_session(
    source: &mut dyn FrameSource,
    sink: &mut dyn FrameSink,
    mut transfer: OtaTransfer,
    idle_timeout: Duration,
    session_id: &str,
) -> OtaSummary {
    loop {
        let next = match timeout(idle_timeout, source.recv()).await {
            Ok(next) => next,
            Err(_) => {
                warn!("session {session_id}: no chunk within {idle_timeout:?}");
                transfer.fail(Abort::ClientTimeout).await;
                break;
            }
        };

        match next {
            Ok(Some(Inbound::Binary(chunk))) => match feed_watching_client(
                &mut transfer,
                source,
                &chunk,
            )
            .await
            {
                Fed::Client(Ok(None)) => {
                    warn!("session {session_id}: client closed while a chunk was in flight");
                    transfer.fail(Abort::ConnectionLost).await;
                    break;
                }
                Fed::Client(Err(e)) => {
                    warn!("session {session_id}: {e} while a chunk was in flight");
                    transfer.fail(Abort::ConnectionLost).await;
                    break;
                }
                Fed::Client(Ok(Some(_))) => {
                    warn!("session {session_id}: message received before the chunk was answered");
                    transfer.fail(Abort::OutOfTurn).await;
                    break;
                }
                Fed::Device(Ok(Ack)) => {
                    if let Err(e) = sink.send(vec![ACK]).await {
                        debug!("session {session_id}: failed to send ACK: {e}");
                        transfer.fail(Abort::ConnectionLost).await;
                        break;
                    }
                }
                Fed::Device(Err(Abort::Rejected(byte))) => {
                    warn!("session {session_id}: chunk rejected with 0x{byte:02X}");
                    if let Err(e) = sink.send(vec![byte]).await {
                        debug!("session {session_id}: failed to send reject byte: {e}");
                    }
                    break;
                }
                Fed::Device(Err(reason)) => {
                    warn!("session {session_id}: {reason}");
                    break;
                }
            },
            Ok(Some(Inbound::Unsupported(kind))) => {
                warn!("session {session_id}: {kind} frame on OTA channel");
                if let Err(e) = sink.send(vec![NAK]).await {
                    debug!("session {session_id}: failed to send NAK: {e}");
                }
                transfer.fail(Abort::UnsupportedFrame).await;
                break;
            }
            Ok(None) => {
                transfer.finish().await;
                break;
            }
            Err(e) => {
                warn!("session {session_id}: {e}");
                transfer.fail(Abort::ConnectionLost).await;
                break;
            }
        }
    }

    // Release the OTA lock before the client sees the close, so a client that
    // reconnects right away is not refused.
    let summary = transfer.close().await;

    if let Err(e) = sink.close().await {
        debug!("session {session_id}: close failed: {e}");
    }

    match summary.state {
        OtaState::Completed => info!(
            "session {session_id}: firmware update completed ({} bytes, {} chunks, {:?})",
            summary.bytes_received, summary.round_trips, summary.duration
        ),
        state => warn!(
            "session {session_id}: firmware update ended {state:?} after {} bytes",
            summary.bytes_received
        ),
    }
    summary
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::frames::{frame_channel, ChannelSink, ChannelSource};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    // ── Test doubles ──────────────────────────────────────────────────────────

    #[derive(Debug, Default)]
    struct FlasherLog {
        chunks: Vec<Vec<u8>>,
        applied: bool,
        aborted: bool,
    }

    /// Replies with scripted bytes (ACK once the script runs out).
    struct ScriptedFlasher {
        log: Arc<Mutex<FlasherLog>>,
        replies: Vec<u8>,
        reply_delay: Option<Duration>,
        fail_apply: bool,
    }

    impl ScriptedFlasher {
        fn new(replies: &[u8]) -> (Self, Arc<Mutex<FlasherLog>>) {
            let log = Arc::new(Mutex::new(FlasherLog::default()));
            let flasher = Self {
                log: Arc::clone(&log),
                replies: replies.iter().rev().copied().collect(),
                reply_delay: None,
                fail_apply: false,
            };
            (flasher, log)
        }
    }

    #[async_trait]
    impl Flasher for ScriptedFlasher {
        async fn write(&mut self, chunk: &[u8]) -> u8 {
            if let Some(delay) = self.reply_delay {
                tokio::time::sleep(delay).await;
            }
            self.log.lock().unwrap().chunks.push(chunk.to_vec());
            self.replies.pop().unwrap_or(ACK)
        }

        async fn apply(&mut self) -> Result<(), FlashError> {
            if self.fail_apply {
                return Err(FlashError::NothingWritten);
            }
            self.log.lock().unwrap().applied = true;
            Ok(())
        }

        async fn abort(&mut self) {
            self.log.lock().unwrap().aborted = true;
        }
    }

    /// Client side of an in-memory connection: what the client sends and
    /// what it receives back.
    struct Wire {
        client_tx: ChannelSink,
        client_rx: ChannelSource,
        server_rx: ChannelSource,
        server_tx: ChannelSink,
    }

    fn wire() -> Wire {
        let (client_tx, server_rx) = frame_channel(16);
        let (server_tx, client_rx) = frame_channel(16);
        Wire {
            client_tx,
            client_rx,
            server_rx,
            server_tx,
        }
    }

    /// Hands out scripted messages, then fails as a reset connection would.
    struct FailingSource {
        script: VecDeque<Inbound>,
    }

    #[async_trait]
    impl FrameSource for FailingSource {
        async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
            match self.script.pop_front() {
                Some(msg) => Ok(Some(msg)),
                None => Err(TransportError::ConnectionLost("reset by peer".into())),
            }
        }
    }

    async fn replies(rx: &mut ChannelSource) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(Some(Inbound::Binary(b))) = rx.recv().await {
            out.push(b);
        }
        out
    }

    const IDLE: Duration = Duration::from_secs(2);
    const ACK_TIMEOUT: Duration = Duration::from_secs(2);

    // ── OtaTransfer ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_feed_ack_returns_ack() {
        // Arrange
        let gate = ExclusivityManager::default();
        let (flasher, log) = ScriptedFlasher::new(&[]);
        let mut transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();

        // Act
        let result = transfer.feed(&[1, 2, 3]).await;

        // Assert
        assert_ok!(result);
        assert_eq!(log.lock().unwrap().chunks, vec![vec![1, 2, 3]]);
        assert_eq!(transfer.state(), OtaState::Streaming);
    }

    #[tokio::test]
    async fn test_feed_nak_aborts_and_discards_image() {
        let gate = ExclusivityManager::default();
        let (flasher, log) = ScriptedFlasher::new(&[NAK]);
        let mut transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();

        let result = transfer.feed(&[0; 16]).await;

        assert_eq!(assert_err!(result), Abort::Rejected(NAK));
        assert!(log.lock().unwrap().aborted);
    }

    #[tokio::test]
    async fn test_feed_slow_flasher_times_out() {
        let gate = ExclusivityManager::default();
        let (mut flasher, _log) = ScriptedFlasher::new(&[]);
        flasher.reply_delay = Some(Duration::from_millis(500));
        let mut transfer =
            OtaTransfer::open(&gate, Box::new(flasher), Duration::from_millis(20)).unwrap();

        let result = transfer.feed(&[0; 16]).await;

        assert_eq!(result, Err(Abort::AckTimeout));
    }

    #[tokio::test]
    async fn test_open_while_flashing_is_busy() {
        let gate = ExclusivityManager::default();
        let (a, _) = ScriptedFlasher::new(&[]);
        let (b, _) = ScriptedFlasher::new(&[]);
        let _first = OtaTransfer::open(&gate, Box::new(a), ACK_TIMEOUT).unwrap();

        let second = OtaTransfer::open(&gate, Box::new(b), ACK_TIMEOUT);

        assert!(matches!(second, Err(GateError::Busy(_))));
    }

    #[tokio::test]
    async fn test_finish_applies_written_image() {
        let gate = ExclusivityManager::default();
        let (flasher, log) = ScriptedFlasher::new(&[]);
        let mut transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();
        transfer.feed(&[1]).await.unwrap();

        assert_eq!(transfer.finish().await, OtaState::Completed);
        assert!(log.lock().unwrap().applied);
    }

    #[tokio::test]
    async fn test_finish_of_empty_upload_applies_nothing() {
        let gate = ExclusivityManager::default();
        let (flasher, log) = ScriptedFlasher::new(&[]);
        let mut transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();

        assert_eq!(transfer.finish().await, OtaState::Completed);
        assert!(!log.lock().unwrap().applied);
    }

    #[tokio::test]
    async fn test_finish_apply_failure_aborts() {
        let gate = ExclusivityManager::default();
        let (mut flasher, _log) = ScriptedFlasher::new(&[]);
        flasher.fail_apply = true;
        let mut transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();
        transfer.feed(&[1]).await.unwrap();

        assert_eq!(
            transfer.finish().await,
            OtaState::Aborted(Abort::ApplyFailed)
        );
    }

    #[tokio::test]
    async fn test_close_releases_lock() {
        let gate = ExclusivityManager::default();
        let (flasher, _) = ScriptedFlasher::new(&[]);
        let transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();

        transfer.close().await;

        assert!(!gate.snapshot().ota_active);
    }

    // ── run_ota_session ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_three_chunks_all_acked_completes() {
        // Arrange
        let gate = ExclusivityManager::default();
        let (flasher, log) = ScriptedFlasher::new(&[]);
        let transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();
        let mut w = wire();
        for _ in 0..3 {
            w.client_tx.send(vec![0xAB; 1024]).await.unwrap();
        }
        w.client_tx.close().await.unwrap();

        // Act
        let summary =
            run_ota_session(&mut w.server_rx, &mut w.server_tx, transfer, IDLE, "t").await;

        // Assert
        assert_eq!(summary.state, OtaState::Completed);
        assert_eq!(summary.round_trips, 3);
        assert_eq!(summary.bytes_received, 3072);
        assert_eq!(replies(&mut w.client_rx).await, vec![vec![ACK]; 3]);
        assert!(log.lock().unwrap().applied);
        assert!(!gate.snapshot().ota_active);
    }

    #[tokio::test]
    async fn test_reject_on_chunk_k_stops_after_k_round_trips() {
        // Arrange: second chunk rejected, third must never reach the flasher
        let gate = ExclusivityManager::default();
        let (flasher, log) = ScriptedFlasher::new(&[ACK, NAK]);
        let transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();
        let mut w = wire();
        for i in 0..3u8 {
            w.client_tx.send(vec![i; 8]).await.unwrap();
        }

        // Act
        let summary =
            run_ota_session(&mut w.server_rx, &mut w.server_tx, transfer, IDLE, "t").await;

        // Assert
        assert_eq!(summary.state, OtaState::Aborted(Abort::Rejected(NAK)));
        assert_eq!(log.lock().unwrap().chunks.len(), 2);
        assert_eq!(replies(&mut w.client_rx).await, vec![vec![ACK], vec![NAK]]);
        assert!(OtaTransfer::open(&gate, Box::new(ScriptedFlasher::new(&[]).0), ACK_TIMEOUT).is_ok());
    }

    #[tokio::test]
    async fn test_text_frame_answered_with_nak() {
        let gate = ExclusivityManager::default();
        let (flasher, _) = ScriptedFlasher::new(&[]);
        let transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();
        let mut w = wire();
        w.client_tx.send_unsupported("text").await.unwrap();

        let summary =
            run_ota_session(&mut w.server_rx, &mut w.server_tx, transfer, IDLE, "t").await;

        assert_eq!(summary.state, OtaState::Aborted(Abort::UnsupportedFrame));
        assert_eq!(replies(&mut w.client_rx).await, vec![vec![NAK]]);
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let gate = ExclusivityManager::default();
        let (flasher, log) = ScriptedFlasher::new(&[]);
        let transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();
        let mut w = wire();
        w.client_tx.send(vec![1; 4]).await.unwrap();
        // The client keeps the connection open but never sends again.

        let summary = run_ota_session(
            &mut w.server_rx,
            &mut w.server_tx,
            transfer,
            Duration::from_millis(50),
            "t",
        )
        .await;

        assert_eq!(summary.state, OtaState::Aborted(Abort::ClientTimeout));
        assert!(log.lock().unwrap().aborted);
        assert!(!gate.snapshot().ota_active);
    }

    #[tokio::test]
    async fn test_ack_timeout_closes_without_reply() {
        let gate = ExclusivityManager::default();
        let (mut flasher, _) = ScriptedFlasher::new(&[]);
        flasher.reply_delay = Some(Duration::from_millis(500));
        let transfer =
            OtaTransfer::open(&gate, Box::new(flasher), Duration::from_millis(20)).unwrap();
        let mut w = wire();
        w.client_tx.send(vec![1; 4]).await.unwrap();

        let summary =
            run_ota_session(&mut w.server_rx, &mut w.server_tx, transfer, IDLE, "t").await;

        assert_eq!(summary.state, OtaState::Aborted(Abort::AckTimeout));
        assert!(replies(&mut w.client_rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_client_close_during_reply_wait_releases_lock() {
        // Arrange: a flasher far slower than the client
        let gate = ExclusivityManager::default();
        let (mut flasher, log) = ScriptedFlasher::new(&[]);
        flasher.reply_delay = Some(Duration::from_millis(500));
        let transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();
        let Wire {
            mut client_tx,
            client_rx,
            mut server_rx,
            mut server_tx,
        } = wire();
        let session = tokio::spawn(async move {
            run_ota_session(&mut server_rx, &mut server_tx, transfer, IDLE, "t").await
        });

        // Act: one chunk, then the client goes away before the reply
        client_tx.send(vec![1; 1024]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client_tx.close().await.unwrap();
        drop(client_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Assert: the lock is free well before the flasher would have answered
        assert!(!gate.snapshot().ota_active);
        let summary = session.await.unwrap();
        assert_eq!(summary.state, OtaState::Aborted(Abort::ConnectionLost));
        let log = log.lock().unwrap();
        assert!(!log.applied);
        assert!(log.aborted);
    }

    #[tokio::test]
    async fn test_message_before_reply_is_out_of_turn() {
        let gate = ExclusivityManager::default();
        let (mut flasher, log) = ScriptedFlasher::new(&[]);
        flasher.reply_delay = Some(Duration::from_millis(200));
        let transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();
        let mut w = wire();
        w.client_tx.send(vec![1; 8]).await.unwrap();
        w.client_tx.send(vec![2; 8]).await.unwrap();

        let summary =
            run_ota_session(&mut w.server_rx, &mut w.server_tx, transfer, IDLE, "t").await;

        assert_eq!(summary.state, OtaState::Aborted(Abort::OutOfTurn));
        assert!(log.lock().unwrap().chunks.is_empty());
        assert!(replies(&mut w.client_rx).await.is_empty());
        assert!(!gate.snapshot().ota_active);
    }

    #[tokio::test]
    async fn test_connection_error_mid_upload_aborts_unapplied() {
        // Arrange: one chunk arrives, then the connection resets
        let gate = ExclusivityManager::default();
        let (flasher, log) = ScriptedFlasher::new(&[]);
        let transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();
        let mut source = FailingSource {
            script: VecDeque::from([Inbound::Binary(vec![0xAB; 1024])]),
        };
        let (mut sink, mut client_rx) = frame_channel(16);

        // Act
        let summary = run_ota_session(&mut source, &mut sink, transfer, IDLE, "t").await;

        // Assert
        assert_eq!(summary.state, OtaState::Aborted(Abort::ConnectionLost));
        assert_eq!(summary.round_trips, 1);
        assert_eq!(replies(&mut client_rx).await, vec![vec![ACK]]);
        let log = log.lock().unwrap();
        assert!(!log.applied);
        assert!(log.aborted);
        assert!(OtaTransfer::open(&gate, Box::new(ScriptedFlasher::new(&[]).0), ACK_TIMEOUT).is_ok());
    }

    #[tokio::test]
    async fn test_failed_ack_send_aborts_unapplied() {
        // Arrange: the client is gone by the time the ACK is sent
        let gate = ExclusivityManager::default();
        let (flasher, log) = ScriptedFlasher::new(&[]);
        let transfer = OtaTransfer::open(&gate, Box::new(flasher), ACK_TIMEOUT).unwrap();
        let Wire {
            mut client_tx,
            client_rx,
            mut server_rx,
            mut server_tx,
        } = wire();
        client_tx.send(vec![1; 16]).await.unwrap();
        client_tx.send(vec![2; 16]).await.unwrap();
        drop(client_rx);

        // Act
        let summary =
            run_ota_session(&mut server_rx, &mut server_tx, transfer, IDLE, "t").await;

        // Assert: only the first chunk was written; nothing was applied
        assert_eq!(summary.state, OtaState::Aborted(Abort::ConnectionLost));
        assert_eq!(log.lock().unwrap().chunks.len(), 1);
        assert!(!log.lock().unwrap().applied);
        assert!(OtaTransfer::open(&gate, Box::new(ScriptedFlasher::new(&[]).0), ACK_TIMEOUT).is_ok());
    }
}
