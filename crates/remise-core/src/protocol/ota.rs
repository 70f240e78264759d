//! OTA transfer state machine.
//!
//! An [`OtaSession`] tracks one firmware upload from the moment the flashing
//! lock is granted until the connection closes:
//!
//! ```text
//!            begin_chunk            on_end_of_stream
//!   Idle ───────────────▶ Streaming ─────────────────▶ Completed
//!     │                      │  ▲
//!     │                      │  │ on_reply(ACK)
//!     │                      └──┘
//!     │   abort / on_reply(≠ACK) / timeout
//!     └──────────────────────┴──────────────────────▶ Aborted(reason)
//! ```
//!
//! The machine owns the [`OtaLock`]: closing the session (or dropping it)
//! returns the lock to the gate on every path.
//!
//! Pacing is strict stop-and-wait.  [`OtaSession::begin_chunk`] refuses a
//! second chunk while one is still awaiting its reply, so a well-behaved
//! driver never has more than one chunk in flight.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use super::ack::Reply;
use crate::domain::gate::{ExclusivityManager, GateError, OtaLock};

/// Why an OTA session ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Abort {
    /// The device answered a chunk with this non-ACK byte.
    #[error("device rejected chunk with 0x{0:02X}")]
    Rejected(u8),

    /// The device did not answer a chunk in time.
    #[error("device did not acknowledge chunk in time")]
    AckTimeout,

    /// The client connection dropped or failed mid-transfer.
    #[error("client connection lost")]
    ConnectionLost,

    /// The client stopped sending for longer than the idle timeout.
    #[error("client idle timeout")]
    ClientTimeout,

    /// The client sent a non-binary frame.
    #[error("client sent a non-binary frame")]
    UnsupportedFrame,

    /// The client sent another message before its chunk was answered.
    #[error("client sent a message before the previous chunk was answered")]
    OutOfTurn,

    /// The received image could not be applied after the upload finished.
    #[error("firmware image could not be applied")]
    ApplyFailed,

    /// An operation was attempted in a state that does not allow it.
    #[error("operation not valid in the current session state")]
    NotStreaming,
}

/// Marker returned when a chunk has been acknowledged and the next one may be
/// sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

/// Lifecycle state of an OTA session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    /// Lock held, no chunk received yet.
    Idle,
    /// At least one chunk has been received.
    Streaming,
    /// The client closed the stream cleanly after its last chunk was
    /// acknowledged.
    Completed,
    /// The transfer ended early.
    Aborted(Abort),
}

impl OtaState {
    /// `true` for `Completed` and `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, OtaState::Completed | OtaState::Aborted(_))
    }
}

/// Final accounting of a closed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaSummary {
    pub state: OtaState,
    /// Bytes of acknowledged chunks.
    pub bytes_received: u64,
    /// Number of acknowledged chunks.
    pub round_trips: u32,
    pub duration: Duration,
}

/// One firmware upload.
#[derive(Debug)]
pub struct OtaSession {
    lock: OtaLock,
    state: OtaState,
    bytes_received: u64,
    round_trips: u32,
    in_flight: Option<usize>,
    last_chunk_at: Option<Instant>,
    opened_at: Instant,
}

impl OtaSession {
    /// Acquires the flashing lock and starts a session in `Idle`.
    ///
    /// # Errors
    ///
    /// Propagates [`GateError::Busy`] when the lock is unavailable.
    pub fn open(gate: &ExclusivityManager) -> Result<Self, GateError> {
        gate.acquire_ota().map(Self::from_lock)
    }

    /// Starts a session around a lock acquired elsewhere (typically during
    /// the connection handshake).
    pub fn from_lock(lock: OtaLock) -> Self {
        Self {
            lock,
            state: OtaState::Idle,
            bytes_received: 0,
            round_trips: 0,
            in_flight: None,
            last_chunk_at: None,
            opened_at: Instant::now(),
        }
    }

    /// Registers a chunk of `len` bytes as forwarded to the device and
    /// awaiting its reply.
    ///
    /// # Errors
    ///
    /// [`Abort::NotStreaming`] if the session is terminal or a previous
    /// chunk is still awaiting its reply.
    pub fn begin_chunk(&mut self, len: usize) -> Result<(), Abort> {
        match self.state {
            OtaState::Idle | OtaState::Streaming if self.in_flight.is_none() => {
                self.state = OtaState::Streaming;
                self.in_flight = Some(len);
                self.last_chunk_at = Some(Instant::now());
                Ok(())
            }
            _ => Err(Abort::NotStreaming),
        }
    }

    /// Applies the device's reply to the chunk in flight.
    ///
    /// `ACK` keeps the session streaming; any other byte or a timeout aborts
    /// it.
    ///
    /// # Errors
    ///
    /// - [`Abort::Rejected`] for a non-ACK byte.
    /// - [`Abort::AckTimeout`] for [`Reply::Timeout`].
    /// - [`Abort::NotStreaming`] if no chunk is in flight.
    pub fn on_reply(&mut self, reply: Reply) -> Result<Ack, Abort> {
        let Some(len) = self.in_flight.take() else {
            return Err(Abort::NotStreaming);
        };

        match reply {
            Reply::Byte(_) if reply.is_ack() => {
                self.bytes_received += len as u64;
                self.round_trips += 1;
                debug!(
                    "ota: chunk {} acknowledged ({} bytes total)",
                    self.round_trips, self.bytes_received
                );
                Ok(Ack)
            }
            Reply::Byte(byte) => Err(self.abort(Abort::Rejected(byte))),
            Reply::Timeout => Err(self.abort(Abort::AckTimeout)),
        }
    }

    /// The client closed the stream.
    ///
    /// Completes the session, unless a chunk is still awaiting its reply, in
    /// which case the transfer is incomplete and the session aborts with
    /// [`Abort::ConnectionLost`].  A terminal session is left unchanged.
    pub fn on_end_of_stream(&mut self) -> OtaState {
        if !self.state.is_terminal() {
            if self.in_flight.is_some() {
                self.abort(Abort::ConnectionLost);
            } else {
                self.state = OtaState::Completed;
            }
        }
        self.state
    }

    /// Aborts the session with `reason` and returns it.
    ///
    /// The first terminal state wins: aborting an already-terminal session
    /// keeps the original outcome.
    pub fn abort(&mut self, reason: Abort) -> Abort {
        if !self.state.is_terminal() {
            warn!("ota: session aborted: {reason}");
            self.state = OtaState::Aborted(reason);
            self.in_flight = None;
        }
        reason
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn round_trips(&self) -> u32 {
        self.round_trips
    }

    /// Time since the last chunk was forwarded, or since the session opened
    /// when nothing has been sent yet.
    pub fn idle_for(&self) -> Duration {
        self.last_chunk_at.unwrap_or(self.opened_at).elapsed()
    }

    /// Ends the session and returns the flashing lock to the gate.
    ///
    /// A session that was never driven to a terminal state is recorded as
    /// aborted with [`Abort::ConnectionLost`].
    pub fn close(mut self) -> OtaSummary {
        if !self.state.is_terminal() {
            self.abort(Abort::ConnectionLost);
        }
        let summary = OtaSummary {
            state: self.state,
            bytes_received: self.bytes_received,
            round_trips: self.round_trips,
            duration: self.opened_at.elapsed(),
        };
        drop(self.lock);
        summary
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ack::{ACK, NAK};

    fn open_session() -> (ExclusivityManager, OtaSession) {
        let gate = ExclusivityManager::default();
        let session = OtaSession::open(&gate).unwrap();
        (gate, session)
    }

    #[test]
    fn test_new_session_is_idle() {
        let (_gate, session) = open_session();
        assert_eq!(session.state(), OtaState::Idle);
        assert_eq!(session.bytes_received(), 0);
    }

    #[test]
    fn test_first_chunk_moves_to_streaming() {
        let (_gate, mut session) = open_session();
        session.begin_chunk(1024).unwrap();
        assert_eq!(session.state(), OtaState::Streaming);
    }

    #[test]
    fn test_ack_accumulates_bytes_and_round_trips() {
        // Arrange
        let (_gate, mut session) = open_session();

        // Act
        for _ in 0..3 {
            session.begin_chunk(1024).unwrap();
            session.on_reply(Reply::Byte(ACK)).unwrap();
        }

        // Assert
        assert_eq!(session.bytes_received(), 3072);
        assert_eq!(session.round_trips(), 3);
        assert_eq!(session.state(), OtaState::Streaming);
    }

    #[test]
    fn test_second_chunk_before_reply_is_refused() {
        let (_gate, mut session) = open_session();
        session.begin_chunk(10).unwrap();
        assert_eq!(session.begin_chunk(10), Err(Abort::NotStreaming));
    }

    #[test]
    fn test_nak_aborts_with_rejected_byte() {
        let (_gate, mut session) = open_session();
        session.begin_chunk(10).unwrap();

        let result = session.on_reply(Reply::Byte(NAK));

        assert_eq!(result, Err(Abort::Rejected(NAK)));
        assert_eq!(session.state(), OtaState::Aborted(Abort::Rejected(NAK)));
        // Rejected chunks do not count.
        assert_eq!(session.bytes_received(), 0);
    }

    #[test]
    fn test_any_non_ack_byte_aborts() {
        let (_gate, mut session) = open_session();
        session.begin_chunk(10).unwrap();
        assert_eq!(
            session.on_reply(Reply::Byte(0x00)),
            Err(Abort::Rejected(0x00))
        );
    }

    #[test]
    fn test_timeout_aborts() {
        let (_gate, mut session) = open_session();
        session.begin_chunk(10).unwrap();
        assert_eq!(session.on_reply(Reply::Timeout), Err(Abort::AckTimeout));
        assert_eq!(session.state(), OtaState::Aborted(Abort::AckTimeout));
    }

    #[test]
    fn test_reply_without_chunk_is_refused() {
        let (_gate, mut session) = open_session();
        assert_eq!(session.on_reply(Reply::Byte(ACK)), Err(Abort::NotStreaming));
    }

    #[test]
    fn test_no_chunk_accepted_after_abort() {
        let (_gate, mut session) = open_session();
        session.abort(Abort::UnsupportedFrame);
        assert_eq!(session.begin_chunk(10), Err(Abort::NotStreaming));
    }

    #[test]
    fn test_end_of_stream_completes_after_ack() {
        let (_gate, mut session) = open_session();
        session.begin_chunk(10).unwrap();
        session.on_reply(Reply::Byte(ACK)).unwrap();
        assert_eq!(session.on_end_of_stream(), OtaState::Completed);
    }

    #[test]
    fn test_end_of_stream_with_chunk_in_flight_is_connection_lost() {
        let (_gate, mut session) = open_session();
        session.begin_chunk(10).unwrap();
        assert_eq!(
            session.on_end_of_stream(),
            OtaState::Aborted(Abort::ConnectionLost)
        );
    }

    #[test]
    fn test_empty_upload_completes() {
        let (_gate, mut session) = open_session();
        assert_eq!(session.on_end_of_stream(), OtaState::Completed);
    }

    #[test]
    fn test_first_abort_reason_wins() {
        let (_gate, mut session) = open_session();
        session.abort(Abort::ClientTimeout);
        session.abort(Abort::ConnectionLost);
        assert_eq!(session.state(), OtaState::Aborted(Abort::ClientTimeout));
    }

    #[test]
    fn test_close_releases_lock() {
        // Arrange
        let (gate, mut session) = open_session();
        session.begin_chunk(10).unwrap();
        session.on_reply(Reply::Byte(ACK)).unwrap();
        session.on_end_of_stream();

        // Act
        let summary = session.close();

        // Assert
        assert_eq!(summary.state, OtaState::Completed);
        assert_eq!(summary.bytes_received, 10);
        assert!(!gate.snapshot().ota_active);
        assert!(gate.acquire_ota().is_ok());
    }

    #[test]
    fn test_close_of_unfinished_session_records_connection_lost() {
        let (_gate, session) = open_session();
        let summary = session.close();
        assert_eq!(summary.state, OtaState::Aborted(Abort::ConnectionLost));
    }

    #[test]
    fn test_open_while_locked_is_busy() {
        let (gate, _session) = open_session();
        assert!(OtaSession::open(&gate).is_err());
    }
}
