//! Protocol layer: control bytes and the OTA transfer state machine.
//!
//! - [`ack`] defines the single-byte acknowledgment values.
//! - [`ota`] defines [`OtaSession`], the `Idle → Streaming → Completed |
//!   Aborted` state machine that the bridge drives over a real connection.

pub mod ack;
pub mod ota;

pub use ack::{Reply, ACK, NAK};
pub use ota::{Abort, Ack, OtaSession, OtaState, OtaSummary};
