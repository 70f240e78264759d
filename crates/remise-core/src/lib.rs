//! # remise-core
//!
//! Shared foundation of the remise transport core: the part of the command
//! station that sits between a network client and the physical device.
//!
//! It has zero dependencies on sockets, async runtimes, or the WebSocket
//! library.  The `remise-bridge` crate wires these types to real I/O.
//!
//! # Architecture overview
//!
//! The command station exposes three raw binary channels:
//!
//! - `/ota/` streams a firmware image to the device flasher, one chunk at a
//!   time, and waits for a single-byte acknowledgment after every chunk.
//! - `/roco/z21/` and `/zimo/zusi/` relay opaque third-party protocol frames
//!   to and from the device's native control bus.
//!
//! The device is one physical resource, so every session must first obtain a
//! token from the [`ExclusivityManager`]: a single flashing lock for OTA, or a
//! bounded per-kind slot for relays.
//!
//! - **`domain`** – channel identity ([`ChannelKind`], [`Channel`]) and the
//!   exclusivity gate.
//! - **`protocol`** – the ACK/NAK control bytes and the OTA transfer state
//!   machine ([`OtaSession`]).

pub mod domain;
pub mod protocol;

pub use domain::channel::{Channel, ChannelKind, ConnectionId, DeviceEndpoint, RelayKind};
pub use domain::gate::{
    BusyCause, ExclusivityManager, GateError, GatePolicy, GateSnapshot, OtaLock, RefusedCause,
    RelayPolicy, RelaySlot,
};
pub use protocol::ack::{Reply, ACK, NAK};
pub use protocol::ota::{Abort, Ack, OtaSession, OtaState, OtaSummary};
