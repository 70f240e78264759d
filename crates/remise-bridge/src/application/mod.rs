//! Application layer for remise-bridge.
//!
//! The OTA and relay use cases, written against the [`frames`] transport
//! traits, the [`ota_service::Flasher`] write target and the
//! [`relay_service::DeviceBus`] connector.  Nothing here opens a socket.

pub mod frames;
pub mod ota_service;
pub mod relay_service;

pub use frames::{frame_channel, FrameSink, FrameSource, Inbound, TransportError};
pub use ota_service::{run_ota_session, FlashError, Flasher, FlasherFactory, OtaTransfer};
pub use relay_service::{
    BusError, BusLink, DeviceBus, RelayEnd, RelayOutcome, RelayRefused, RelayTunnel,
};
