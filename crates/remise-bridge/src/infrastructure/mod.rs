//! Infrastructure layer for remise-bridge.
//!
//! All I/O lives here:
//!
//! - `ws_server`    accept loop, handshake routing, per-channel tasks
//! - `ws_frames`    frame traits over tokio-tungstenite
//! - `udp_bus`      device-native endpoints over UDP
//! - `file_flasher` firmware image written to disk
//! - `probe_client` WebSocket client used by `remise-probe`

pub mod file_flasher;
pub mod probe_client;
pub mod udp_bus;
pub mod ws_frames;
pub mod ws_server;

pub use file_flasher::FileFlasher;
pub use udp_bus::UdpDeviceBus;
pub use ws_server::{run_server, serve, ServerContext};
