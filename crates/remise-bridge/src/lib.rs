//! remise-bridge library crate.
//!
//! The network-facing transport core of the remise command station: a
//! firmware update channel and two protocol relays, all over WebSocket.
//!
//! # Architecture
//!
//! ```text
//! Client (binary WebSocket messages)
//!         ↕
//! [remise-bridge]
//!   ├── domain/           BridgeConfig (TOML + defaults)
//!   ├── application/      OTA transfer, relay tunnel, frame traits
//!   └── infrastructure/
//!         ├── ws_server/  accept loop + handshake routing (tokio-tungstenite)
//!         ├── udp_bus/    device-native Z21 / Zusi endpoints
//!         └── file_flasher/ firmware image on disk
//!         ↕
//! Device (native control bus, flash)
//! ```
//!
//! # Layer rules
//!
//! - `domain` performs no I/O beyond reading its config file.
//! - `application` depends on `domain` and `remise-core` only; it talks to
//!   the outside world through traits.
//! - `infrastructure` implements those traits with `tokio` and `tungstenite`.

/// Domain layer: configuration.
pub mod domain;

/// Application layer: OTA and relay use cases.
pub mod application;

/// Infrastructure layer: sockets, files, and the WebSocket server.
pub mod infrastructure;
