//! Domain layer for remise-bridge.
//!
//! Only configuration lives here; channel identity, the exclusivity gate and
//! the OTA state machine are in `remise-core` so they can be tested without
//! a runtime.

pub mod config;

pub use config::{BridgeConfig, ConfigError, OtaConfig, RelayConfig, RelayEndpointConfig};
