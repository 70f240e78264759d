//! remise bridge: entry point.
//!
//! Serves the command station's WebSocket channels:
//!
//! | Path          | Channel                                  |
//! |---------------|------------------------------------------|
//! | `/ota/`       | chunked firmware update, one ACK per chunk |
//! | `/roco/z21/`  | opaque Z21 relay to the device bus       |
//! | `/zimo/zusi/` | opaque Zusi relay to the device bus      |
//!
//! # Usage
//!
//! ```text
//! remise-bridge [OPTIONS]
//!
//! Options:
//!   --config        <PATH>  TOML configuration file
//!   --bind          <ADDR>  WebSocket listen address [default: 0.0.0.0:80]
//!   --log-level     <LVL>   Default log level when RUST_LOG is unset [default: info]
//!   --image-dir     <PATH>  Firmware image directory [default: ./firmware]
//!   --ack-timeout   <SECS>  Flasher reply timeout per chunk [default: 5]
//!   --z21-endpoint  <ADDR>  Z21 device-bus address [default: 127.0.0.1:21105]
//!   --zusi-endpoint <ADDR>  Zusi device-bus address [default: 127.0.0.1:21106]
//! ```
//!
//! # Precedence
//!
//! CLI arguments, then `REMISE_*` environment variables, then the config
//! file, then built-in defaults.
//!
//! | Variable               | Option            |
//! |------------------------|-------------------|
//! | `REMISE_CONFIG`        | `--config`        |
//! | `REMISE_BIND`          | `--bind`          |
//! | `REMISE_LOG_LEVEL`     | `--log-level`     |
//! | `REMISE_IMAGE_DIR`     | `--image-dir`     |
//! | `REMISE_ACK_TIMEOUT`   | `--ack-timeout`   |
//! | `REMISE_Z21_ENDPOINT`  | `--z21-endpoint`  |
//! | `REMISE_ZUSI_ENDPOINT` | `--zusi-endpoint` |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use remise_bridge::domain::BridgeConfig;
use remise_bridge::infrastructure::run_server;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// remise command station WebSocket bridge.
#[derive(Debug, Parser)]
#[command(
    name = "remise-bridge",
    about = "WebSocket firmware-update and protocol-relay service for the remise command station",
    version
)]
struct Cli {
    /// TOML configuration file.  Settings given on the command line win.
    #[arg(long, env = "REMISE_CONFIG")]
    config: Option<PathBuf>,

    /// Address the WebSocket server listens on.
    #[arg(long, env = "REMISE_BIND")]
    bind: Option<SocketAddr>,

    /// Default log level when `RUST_LOG` is not set.
    #[arg(long, env = "REMISE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Directory the received firmware image is written to.
    #[arg(long, env = "REMISE_IMAGE_DIR")]
    image_dir: Option<PathBuf>,

    /// Seconds to wait for the flasher's reply to one chunk.
    #[arg(long, env = "REMISE_ACK_TIMEOUT")]
    ack_timeout: Option<u64>,

    /// UDP address of the device's Z21 endpoint.
    #[arg(long, env = "REMISE_Z21_ENDPOINT")]
    z21_endpoint: Option<SocketAddr>,

    /// UDP address of the device's Zusi endpoint.
    #[arg(long, env = "REMISE_ZUSI_ENDPOINT")]
    zusi_endpoint: Option<SocketAddr>,
}

impl Cli {
    /// Builds the effective [`BridgeConfig`]: file (or defaults) overlaid
    /// with whatever was given on the command line or in the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded or the merged
    /// configuration is out of range.
    fn into_bridge_config(self) -> anyhow::Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => BridgeConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(dir) = self.image_dir {
            config.ota.image_dir = dir;
        }
        if let Some(secs) = self.ack_timeout {
            config.ota.ack_timeout_secs = secs;
        }
        if let Some(addr) = self.z21_endpoint {
            config.relay.z21.endpoint = Some(addr);
        }
        if let Some(addr) = self.zusi_endpoint {
            config.relay.zusi.endpoint = Some(addr);
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_bridge_config()?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        "remise bridge starting: bind={}, z21={}, zusi={}, images={}",
        config.bind_addr,
        config.endpoint(remise_core::RelayKind::Z21).addr,
        config.endpoint(remise_core::RelayKind::Zusi).addr,
        config.ota.image_dir.display()
    );

    // ── Graceful shutdown flag ─────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    run_server(config, running).await?;

    info!("remise bridge stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
