//! remise probe: exercises a command station's WebSocket channels.
//!
//! ```text
//! remise-probe [--host ws://remise.local] ota  <FILE> [--chunk-size 1024]
//! remise-probe [--host ws://remise.local] z21  [--count 10]
//! remise-probe [--host ws://remise.local] zusi [--count 10]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use remise_bridge::infrastructure::probe_client::{
    relay_roundtrips, upload_firmware, zusi_probe_frame, UploadOutcome, Z21_PROBE_FRAME,
};
use remise_core::{ChannelKind, RelayKind};

#[derive(Debug, Parser)]
#[command(
    name = "remise-probe",
    about = "Probe a remise command station's OTA and relay channels",
    version
)]
struct Cli {
    /// Base WebSocket URL of the device.
    #[arg(long, default_value = "ws://remise.local", env = "REMISE_PROBE_HOST")]
    host: String,

    /// Seconds to wait for each reply.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a firmware image over /ota/.
    Ota {
        file: PathBuf,
        #[arg(long, default_value_t = 1024)]
        chunk_size: usize,
    },
    /// Send a Z21 frame over /roco/z21/ and print the replies.
    Z21 {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Send a 100-byte frame over /zimo/zusi/ and print the replies.
    Zusi {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

fn channel_url(host: &str, kind: ChannelKind) -> String {
    format!("{}{}", host.trim_end_matches('/'), kind.path())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let wait = Duration::from_secs(cli.timeout);

    match cli.command {
        Command::Ota { file, chunk_size } => {
            let image = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let url = channel_url(&cli.host, ChannelKind::Ota);
            let report = upload_firmware(&url, &image, chunk_size, wait)
                .await
                .with_context(|| format!("upload to {url} failed"))?;

            match report.outcome {
                UploadOutcome::Completed => println!(
                    "uploaded {} bytes in {} chunks",
                    report.bytes_acked, report.chunks_acked
                ),
                UploadOutcome::Rejected(byte) => println!(
                    "rejected with 0x{byte:02X} after {} acknowledged chunks",
                    report.chunks_acked
                ),
                UploadOutcome::NoReply => println!(
                    "no reply after {} acknowledged chunks",
                    report.chunks_acked
                ),
            }
            println!("Executed in {:.3}s", report.elapsed.as_secs_f64());
        }
        Command::Z21 { count } => {
            relay(&cli.host, RelayKind::Z21, &Z21_PROBE_FRAME, count, wait).await?;
        }
        Command::Zusi { count } => {
            relay(&cli.host, RelayKind::Zusi, &zusi_probe_frame(), count, wait).await?;
        }
    }

    Ok(())
}

async fn relay(
    host: &str,
    kind: RelayKind,
    frame: &[u8],
    count: usize,
    wait: Duration,
) -> anyhow::Result<()> {
    let url = channel_url(host, ChannelKind::Relay(kind));
    let report = relay_roundtrips(&url, frame, count, wait)
        .await
        .with_context(|| format!("{kind} relay via {url} failed"))?;

    for reply in &report.replies {
        match reply {
            Some(bytes) => println!("{bytes:02X?}"),
            None => println!("(no reply)"),
        }
    }
    println!("Executed in {:.3}s", report.elapsed.as_secs_f64());
    Ok(())
}
