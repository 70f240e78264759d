//! Protocol relay use case.
//!
//! A [`RelayTunnel`] bridges one client connection to one device-native
//! connection.  Messages are opaque: each inbound message produces exactly
//! one outbound message with identical bytes, in order, per direction.  Z21
//! and Zusi use the same tunnel; they differ in the [`DeviceEndpoint`] the
//! [`DeviceBus`] opens, in their gate budget, and in how a non-binary client
//! message is treated (Zusi answers `NAK`, Z21 drops it).

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use remise_core::{DeviceEndpoint, ExclusivityManager, GateError, RelayKind, RelaySlot, NAK};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::frames::{FrameSink, FrameSource, Inbound};

/// Both halves of an open device-native connection.
pub struct BusLink {
    pub tx: Box<dyn FrameSink>,
    pub rx: Box<dyn FrameSource>,
}

/// The device-native endpoint could not be reached.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("device bus at {addr} unreachable: {source}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Connector for device-native endpoints.
///
/// The UDP implementation lives in the infrastructure layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceBus: Send + Sync {
    /// Opens a fresh connection to `endpoint`.
    async fn open(&self, endpoint: &DeviceEndpoint) -> Result<BusLink, BusError>;
}

/// Why a tunnel could not be opened.
#[derive(Debug, Error)]
pub enum RelayRefused {
    #[error(transparent)]
    Budget(#[from] GateError),

    #[error(transparent)]
    DeviceUnreachable(#[from] BusError),
}

/// Which side ended a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    DeviceClosed,
    ClientError,
    DeviceError,
    IdleTimeout,
}

/// Accounting of a finished tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub kind: RelayKind,
    pub ended_by: RelayEnd,
    /// Messages forwarded client → device.
    pub to_device: u64,
    /// Messages forwarded device → client.
    pub to_client: u64,
}

// ── RelayTunnel ───────────────────────────────────────────────────────────────

/// An open tunnel holding one relay slot.
pub struct RelayTunnel {
    slot: RelaySlot,
    link: BusLink,
    idle_timeout: Option<Duration>,
}

impl std::fmt::Debug for RelayTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTunnel")
            .field("kind", &self.slot.kind())
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl RelayTunnel {
    /// Takes a relay slot for `endpoint.kind` and connects to the device.
    ///
    /// # Errors
    ///
    /// [`RelayRefused::Budget`] if the gate refuses the slot,
    /// [`RelayRefused::DeviceUnreachable`] if the device bus cannot be
    /// opened.  The slot is released in both cases.
    pub async fn open(
        gate: &ExclusivityManager,
        bus: &dyn DeviceBus,
        endpoint: DeviceEndpoint,
        idle_timeout: Option<Duration>,
    ) -> Result<Self, RelayRefused> {
        let slot = gate.acquire_relay(endpoint.kind)?;
        Self::attach(slot, bus, endpoint, idle_timeout).await
    }

    /// Connects a slot acquired during the connection handshake.
    pub async fn attach(
        slot: RelaySlot,
        bus: &dyn DeviceBus,
        endpoint: DeviceEndpoint,
        idle_timeout: Option<Duration>,
    ) -> Result<Self, RelayRefused> {
        let link = bus.open(&endpoint).await?;
        debug!("relay: {} device bus open at {}", endpoint.kind, endpoint.addr);
        Ok(Self {
            slot,
            link,
            idle_timeout,
        })
    }

    pub fn kind(&self) -> RelayKind {
        self.slot.kind()
    }

    /// Forwards messages in both directions until either side closes or
    /// fails, or the tunnel is idle for longer than its idle timeout.
    ///
    /// The slot is released first, then both connections are closed.
    pub async fn forward(
        self,
        client_rx: &mut dyn FrameSource,
        client_tx: &mut dyn FrameSink,
        session_id: &str,
    ) -> RelayOutcome {
        let RelayTunnel {
            slot,
            link,
            idle_timeout,
        } = self;
        let BusLink {
            tx: mut device_tx,
            rx: mut device_rx,
        } = link;
        let kind = slot.kind();

        let activity = Notify::new();
        let mut to_device = 0u64;
        let mut to_client = 0u64;

        // The client sink is shared: device replies and NAKs both go there.
        let client_sink: SharedSink<'_> = Mutex::new(client_tx);
        let device_sink: SharedSink<'_> = Mutex::new(device_tx.as_mut());
        let nak_to = answers_unsupported_with_nak(kind).then_some(&client_sink);

        let ended_by = tokio::select! {
            end = pump(client_rx, &device_sink, nak_to, &activity, &mut to_device) => match end {
                PumpEnd::SourceClosed => RelayEnd::ClientClosed,
                PumpEnd::SourceError => RelayEnd::ClientError,
                PumpEnd::SinkError => RelayEnd::DeviceError,
            },
            end = pump(device_rx.as_mut(), &client_sink, None, &activity, &mut to_client) => match end {
                PumpEnd::SourceClosed => RelayEnd::DeviceClosed,
                PumpEnd::SourceError => RelayEnd::DeviceError,
                PumpEnd::SinkError => RelayEnd::ClientError,
            },
            _ = watchdog(&activity, idle_timeout) => RelayEnd::IdleTimeout,
        };

        drop(slot);
        if let Err(e) = client_sink.into_inner().close().await {
            debug!("session {session_id}: client close failed: {e}");
        }
        if let Err(e) = device_sink.into_inner().close().await {
            debug!("session {session_id}: device close failed: {e}");
        }

        let outcome = RelayOutcome {
            kind,
            ended_by,
            to_device,
            to_client,
        };
        info!(
            "session {session_id}: {kind} relay ended ({ended_by:?}), {to_device} message(s) to device, {to_client} to client"
        );
        outcome
    }
}

// ── Forwarding ────────────────────────────────────────────────────────────────

type SharedSink<'a> = Mutex<&'a mut dyn FrameSink>;

/// Zusi answers a non-binary client message with `NAK`; Z21 drops it.
fn answers_unsupported_with_nak(kind: RelayKind) -> bool {
    matches!(kind, RelayKind::Zusi)
}

enum PumpEnd {
    SourceClosed,
    SourceError,
    SinkError,
}

/// Moves whole messages from `src` to `dst` until one side stops.
///
/// Non-binary messages are answered with `NAK` on `nak_to` when given,
/// otherwise dropped.
async fn pump(
    src: &mut dyn FrameSource,
    dst: &SharedSink<'_>,
    nak_to: Option<&SharedSink<'_>>,
    activity: &Notify,
    forwarded: &mut u64,
) -> PumpEnd {
    loop {
        match src.recv().await {
            Ok(Some(Inbound::Binary(frame))) => {
                activity.notify_one();
                let len = frame.len();
                if let Err(e) = dst.lock().await.send(frame).await {
                    debug!("relay: forward failed: {e}");
                    return PumpEnd::SinkError;
                }
                *forwarded += 1;
                debug!("relay: forwarded {len} byte message");
            }
            Ok(Some(Inbound::Unsupported(kind))) => match nak_to {
                Some(reply) => {
                    activity.notify_one();
                    warn!("relay: answering {kind} frame with NAK");
                    if let Err(e) = reply.lock().await.send(vec![NAK]).await {
                        debug!("relay: NAK failed: {e}");
                        return PumpEnd::SourceError;
                    }
                }
                None => warn!("relay: ignoring {kind} frame"),
            },
            Ok(None) => return PumpEnd::SourceClosed,
            Err(e) => {
                debug!("relay: receive failed: {e}");
                return PumpEnd::SourceError;
            }
        }
    }
}

/// Resolves once `idle` elapses without activity.  Never resolves when
/// `idle` is `None`.
async fn watchdog(activity: &Notify, idle: Option<Duration>) {
    let Some(idle) = idle else {
        return std::future::pending().await;
    };
    while timeout(idle, activity.notified()).await.is_ok() {}
}

// ── Tests ─────────────────────────────────────────────────────────────────────
