//! WebSocket server: accept loop, handshake routing and per-channel tasks.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections.
//! 3. Routing each WebSocket upgrade by request path and taking the matching
//!    token from the exclusivity gate *during* the handshake, so a refused
//!    client gets an HTTP status instead of an accepted-then-closed socket:
//!
//!    | Outcome                   | Response                     |
//!    |---------------------------|------------------------------|
//!    | unknown path              | `404 Not Found`              |
//!    | gate refuses (Busy/Refused) | `503 Service Unavailable`  |
//!    | token granted             | `101 Switching Protocols`    |
//!
//! 4. Running the OTA or relay use case for the accepted channel.
//! 5. Gracefully stopping the accept loop when the `running` flag is cleared.
//!
//! Each connection runs in its own Tokio task; tasks coordinate only through
//! the gate.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use remise_core::{Channel, ChannelKind, ExclusivityManager, OtaLock, RelaySlot};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use crate::application::ota_service::{run_ota_session, FlasherFactory, OtaTransfer};
use crate::application::relay_service::{DeviceBus, RelayTunnel};
use crate::domain::config::BridgeConfig;
use crate::infrastructure::file_flasher::FileFlasher;
use crate::infrastructure::udp_bus::UdpDeviceBus;
use crate::infrastructure::ws_frames::{split_ws, WsFrameSink, WsFrameSource};

// ── Server context ────────────────────────────────────────────────────────────

/// Everything a connection task needs, shared across all tasks.
pub struct ServerContext {
    pub config: Arc<BridgeConfig>,
    pub gate: ExclusivityManager,
    pub bus: Arc<dyn DeviceBus>,
    pub flashers: FlasherFactory,
}

impl ServerContext {
    /// Production wiring: UDP device bus and file-backed flasher.
    pub fn new(config: BridgeConfig) -> Self {
        let gate = ExclusivityManager::new(config.gate_policy());
        let flashers = FileFlasher::factory(config.ota.image_dir.clone(), config.ota.max_image_size);
        Self {
            config: Arc::new(config),
            gate,
            bus: Arc::new(UdpDeviceBus),
            flashers,
        }
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut ws = WebSocketConfig::default();
        ws.max_message_size = Some(self.config.max_message_size);
        ws.max_frame_size = Some(self.config.max_message_size);
        ws
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `config.bind_addr` and serves until `running` is set to `false`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot be bound (e.g. the port is
/// already in use or the process lacks permission to bind port 80).
pub async fn run_server(config: BridgeConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {}", config.bind_addr))?;

    info!("remise bridge listening on {}", config.bind_addr);

    serve(listener, Arc::new(ServerContext::new(config)), running).await
}

/// Runs the accept loop on an already bound listener.
///
/// Split from [`run_server`] so tests can bind `127.0.0.1:0` and inject
/// their own flasher and device bus through `ctx`.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the shutdown flag is checked even when idle.
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                debug!("new connection from {peer_addr}");
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    handle_connection(stream, peer_addr, ctx).await;
                });
            }
            Ok(Err(e)) => {
                error!("accept error: {e}");
            }
            Err(_) => {}
        }
    }

    Ok(())
}

// ── Per-connection handler ────────────────────────────────────────────────────

/// Token taken from the gate during the handshake.
enum Grant {
    Ota(OtaLock),
    Relay(RelaySlot),
}

/// Wraps [`run_connection`] and logs the outcome.
async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, ctx: Arc<ServerContext>) {
    match run_connection(stream, peer_addr, &ctx).await {
        Ok(()) => debug!("connection {peer_addr} finished; gate {:?}", ctx.gate.snapshot()),
        Err(e) => warn!("connection {peer_addr}: {e:#}"),
    }
}

fn refuse(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

/// Resolves the request path to a channel and takes its gate token.
fn route(gate: &ExclusivityManager, path: &str) -> Result<(ChannelKind, Grant), ErrorResponse> {
    let Some(kind) = ChannelKind::from_path(path) else {
        return Err(refuse(StatusCode::NOT_FOUND, format!("no channel at {path}")));
    };
    let grant = match kind {
        ChannelKind::Ota => gate.acquire_ota().map(Grant::Ota),
        ChannelKind::Relay(relay) => gate.acquire_relay(relay).map(Grant::Relay),
    };
    grant
        .map(|grant| (kind, grant))
        .map_err(|e| refuse(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

/// Runs the complete lifecycle of one connection: handshake, routing, and
/// the channel's use case.
///
/// # Errors
///
/// Returns an error if the handshake fails or is refused.
async fn run_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: &ServerContext,
) -> anyhow::Result<()> {
    let mut granted: Option<(ChannelKind, Grant)> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let (kind, grant) = route(&ctx.gate, request.uri().path())?;
        granted = Some((kind, grant));
        Ok(response)
    };

    let ws = accept_hdr_async_with_config(stream, callback, Some(ctx.ws_config()))
        .await
        .with_context(|| format!("WebSocket handshake with {peer_addr} refused or failed"))?;

    let Some((kind, grant)) = granted else {
        anyhow::bail!("handshake with {peer_addr} completed without a channel");
    };

    let channel = Channel::open(kind, peer_addr);
    let session_id = channel.id.to_string();
    info!("session {session_id}: {kind} channel open from {peer_addr}");

    let (mut sink, mut source) = split_ws(ws);
    match grant {
        Grant::Ota(lock) => run_ota_channel(lock, &mut source, &mut sink, ctx, &session_id).await,
        Grant::Relay(slot) => {
            run_relay_channel(slot, &mut source, &mut sink, ctx, &session_id).await
        }
    }

    debug!("session {session_id}: closed after {:?}", channel.age());
    Ok(())
}

async fn run_ota_channel(
    lock: OtaLock,
    source: &mut WsFrameSource<TcpStream>,
    sink: &mut WsFrameSink<TcpStream>,
    ctx: &ServerContext,
    session_id: &str,
) {
    let transfer = OtaTransfer::with_lock(lock, (ctx.flashers)(), ctx.config.ota_ack_timeout());
    run_ota_session(
        source,
        sink,
        transfer,
        ctx.config.ota_idle_timeout(),
        session_id,
    )
    .await;
}

async fn run_relay_channel(
    slot: RelaySlot,
    source: &mut WsFrameSource<TcpStream>,
    sink: &mut WsFrameSink<TcpStream>,
    ctx: &ServerContext,
    session_id: &str,
) {
    let kind = slot.kind();
    let endpoint = ctx.config.endpoint(kind);
    let idle = ctx.config.relay_idle_timeout(kind);

    match RelayTunnel::attach(slot, ctx.bus.as_ref(), endpoint, idle).await {
        Ok(tunnel) => {
            tunnel.forward(source, sink, session_id).await;
        }
        Err(e) => {
            warn!("session {session_id}: {e}");
            if let Err(e) = sink.close_with_error("device bus unreachable").await {
                debug!("session {session_id}: close failed: {e}");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
