//! UDP device bus.
//!
//! The command station's native Z21 LAN interface is UDP; each datagram is
//! one protocol message, so datagram boundaries give the relay its message
//! boundaries for free.  One connected socket is opened per tunnel, so
//! replies from the device are routed back to the tunnel that asked.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use remise_core::DeviceEndpoint;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::application::frames::{FrameSink, FrameSource, Inbound, TransportError};
use crate::application::relay_service::{BusError, BusLink, DeviceBus};

/// Largest UDP payload.
const MAX_DATAGRAM: usize = 65_507;

/// [`DeviceBus`] that opens a connected UDP socket per tunnel.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpDeviceBus;

#[async_trait]
impl DeviceBus for UdpDeviceBus {
    async fn open(&self, endpoint: &DeviceEndpoint) -> Result<BusLink, BusError> {
        let unreachable = |source: std::io::Error| BusError::Unreachable {
            addr: endpoint.addr,
            source,
        };

        let local: SocketAddr = if endpoint.addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await.map_err(unreachable)?;
        socket.connect(endpoint.addr).await.map_err(unreachable)?;
        debug!(
            "udp bus: {} socket {:?} connected to {}",
            endpoint.kind,
            socket.local_addr().ok(),
            endpoint.addr
        );

        let socket = Arc::new(socket);
        Ok(BusLink {
            tx: Box::new(UdpFrameSink {
                socket: Arc::clone(&socket),
                closed: false,
            }),
            rx: Box::new(UdpFrameSource {
                socket,
                buf: vec![0u8; MAX_DATAGRAM],
            }),
        })
    }
}

struct UdpFrameSource {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
}

struct UdpFrameSink {
    socket: Arc<UdpSocket>,
    closed: bool,
}

#[async_trait]
impl FrameSource for UdpFrameSource {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        let n = self.socket.recv(&mut self.buf).await?;
        Ok(Some(Inbound::Binary(self.buf[..n].to_vec())))
    }
}

#[async_trait]
impl FrameSink for UdpFrameSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionLost("device bus closed".into()));
        }
        self.socket.send(&frame).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
