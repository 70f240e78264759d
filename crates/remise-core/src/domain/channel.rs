//! Channel identity: which logical channel a connection belongs to.
//!
//! A client selects the channel by the request path of its WebSocket upgrade.
//! The command station registers each channel as a wildcard (`/ota/*`), so any
//! path *below* the channel prefix selects that channel too:
//!
//! | Path            | Channel                         |
//! |-----------------|---------------------------------|
//! | `/ota/`         | [`ChannelKind::Ota`]            |
//! | `/roco/z21/`    | [`ChannelKind::Relay`] (Z21)    |
//! | `/zimo/zusi/`   | [`ChannelKind::Relay`] (Zusi)   |

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use uuid::Uuid;

/// Unique identifier of one accepted connection.
pub type ConnectionId = Uuid;

/// The two third-party control protocols the device can relay.
///
/// Both share the same tunneling algorithm; they differ only in the device-bus
/// endpoint they address and in their concurrency budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayKind {
    /// Roco Z21 LAN protocol.
    Z21,
    /// ZIMO Zusi decoder-update protocol.
    Zusi,
}

impl RelayKind {
    /// Every relay kind, in a stable order.
    pub const ALL: [RelayKind; Self::COUNT] = [RelayKind::Z21, RelayKind::Zusi];

    /// Number of relay kinds.
    pub const COUNT: usize = 2;

    /// Short lowercase name used in logs and configuration keys.
    pub fn name(self) -> &'static str {
        match self {
            RelayKind::Z21 => "z21",
            RelayKind::Zusi => "zusi",
        }
    }

    /// Canonical request path of this relay channel.
    pub fn path(self) -> &'static str {
        match self {
            RelayKind::Z21 => "/roco/z21/",
            RelayKind::Zusi => "/zimo/zusi/",
        }
    }

    /// Dense index for per-kind tables.
    pub(crate) fn index(self) -> usize {
        match self {
            RelayKind::Z21 => 0,
            RelayKind::Zusi => 1,
        }
    }
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which logical channel a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Firmware update channel (`/ota/`).
    Ota,
    /// Opaque protocol relay (`/roco/z21/` or `/zimo/zusi/`).
    Relay(RelayKind),
}

impl ChannelKind {
    /// Canonical request path of the firmware update channel.
    pub const OTA_PATH: &'static str = "/ota/";

    /// Resolves a request path (optionally carrying a query string) to a
    /// channel.
    ///
    /// Returns `None` for paths that belong to no channel, including paths
    /// that merely share a textual prefix (`/otafoo`).
    ///
    /// # Example
    ///
    /// ```rust
    /// use remise_core::{ChannelKind, RelayKind};
    ///
    /// assert_eq!(ChannelKind::from_path("/ota/"), Some(ChannelKind::Ota));
    /// assert_eq!(
    ///     ChannelKind::from_path("/roco/z21"),
    ///     Some(ChannelKind::Relay(RelayKind::Z21))
    /// );
    /// assert_eq!(ChannelKind::from_path("/dcc/locos/3"), None);
    /// ```
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split_once('?').map_or(path, |(p, _)| p);

        [
            ChannelKind::Ota,
            ChannelKind::Relay(RelayKind::Z21),
            ChannelKind::Relay(RelayKind::Zusi),
        ]
        .into_iter()
        .find(|kind| {
            let base = kind.path().trim_end_matches('/');
            path.strip_prefix(base)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    /// Canonical request path of this channel.
    pub fn path(self) -> &'static str {
        match self {
            ChannelKind::Ota => Self::OTA_PATH,
            ChannelKind::Relay(kind) => kind.path(),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Ota => f.write_str("ota"),
            ChannelKind::Relay(kind) => write!(f, "relay-{kind}"),
        }
    }
}

/// One accepted connection bound to a channel.
///
/// Created when the WebSocket upgrade is accepted, dropped when the session
/// task ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Which channel the connection speaks.
    pub kind: ChannelKind,
    /// Unique identity used in every log line of the session.
    pub id: ConnectionId,
    /// Remote address of the client.
    pub peer: SocketAddr,
    /// Wall-clock time the connection was accepted.
    pub opened_at: SystemTime,
}

impl Channel {
    /// Creates the channel record for a freshly accepted connection.
    pub fn open(kind: ChannelKind, peer: SocketAddr) -> Self {
        Self {
            kind,
            id: Uuid::new_v4(),
            peer,
            opened_at: SystemTime::now(),
        }
    }

    /// How long the channel has been open.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed().unwrap_or_default()
    }
}

/// Address of the device-native endpoint a relay kind forwards to.
///
/// The relay never looks inside frames; this descriptor is the only thing
/// that differs between a Z21 tunnel and a Zusi tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEndpoint {
    /// Relay kind served by this endpoint.
    pub kind: RelayKind,
    /// Network address of the device bus.
    pub addr: SocketAddr,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
