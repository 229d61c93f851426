//! One server endpoint: an address, its metadata, and its two bridges.

use crate::bridge::{Bridge, BridgeEvent};
use crate::core::config::Options;
use crate::core::error::ConnectionRole;
use crate::core::time::TickClock;
use crate::protocol::RespVersion;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a server identified itself as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerRole {
    /// Not yet probed.
    Unknown = 0,
    /// A writable primary.
    Primary = 1,
    /// A read-only replica.
    Replica = 2,
    /// A sentinel monitor.
    Sentinel = 3,
    /// A cluster member (primary or replica; slot ownership decides).
    ClusterNode = 4,
}

impl ServerRole {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Primary,
            2 => Self::Replica,
            3 => Self::Sentinel,
            4 => Self::ClusterNode,
            _ => Self::Unknown,
        }
    }

    /// Whether writes may be routed here.
    pub fn accepts_writes(self) -> bool {
        matches!(self, Self::Primary | Self::ClusterNode | Self::Unknown)
    }
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Primary => "primary",
            Self::Replica => "replica",
            Self::Sentinel => "sentinel",
            Self::ClusterNode => "cluster-node",
        };
        write!(f, "{}", s)
    }
}

/// A parsed server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ServerVersion {
    /// Major component.
    pub major: u16,
    /// Minor component.
    pub minor: u16,
    /// Patch component.
    pub patch: u16,
}

impl ServerVersion {
    /// Parse `"7.2.4"` shapes; missing components default to zero.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    const fn at_least(self, major: u16, minor: u16) -> bool {
        self.major > major || (self.major == major && self.minor >= minor)
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Capability bits derived from the server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerFeatures(u32);

impl ServerFeatures {
    /// `HELLO` / RESP3 (6.0+).
    pub const RESP3: Self = Self(1 << 0);
    /// `CLIENT SETINFO` (7.2+).
    pub const CLIENT_SETINFO: Self = Self(1 << 1);
    /// Sharded pub/sub (`SSUBSCRIBE`, 7.0+).
    pub const SHARDED_PUBSUB: Self = Self(1 << 2);

    /// Features implied by a server version.
    pub fn from_version(version: ServerVersion) -> Self {
        let mut bits = 0;
        if version.at_least(6, 0) {
            bits |= Self::RESP3.0;
        }
        if version.at_least(7, 0) {
            bits |= Self::SHARDED_PUBSUB.0;
        }
        if version.at_least(7, 2) {
            bits |= Self::CLIENT_SETINFO.0;
        }
        Self(bits)
    }

    /// Whether every bit of `feature` is present.
    pub const fn supports(self, feature: Self) -> bool {
        self.0 & feature.0 == feature.0
    }
}

/// An address plus its interactive and subscription bridges and learned
/// server identity. Owned exclusively by the multiplexer.
pub struct ServerEndpoint {
    address: String,
    role: AtomicU8,
    version: RwLock<Option<ServerVersion>>,
    features: AtomicU32,
    resp: AtomicU8,
    tiebreaker_value: Mutex<Option<Bytes>>,
    interactive: Arc<Bridge>,
    subscription: Arc<Bridge>,
}

impl std::fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("address", &self.address)
            .field("role", &self.role())
            .field("version", &*self.version.read())
            .finish()
    }
}

impl ServerEndpoint {
    /// Create the endpoint and start both bridges connecting.
    pub fn connect(
        address: String,
        options: Arc<Options>,
        clock: TickClock,
        events: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Arc<Self> {
        let interactive = Bridge::connect(
            address.clone(),
            ConnectionRole::Interactive,
            options.clone(),
            clock,
            events.clone(),
        );
        let subscription = Bridge::connect(
            address.clone(),
            ConnectionRole::Subscription,
            options,
            clock,
            events,
        );
        Arc::new(Self {
            address,
            role: AtomicU8::new(ServerRole::Unknown as u8),
            version: RwLock::new(None),
            features: AtomicU32::new(0),
            resp: AtomicU8::new(0),
            tiebreaker_value: Mutex::new(None),
            interactive,
            subscription,
        })
    }

    /// The `host:port` address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The bridge serving the given connection role.
    pub fn bridge(&self, role: ConnectionRole) -> &Arc<Bridge> {
        match role {
            ConnectionRole::Interactive => &self.interactive,
            ConnectionRole::Subscription => &self.subscription,
        }
    }

    /// Current believed role.
    pub fn role(&self) -> ServerRole {
        ServerRole::from_u8(self.role.load(Ordering::Acquire))
    }

    /// Update the believed role.
    pub fn set_role(&self, role: ServerRole) {
        let prev = self.role.swap(role as u8, Ordering::AcqRel);
        if prev != role as u8 {
            tracing::info!(
                endpoint = %self.address,
                from = %ServerRole::from_u8(prev),
                to = %role,
                "endpoint role change"
            );
        }
    }

    /// Learned server version, if probed.
    pub fn version(&self) -> Option<ServerVersion> {
        *self.version.read()
    }

    /// Capability bits.
    pub fn features(&self) -> ServerFeatures {
        ServerFeatures(self.features.load(Ordering::Acquire))
    }

    /// Negotiated protocol on the interactive bridge, once established.
    pub fn resp(&self) -> Option<RespVersion> {
        match self.resp.load(Ordering::Acquire) {
            2 => Some(RespVersion::Resp2),
            3 => Some(RespVersion::Resp3),
            _ => None,
        }
    }

    /// Record a version learned from a topology probe.
    pub fn set_version(&self, version: ServerVersion) {
        *self.version.write() = Some(version);
        self.features
            .store(ServerFeatures::from_version(version).0, Ordering::Release);
    }

    /// Record what a completed handshake learned.
    pub fn note_established(&self, resp: RespVersion, server_version: Option<&str>) {
        self.resp.store(
            match resp {
                RespVersion::Resp2 => 2,
                RespVersion::Resp3 => 3,
            },
            Ordering::Release,
        );
        if let Some(parsed) = server_version.and_then(ServerVersion::parse) {
            *self.version.write() = Some(parsed);
            self.features
                .store(ServerFeatures::from_version(parsed).0, Ordering::Release);
        }
    }

    /// The tiebreaker value read from this endpoint, if any.
    pub fn tiebreaker_value(&self) -> Option<Bytes> {
        self.tiebreaker_value.lock().clone()
    }

    /// Record the tiebreaker value observed on this endpoint.
    pub fn set_tiebreaker_value(&self, value: Option<Bytes>) {
        *self.tiebreaker_value.lock() = value;
    }

    /// Whether the interactive bridge serves traffic.
    pub fn is_connected(&self) -> bool {
        self.interactive.is_established()
    }

    /// Close both bridges.
    pub async fn close(&self, allow_pending: bool) {
        self.interactive.close(allow_pending).await;
        self.subscription.close(false).await;
    }
}
