//! Configuration for the client, server and relay.
//!
//! Every role embeds an [`EngineConfig`] under the `[engine]` table; the
//! role-specific fields sit at the top level of the TOML file.

use crate::buffer::{BUFFER_SIZE, DEFAULT_POOL_CAPACITY};
use crate::link::RetryPolicy;
use crate::proto::HEADER_SIZE;
use crate::scatter::ScatterMode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Largest application datagram that still fits one frame in one buffer.
pub const MAX_UDP_SIZE_LIMIT: usize = BUFFER_SIZE - HEADER_SIZE;

fn default_channel_size() -> usize {
    64
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_udp_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_true() -> bool {
    true
}

fn default_max_udp_size() -> usize {
    1500
}

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

fn default_weight() -> u32 {
    1
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid address {addr:?}: {reason}")]
    BadAddress { addr: String, reason: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("max_udp_size {0} exceeds the limit of {}", MAX_UDP_SIZE_LIMIT)]
    UdpSizeTooLarge(usize),

    #[error("at least one relay peer is required")]
    NoRelayPeers,

    #[error("{0} must be \"tcp\" or \"udp\"")]
    AmbiguousTransport(&'static str),
}

/// Which transports a relay peer is reached over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
    /// One TCP and one UDP link
    #[default]
    Both,
}

impl TransportKind {
    pub fn uses_tcp(self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Both)
    }

    pub fn uses_udp(self) -> bool {
        matches!(self, TransportKind::Udp | TransportKind::Both)
    }
}

/// Which direction of traffic a relay peer carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficDirection {
    #[default]
    Both,
    /// Client to server only
    Up,
    /// Server to client only
    Down,
}

impl TrafficDirection {
    pub fn sends(self) -> bool {
        self != TrafficDirection::Down
    }

    pub fn receives(self) -> bool {
        self != TrafficDirection::Up
    }
}

/// Tuning shared by every role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of every batch queue (per link and application side)
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,

    /// Idle buffers kept by the buffer pool
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Throughput report period; zero disables reporting
    #[serde(default, with = "humantime_serde")]
    pub report_interval: Duration,

    /// Pause between dial attempts
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// Give up on a peer after this many failed retries; unset retries forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Idle time after which a server-side UDP session is evicted
    #[serde(default = "default_udp_timeout", with = "humantime_serde")]
    pub udp_timeout: Duration,

    #[serde(default)]
    pub scatter_mode: ScatterMode,

    #[serde(default = "default_true")]
    pub enable_gro: bool,

    #[serde(default = "default_true")]
    pub enable_gso: bool,

    /// Largest application datagram accepted for tunnelling
    #[serde(default = "default_max_udp_size")]
    pub max_udp_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_size: default_channel_size(),
            pool_capacity: default_pool_capacity(),
            report_interval: Duration::ZERO,
            reconnect_delay: default_reconnect_delay(),
            max_retries: None,
            udp_timeout: default_udp_timeout(),
            scatter_mode: ScatterMode::default(),
            enable_gro: true,
            enable_gso: true,
            max_udp_size: default_max_udp_size(),
        }
    }
}

impl EngineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: self.reconnect_delay,
            max_retries: self.max_retries,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_size == 0 {
            return Err(ConfigError::Zero("channel_size"));
        }
        if self.udp_timeout.is_zero() {
            return Err(ConfigError::Zero("udp_timeout"));
        }
        if self.max_udp_size == 0 {
            return Err(ConfigError::Zero("max_udp_size"));
        }
        if self.max_udp_size > MAX_UDP_SIZE_LIMIT {
            return Err(ConfigError::UdpSizeTooLarge(self.max_udp_size));
        }
        Ok(())
    }
}

/// One relay peer the client keeps links to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayPeer {
    /// `host:port` of the server or a relay in front of it
    pub addr: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// Share of round-robin traffic relative to the other links
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub traffic: TrafficDirection,
}

impl RelayPeer {
    pub fn new(addr: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            addr: addr.into(),
            transport,
            weight: default_weight(),
            traffic: TrafficDirection::default(),
        }
    }
}

/// Configuration for the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Where local applications send the datagrams to tunnel
    pub listen_addr: String,
    pub relay_peers: Vec<RelayPeer>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5353".to_string(),
            relay_peers: vec![RelayPeer::new("127.0.0.1:5000", TransportKind::Both)],
            engine: EngineConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.relay_peers.is_empty() {
            return Err(ConfigError::NoRelayPeers);
        }
        if self.relay_peers.iter().any(|p| p.weight == 0) {
            return Err(ConfigError::Zero("relay peer weight"));
        }
        Ok(())
    }
}

/// Configuration for the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address both the TCP and UDP listeners bind to
    pub listen_addr: String,
    /// The UDP service tunnelled traffic is delivered to
    pub remote_addr: String,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5000".to_string(),
            remote_addr: "127.0.0.1:53".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()
    }
}

/// Configuration for a relay converting one path between TCP and UDP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub listen_transport: TransportKind,
    /// The server (or next relay)
    pub remote_addr: String,
    pub forward_transport: TransportKind,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5001".to_string(),
            listen_transport: TransportKind::Udp,
            remote_addr: "127.0.0.1:5000".to_string(),
            forward_transport: TransportKind::Tcp,
            engine: EngineConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.listen_transport == TransportKind::Both {
            return Err(ConfigError::AmbiguousTransport("listen_transport"));
        }
        if self.forward_transport == TransportKind::Both {
            return Err(ConfigError::AmbiguousTransport("forward_transport"));
        }
        Ok(())
    }
}

/// Resolve `host:port` to the first address it names.
pub async fn resolve_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let bad = |reason: String| ConfigError::BadAddress {
        addr: addr.to_string(),
        reason,
    };
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| bad(e.to_string()))?
        .next()
        .ok_or_else(|| bad("no addresses found".to_string()))
}
