//! # Node Configuration
//!
//! Transport selection, HTTP bind address and the bus settings, all
//! overridable from the environment.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use coherence_bus::BusConfig;
use thiserror::Error;

/// Default Redis connection URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

/// Default bind address for the health and metrics server.
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8030";

/// Backing store for the bus streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Redis Streams.
    Redis,
    /// Process-local streams, lost on exit.
    Memory,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" | "in-memory" => Ok(Self::Memory),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown transport '{0}', expected 'redis' or 'memory'")]
    UnknownTransport(String),

    #[error("invalid health address '{0}'")]
    InvalidHealthAddr(String),
}

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stream backend.
    pub transport: TransportKind,
    /// Redis URL, used when `transport` is [`TransportKind::Redis`].
    pub redis_url: String,
    /// Bind address for `/health` and `/metrics`.
    pub health_addr: SocketAddr,
    /// Bus settings.
    pub bus: BusConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Redis,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8030)),
            bus: BusConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables.
    ///
    /// - `COHERENCE_TRANSPORT`: `redis` or `memory` (default: redis)
    /// - `COHERENCE_REDIS_URL`: Redis URL (default: `redis://localhost:6379/0`)
    /// - `COHERENCE_HEALTH_ADDR`: HTTP bind address (default: `0.0.0.0:8030`)
    ///
    /// Bus settings come from [`BusConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`NodeConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let transport = match lookup("COHERENCE_TRANSPORT") {
            Some(value) => value.parse()?,
            None => TransportKind::Redis,
        };

        let health_addr = lookup("COHERENCE_HEALTH_ADDR")
            .unwrap_or_else(|| DEFAULT_HEALTH_ADDR.to_string());
        let health_addr = health_addr
            .parse()
            .map_err(|_| ConfigError::InvalidHealthAddr(health_addr))?;

        Ok(Self {
            transport,
            redis_url: lookup("COHERENCE_REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            health_addr,
            bus: BusConfig::from_lookup(&lookup),
        })
    }
}
