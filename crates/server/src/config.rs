//! Server configuration from environment variables.

use std::net::SocketAddr;

use anyhow::{bail, Context};

use crate::hub::DEFAULT_OUTBOUND_CAPACITY;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the WebSocket endpoint listens on.
    pub bind_addr: SocketAddr,
    /// Frames buffered per connection before new ones are dropped.
    pub outbound_capacity: usize,
    /// Largest inbound frame accepted; bigger frames close that connection.
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl RelayConfig {
    /// Read configuration from the process environment.
    ///
    /// Environment variables:
    /// - `RELAY_BIND_ADDR`: socket address (default: "0.0.0.0:3001")
    /// - `RELAY_OUTBOUND_CAPACITY`: per-connection queue size, at least 1 (default: 64)
    /// - `RELAY_MAX_FRAME_BYTES`: max inbound frame size in bytes (default: 65536)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = lookup("RELAY_BIND_ADDR") {
            config.bind_addr = addr
                .trim()
                .parse()
                .with_context(|| format!("RELAY_BIND_ADDR is not a socket address: {:?}", addr))?;
        }

        if let Some(capacity) = lookup("RELAY_OUTBOUND_CAPACITY") {
            config.outbound_capacity = parse_size("RELAY_OUTBOUND_CAPACITY", &capacity)?;
        }

        if let Some(max) = lookup("RELAY_MAX_FRAME_BYTES") {
            config.max_frame_bytes = parse_size("RELAY_MAX_FRAME_BYTES", &max)?;
        }

        Ok(config)
    }
}

fn parse_size(key: &str, value: &str) -> anyhow::Result<usize> {
    let parsed: usize = value
        .trim()
        .parse()
        .with_context(|| format!("{} is not a number: {:?}", key, value))?;
    if parsed == 0 {
        bail!("{} must be at least 1", key);
    }
    Ok(parsed)
}
