//! Shared primitive types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Monetary amount in atomic units (piconero).
pub type AtomicAmount = u64;

/// One XMR in atomic units.
pub const XMR_ATOMIC_UNITS: u64 = 1_000_000_000_000;

/// Format an atomic amount as a friendly XMR string for operator-facing
/// summaries and log lines.
pub fn format_xmr(amount: AtomicAmount) -> String {
    let whole = amount / XMR_ATOMIC_UNITS;
    let frac = amount % XMR_ATOMIC_UNITS;
    if frac == 0 {
        format!("{}.00 XMR", whole)
    } else {
        let s = format!("{:012}", frac);
        format!("{}.{} XMR", whole, s.trim_end_matches('0'))
    }
}

/// Network address of a peer node (onion or clearnet host plus port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host_name: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host_name: impl Into<String>, port: u16) -> Self {
        Self {
            host_name: host_name.into(),
            port,
        }
    }

    /// Parse a "host:port" string.
    pub fn parse(full: &str) -> Result<Self> {
        let (host, port) = full
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("invalid node address: {}", full)))?;
        if host.is_empty() {
            return Err(Error::InvalidInput(format!("invalid node address: {}", full)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidInput(format!("invalid port in node address: {}", full)))?;
        Ok(Self::new(host, port))
    }

    pub fn full_address(&self) -> String {
        format!("{}:{}", self.host_name, self.port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_name, self.port)
    }
}
