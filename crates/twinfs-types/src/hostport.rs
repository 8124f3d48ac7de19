use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A `host:port` pair as it appears in configuration and in the coordination
/// service, before DNS resolution.
///
/// The host is kept as a string on purpose: metadata servers are addressed by
/// name, and the data node must be able to re-resolve a name whose A record
/// changed (e.g. after a failover to new hardware). Equality and hashing are
/// case-insensitive on the host part, matching how the coordinator publishes
/// primary addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPort {
    host: String,
    port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return a copy with a different port. Used to derive the admin-protocol
    /// address from the data-protocol address.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }

    /// If the host is already a literal IP address, return the socket address
    /// without consulting DNS.
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl PartialEq for HostPort {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl Eq for HostPort {}

impl std::hash::Hash for HostPort {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.to_ascii_lowercase().hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostPort {
    type Err = HostPortParseError;

    /// Parse an address string like `"nn1.example.com:8020"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port_str) = s.rsplit_once(':').ok_or(HostPortParseError::MissingPort)?;
        if host.is_empty() {
            return Err(HostPortParseError::EmptyHost);
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| HostPortParseError::InvalidPort(port_str.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Errors when parsing a `HostPort` from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostPortParseError {
    #[error("missing ':port' suffix")]
    MissingPort,
    #[error("empty host")]
    EmptyHost,
    #[error("invalid port number: {0}")]
    InvalidPort(String),
}
