//! The peer identity key: an IP address plus a port.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EndpointParseError {
    #[error("missing ':' separator between address and port")]
    MissingSeparator,
    #[error("invalid ip address: {0}")]
    InvalidAddress(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// Stable key used for peer table membership, bans, and cache entries.
/// Two endpoints are equal iff their ip and port match; ipv6 zone ids are
/// not considered (matching `SocketAddr`'s own equality for v6 without a
/// scope id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// `https://<ip>:<port>` formatting used by seed discovery's ranking
    /// output.
    pub fn to_https_url(self) -> String {
        match self.ip {
            IpAddr::V4(ip) => format!("https://{ip}:{}", self.port),
            IpAddr::V6(ip) => format!("https://[{ip}]:{}", self.port),
        }
    }
}

impl From<SocketAddr> for PeerEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

impl FromStr for PeerEndpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let idx = s
            .rfind(':')
            .ok_or(EndpointParseError::MissingSeparator)?;
        let (addr_part, port_part) = (&s[..idx], &s[idx + 1..]);
        let addr_part = addr_part.trim_start_matches('[').trim_end_matches(']');
        let ip = IpAddr::from_str(addr_part)
            .map_err(|_| EndpointParseError::InvalidAddress(addr_part.to_string()))?;
        let port = port_part
            .parse::<u16>()
            .map_err(|_| EndpointParseError::InvalidPort(port_part.to_string()))?;
        Ok(Self { ip, port })
    }
}
