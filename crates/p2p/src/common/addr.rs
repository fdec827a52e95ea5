//! Overlay node addresses.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Address of a node on the anonymizing overlay.
///
/// Addresses are opaque to the core: a host string naming a hidden service
/// and a virtual port. Two addresses are equal iff their full `host:port`
/// rendering is equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayAddr {
    host: String,
    port: u16,
}

impl OverlayAddr {
    /// Create a new overlay address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host part of the address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The virtual port of the address.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The full `host:port` rendering. This is the address's identity.
    pub fn full(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for OverlayAddr {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for OverlayAddr {}

impl Hash for OverlayAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for OverlayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An error parsing an overlay address from its full string form.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddrParseError {
    /// The address has no `:port` suffix.
    #[error("missing port in address")]
    MissingPort,
    /// The port is not a valid 16-bit number.
    #[error("invalid port in address")]
    InvalidPort,
    /// The host part is empty.
    #[error("empty host in address")]
    EmptyHost,
}

impl FromStr for OverlayAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or(AddrParseError::MissingPort)?;

        if host.is_empty() {
            return Err(AddrParseError::EmptyHost);
        }
        let port = port.parse().map_err(|_| AddrParseError::InvalidPort)?;

        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let addr: OverlayAddr = "3g2upl4pq6kufc4m.onion:9999".parse().unwrap();

        assert_eq!(addr.host(), "3g2upl4pq6kufc4m.onion");
        assert_eq!(addr.port(), 9999);
        assert_eq!(addr.full().parse::<OverlayAddr>().unwrap(), addr);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "no-port-here".parse::<OverlayAddr>(),
            Err(AddrParseError::MissingPort)
        );
        assert_eq!(
            ":1234".parse::<OverlayAddr>(),
            Err(AddrParseError::EmptyHost)
        );
        assert_eq!(
            "host:notaport".parse::<OverlayAddr>(),
            Err(AddrParseError::InvalidPort)
        );
        assert_eq!(
            "host:99999".parse::<OverlayAddr>(),
            Err(AddrParseError::InvalidPort)
        );
    }

    #[test]
    fn test_equality_is_by_full_string() {
        let a = OverlayAddr::new("duskwood.onion", 8000);
        let b: OverlayAddr = "duskwood.onion:8000".parse().unwrap();
        let c = OverlayAddr::new("duskwood.onion", 8001);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.full(), b.full());
    }
}
