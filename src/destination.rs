//! Destinations, and the addresses they resolve to.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// The target of a connection: `(host, port, is_secure)`.
///
/// Pooling and per-host limits are keyed by all three fields, so a plain and
/// a TLS connection to the same host never share idle connections.
#[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct Destination {
    host: Arc<str>,
    port: u16,
    is_secure: bool,
}

impl Destination {
    pub fn new(host: impl Into<Arc<str>>, port: u16, is_secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            is_secure,
        }
    }

    /// A plaintext destination.
    pub fn http(host: impl Into<Arc<str>>, port: u16) -> Self {
        Self::new(host, port, false)
    }

    /// A destination which must be upgraded with a [crate::transport::TlsLayer].
    pub fn https(host: impl Into<Arc<str>>, port: u16) -> Self {
        Self::new(host, port, true)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    // Used as the label for USDT probes.
    #[cfg(feature = "probes")]
    pub(crate) fn label(&self) -> String {
        self.to_string()
    }
}

/// Parses a host as an IP literal, accepting bracketed IPv6.
pub(crate) fn ip_literal(host: &str) -> Option<IpAddr> {
    let trimmed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    trimmed.parse().ok()
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match ip_literal(&self.host) {
            Some(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.is_secure { "https" } else { "http" };
        write!(f, "{scheme}://{self}")
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Destination {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(&format_args!("{self:?}"))
    }
}

/// The IP family of a single address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl From<&IpAddr> for Family {
    fn from(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::Ipv4,
            IpAddr::V6(_) => Family::Ipv6,
        }
    }
}

/// Which families a lookup should return.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum AddressFamily {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Returns true if `ip` belongs to this selection.
    pub fn admits(&self, ip: &IpAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::Ipv4 => ip.is_ipv4(),
            AddressFamily::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// Transport protocol an address is expected to be used with.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Protocol {
    #[default]
    Tcp,
}

/// One concrete address a host resolved to.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct ResolvedAddress {
    pub address: SocketAddr,
    pub protocol: Protocol,
}

impl ResolvedAddress {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            protocol: Protocol::Tcp,
        }
    }

    pub fn family(&self) -> Family {
        Family::from(&self.address.ip())
    }
}

impl From<SocketAddr> for ResolvedAddress {
    fn from(address: SocketAddr) -> Self {
        Self::new(address)
    }
}
