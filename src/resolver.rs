//! The interface for the resolver, which finds addresses for a host.

use crate::destination::AddressFamily;

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("No addresses found for {host}")]
    NotFound { host: Arc<str> },

    #[error("Failed to resolve {host}: {message}")]
    Lookup { host: Arc<str>, message: Arc<str> },
}

impl Error {
    pub fn not_found(host: &str) -> Self {
        Error::NotFound { host: host.into() }
    }

    pub fn lookup(host: &str, message: impl ToString) -> Self {
        Error::Lookup {
            host: host.into(),
            message: message.to_string().into(),
        }
    }

    /// The host which failed to resolve.
    pub fn host(&self) -> &str {
        match self {
            Error::NotFound { host } | Error::Lookup { host, .. } => host,
        }
    }

    #[cfg(feature = "probes")]
    // Convert to a static string for USDT probes.
    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NotFound",
            Error::Lookup { .. } => "Lookup",
        }
    }
}

/// Translates a host name into IP addresses.
///
/// Resolvers are stateless from the point of view of the connector: caching,
/// expiry and coalescing of concurrent lookups are done by
/// [crate::name_cache::NameCache]. A resolver may return addresses of either
/// family; the cache filters them by the requested [AddressFamily].
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolves `host`, preferring addresses of `family`.
    ///
    /// Returning an empty list is treated as [Error::NotFound].
    async fn resolve_host(&self, host: &str, family: AddressFamily) -> Result<Vec<IpAddr>, Error>;
}

/// Helper type for anything that implements the Resolver interface.
pub type SharedResolver = Arc<dyn Resolver>;
