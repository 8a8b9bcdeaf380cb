//! Implementation of [Resolver] using the operating system's resolver.

use crate::destination::AddressFamily;
use crate::resolver::{Error, Resolver};

use async_trait::async_trait;
use std::net::IpAddr;
use tracing::{event, instrument, Level};

/// Resolves hosts through `getaddrinfo`, via [tokio::net::lookup_host].
///
/// Lookups run on tokio's blocking pool.
#[derive(Clone, Debug, Default)]
pub struct SystemResolver {}

impl SystemResolver {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    #[instrument(level = "debug", skip(self), name = "SystemResolver::resolve_host")]
    async fn resolve_host(&self, host: &str, family: AddressFamily) -> Result<Vec<IpAddr>, Error> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|err| Error::lookup(host, err))?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            let ip = addr.ip();
            // getaddrinfo repeats addresses once per socket type.
            if family.admits(&ip) && !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        event!(Level::DEBUG, ?ips, "Resolved host");

        if ips.is_empty() {
            return Err(Error::not_found(host));
        }
        Ok(ips)
    }
}
