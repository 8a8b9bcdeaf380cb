//! Implementation of [Resolver] that always returns a fixed set of addresses.

use crate::destination::AddressFamily;
use crate::resolver::{Error, Resolver};

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;

/// A [`Resolver`] that answers from a static table.
#[derive(Clone, Debug, Default)]
pub struct FixedResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl FixedResolver {
    pub fn new<H, I>(hosts: I) -> FixedResolver
    where
        H: Into<String>,
        I: IntoIterator<Item = (H, Vec<IpAddr>)>,
    {
        FixedResolver {
            hosts: hosts
                .into_iter()
                .map(|(host, addrs)| (host.into(), addrs))
                .collect(),
        }
    }

    /// Adds or replaces the addresses for `host`.
    pub fn insert(&mut self, host: impl Into<String>, addrs: Vec<IpAddr>) {
        self.hosts.insert(host.into(), addrs);
    }
}

#[async_trait]
impl Resolver for FixedResolver {
    async fn resolve_host(&self, host: &str, family: AddressFamily) -> Result<Vec<IpAddr>, Error> {
        let addrs: Vec<_> = self
            .hosts
            .get(host)
            .into_iter()
            .flatten()
            .filter(|ip| family.admits(ip))
            .copied()
            .collect();
        if addrs.is_empty() {
            return Err(Error::not_found(host));
        }
        Ok(addrs)
    }
}
