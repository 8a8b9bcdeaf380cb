//! Implementation of [Resolver] for DNS, using hickory

use crate::destination::AddressFamily;
use crate::resolver::{Error, Resolver};

use async_trait::async_trait;
use hickory_resolver::config::LookupIpStrategy;
use hickory_resolver::config::NameServerConfig;
use hickory_resolver::config::Protocol;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::config::ResolverOpts;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{event, instrument, Level};

/// Configuration options for [HickoryResolver].
#[derive(Clone, Debug)]
pub struct HickoryConfig {
    /// After starting to query a DNS server, how long until we timeout?
    ///
    /// Default: 5 seconds
    pub query_timeout: Duration,

    /// Upper bound on how long negative answers are remembered by hickory.
    ///
    /// Default: 15 seconds
    pub negative_max_ttl: Option<Duration>,

    /// Should `/etc/hosts` be consulted before DNS?
    ///
    /// Default: false
    pub use_hosts_file: bool,
}

impl Default for HickoryConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(5),
            negative_max_ttl: Some(Duration::from_secs(15)),
            use_hosts_file: false,
        }
    }
}

/// Resolves hosts with A and AAAA queries against DNS servers.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryResolver {
    /// Creates a resolver which queries the given name servers over UDP.
    pub fn new(name_servers: impl IntoIterator<Item = SocketAddr>, config: &HickoryConfig) -> Self {
        let mut rc = ResolverConfig::new();
        for socket_addr in name_servers {
            rc.add_name_server(NameServerConfig {
                socket_addr,
                protocol: Protocol::Udp,
                tls_dns_name: None,
                trust_negative_responses: false,
                bind_addr: None,
            });
        }
        let resolver = TokioAsyncResolver::tokio(rc, Self::opts(config));
        Self { resolver }
    }

    /// Creates a resolver from the system configuration (`/etc/resolv.conf`).
    pub fn from_system_conf() -> Result<Self, Error> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|err| Error::lookup("<system configuration>", err))?;
        Ok(Self { resolver })
    }

    fn opts(config: &HickoryConfig) -> ResolverOpts {
        let mut opts = ResolverOpts::default();
        opts.use_hosts_file = config.use_hosts_file;
        opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        opts.negative_max_ttl = config.negative_max_ttl;
        opts.timeout = config.query_timeout;
        opts.edns0 = true;
        opts
    }

    async fn lookup(&self, host: &str, family: AddressFamily) -> Result<Vec<IpAddr>, ResolveError> {
        let ips = match family {
            AddressFamily::Any => self.resolver.lookup_ip(host).await?.iter().collect(),
            AddressFamily::Ipv4 => self
                .resolver
                .ipv4_lookup(host)
                .await?
                .into_iter()
                .map(|a| IpAddr::V4(*a))
                .collect(),
            AddressFamily::Ipv6 => self
                .resolver
                .ipv6_lookup(host)
                .await?
                .into_iter()
                .map(|aaaa| IpAddr::V6(*aaaa))
                .collect(),
        };
        Ok(ips)
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    #[instrument(level = "debug", skip(self), name = "HickoryResolver::resolve_host")]
    async fn resolve_host(&self, host: &str, family: AddressFamily) -> Result<Vec<IpAddr>, Error> {
        match self.lookup(host, family).await {
            Ok(ips) if ips.is_empty() => Err(Error::not_found(host)),
            Ok(ips) => {
                event!(Level::DEBUG, ?ips, "Successfully looked up host");
                Ok(ips)
            }
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Err(Error::not_found(host)),
                _ => {
                    event!(Level::ERROR, ?err, "DNS request failed");
                    Err(Error::lookup(host, err))
                }
            },
        }
    }
}
