//! Configuration options which can alter the behavior of the connector.

use crate::destination::AddressFamily;
use crate::transport::Verification;

use std::time::Duration;

/// Policy which is applicable to a [crate::connector::Connector].
#[derive(Clone, Debug)]
pub struct Policy {
    /// The maximum number of connections across all destinations.
    ///
    /// Zero means unlimited.
    pub total_limit: usize,

    /// The maximum number of connections to any single destination.
    ///
    /// Zero means unlimited.
    pub per_host_limit: usize,

    /// How long a released connection may sit idle before it is discarded.
    ///
    /// `Some(Duration::ZERO)` disables pooling. `None` keeps idle
    /// connections until the peer closes them.
    pub keep_alive: Option<Duration>,

    /// Close every connection on release instead of pooling it.
    pub force_close: bool,

    /// How long resolved addresses are cached. `None` caches forever.
    pub dns_ttl: Option<Duration>,

    /// Whether resolved addresses are cached at all.
    pub use_dns_cache: bool,

    /// Which address families to connect to.
    pub family: AddressFamily,

    /// Delay between starting successive connection attempts when racing
    /// addresses. `None` tries addresses one at a time.
    pub happy_eyeballs_delay: Option<Duration>,

    /// How many addresses of the first family to try before alternating
    /// families. Zero keeps the resolver's order.
    pub interleave: usize,

    /// Timeouts of at least this long have their wake time rounded up to
    /// the next whole second, so that many timers share a wakeup.
    pub ceil_threshold: Duration,

    /// How certificates are checked, unless a connect says otherwise.
    pub default_verification: Verification,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            total_limit: 100,
            per_host_limit: 0,
            keep_alive: Some(Duration::from_secs(15)),
            force_close: false,
            dns_ttl: Some(Duration::from_secs(10)),
            use_dns_cache: true,
            family: AddressFamily::Any,
            happy_eyeballs_delay: Some(crate::racer::DEFAULT_STAGGER),
            interleave: 1,
            ceil_threshold: crate::deadline::DEFAULT_CEIL_THRESHOLD,
            default_verification: Verification::Default,
        }
    }
}
