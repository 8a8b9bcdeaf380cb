//! Optional hooks notified as the connector makes progress.

use crate::destination::Destination;
#[cfg(feature = "probes")]
use crate::probes;

use std::net::SocketAddr;
use std::sync::Arc;

/// Receives notifications at the boundaries of connection acquisition.
///
/// Every method defaults to doing nothing. Hooks are called synchronously
/// on the task acquiring the connection, and must not block.
pub trait Observer: Send + Sync {
    /// A caller had to wait behind the pool limits.
    fn slot_queued(&self, _destination: &Destination) {}

    /// A caller was granted a slot for a new connection.
    fn slot_granted(&self, _destination: &Destination) {}

    /// A new connection to `peer` was established.
    fn connection_created(&self, _destination: &Destination, _peer: SocketAddr) {}

    /// An idle connection was handed out again.
    fn connection_reused(&self, _destination: &Destination) {}

    fn dns_cache_hit(&self, _host: &str) {}

    fn dns_cache_miss(&self, _host: &str) {}
}

/// An observer which ignores every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

pub type SharedObserver = Arc<dyn Observer>;

/// Fans a notification out to the USDT probes and the user's observer.
#[derive(Clone)]
pub(crate) struct Notifier {
    observer: SharedObserver,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(Arc::new(NoopObserver))
    }
}

impl Notifier {
    pub(crate) fn new(observer: SharedObserver) -> Self {
        Self { observer }
    }

    pub(crate) fn slot_queued(&self, destination: &Destination) {
        #[cfg(feature = "probes")]
        probes::slot__queued!(|| destination.label());
        self.observer.slot_queued(destination);
    }

    pub(crate) fn slot_granted(&self, destination: &Destination) {
        #[cfg(feature = "probes")]
        probes::slot__granted!(|| destination.label());
        self.observer.slot_granted(destination);
    }

    pub(crate) fn connection_created(
        &self,
        destination: &Destination,
        _conn_id: u64,
        peer: SocketAddr,
    ) {
        #[cfg(feature = "probes")]
        probes::connection__created!(|| (destination.label(), _conn_id, peer.to_string()));
        self.observer.connection_created(destination, peer);
    }

    pub(crate) fn connection_reused(&self, destination: &Destination, _conn_id: u64) {
        #[cfg(feature = "probes")]
        probes::connection__reused!(|| (destination.label(), _conn_id));
        self.observer.connection_reused(destination);
    }

    pub(crate) fn dns_cache_hit(&self, host: &str) {
        #[cfg(feature = "probes")]
        probes::dns__cache__hit!(|| host);
        self.observer.dns_cache_hit(host);
    }

    pub(crate) fn dns_cache_miss(&self, host: &str) {
        #[cfg(feature = "probes")]
        probes::dns__cache__miss!(|| host);
        self.observer.dns_cache_miss(host);
    }
}
