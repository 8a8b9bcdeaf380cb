//! A TTL cache in front of a [resolver::Resolver].
//!
//! Answers are keyed by `(host, port, family)`. Concurrent lookups of the
//! same key share one resolver call. Failures are never cached.

use crate::destination::{self, AddressFamily, ResolvedAddress};
use crate::observer::Notifier;
#[cfg(feature = "probes")]
use crate::probes;
use crate::resolver::{self, SharedResolver};

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{event, instrument, Level};

/// How long answers are kept by default.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

type Resolution = Result<Vec<ResolvedAddress>, resolver::Error>;
type PendingResolution = Shared<BoxFuture<'static, Resolution>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Key {
    host: Arc<str>,
    port: u16,
    family: AddressFamily,
}

struct Entry {
    /// Never empty.
    addresses: Vec<ResolvedAddress>,
    /// When does this entry expire? `None` means never.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

struct Pending {
    // Distinguishes this lookup from any started after an invalidation.
    id: u64,
    resolution: PendingResolution,
}

#[derive(Default)]
struct State {
    entries: HashMap<Key, Entry>,
    pending: HashMap<Key, Pending>,
    next_id: u64,
}

impl State {
    // Returns the cached addresses, rotating them for the next caller.
    fn lookup(&mut self, key: &Key, now: Instant) -> Option<Vec<ResolvedAddress>> {
        let entry = self.entries.get_mut(key)?;
        if entry.is_expired(now) {
            self.entries.remove(key);
            return None;
        }
        let addresses = entry.addresses.clone();
        entry.addresses.rotate_left(1);
        Some(addresses)
    }
}

enum Lookup {
    Hit(Vec<ResolvedAddress>),
    Miss(PendingResolution),
}

/// Caches resolved addresses with expiry and in-flight coalescing.
pub struct NameCache {
    resolver: SharedResolver,
    ttl: Option<Duration>,
    enabled: bool,
    notifier: Notifier,
    state: Arc<Mutex<State>>,
}

impl NameCache {
    /// Creates a cache in front of `resolver`.
    ///
    /// - ttl: How long answers are kept. `None` keeps them until invalidated.
    pub fn new(resolver: SharedResolver, ttl: Option<Duration>) -> Self {
        Self {
            resolver,
            ttl,
            enabled: true,
            notifier: Notifier::default(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Disables caching of answers. Concurrent lookups are still coalesced.
    pub fn disabled(resolver: SharedResolver) -> Self {
        Self {
            enabled: false,
            ..Self::new(resolver, None)
        }
    }

    pub(crate) fn with_notifier(self, notifier: Notifier) -> Self {
        Self { notifier, ..self }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the addresses `host` resolves to, paired with `port`.
    ///
    /// IP literals are answered directly. The returned list is never empty.
    #[instrument(level = "debug", skip(self), name = "NameCache::resolve", err)]
    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> Result<Vec<ResolvedAddress>, resolver::Error> {
        if let Some(ip) = destination::ip_literal(host) {
            if !family.admits(&ip) {
                return Err(resolver::Error::not_found(host));
            }
            return Ok(vec![ResolvedAddress::new(SocketAddr::new(ip, port))]);
        }

        let key = Key {
            host: host.into(),
            port,
            family,
        };
        let lookup = {
            let mut state = self.state.lock().unwrap();
            match self.enabled.then(|| state.lookup(&key, Instant::now())).flatten() {
                Some(addresses) => Lookup::Hit(addresses),
                None => match state.pending.get(&key) {
                    Some(pending) => Lookup::Miss(pending.resolution.clone()),
                    None => {
                        let id = state.next_id;
                        state.next_id += 1;
                        let resolution = self.start_resolution(key.clone(), id);
                        state.pending.insert(
                            key,
                            Pending {
                                id,
                                resolution: resolution.clone(),
                            },
                        );
                        Lookup::Miss(resolution)
                    }
                },
            }
        };

        match lookup {
            Lookup::Hit(addresses) => {
                self.notifier.dns_cache_hit(host);
                Ok(addresses)
            }
            Lookup::Miss(pending) => {
                self.notifier.dns_cache_miss(host);
                pending.await
            }
        }
    }

    // Creates the shared future for one resolver call. Whichever caller
    // completes it stores the answer and retires the pending entry, unless
    // the key was invalidated in the meantime.
    fn start_resolution(&self, key: Key, id: u64) -> PendingResolution {
        let resolver = self.resolver.clone();
        let state = self.state.clone();
        let ttl = self.ttl;
        let enabled = self.enabled;

        async move {
            let result = resolver
                .resolve_host(&key.host, key.family)
                .await
                .and_then(|ips| {
                    let addresses: Vec<_> = ips
                        .into_iter()
                        .filter(|ip| key.family.admits(ip))
                        .map(|ip| ResolvedAddress::new(SocketAddr::new(ip, key.port)))
                        .collect();
                    if addresses.is_empty() {
                        return Err(resolver::Error::not_found(&key.host));
                    }
                    Ok(addresses)
                });
            event!(Level::DEBUG, host = %key.host, ?result, "Resolution finished");
            #[cfg(feature = "probes")]
            if let Err(err) = &result {
                probes::dns__resolve__failed!(|| (&*key.host, err.as_str()));
            }

            let mut state = state.lock().unwrap();
            if state.pending.get(&key).map(|p| p.id) != Some(id) {
                event!(Level::DEBUG, host = %key.host, "Invalidated while resolving");
                return result;
            }
            state.pending.remove(&key);
            if let (true, Ok(addresses)) = (enabled, &result) {
                // Overflowing the clock means the entry never expires.
                let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
                state.entries.insert(
                    key,
                    Entry {
                        addresses: addresses.clone(),
                        expires_at,
                    },
                );
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Drops cached answers.
    ///
    /// - `invalidate(Some(host), Some(port))` drops one key.
    /// - `invalidate(Some(host), None)` drops the host on every port.
    /// - `invalidate(None, _)` clears the cache.
    ///
    /// Lookups already in flight for a dropped key still answer their
    /// callers, but their answer is not cached.
    pub fn invalidate(&self, host: Option<&str>, port: Option<u16>) {
        let keep = |key: &Key| match host {
            None => false,
            Some(host) => &*key.host != host || port.is_some_and(|port| key.port != port),
        };
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|key, _| keep(key));
        state.pending.retain(|key, _| keep(key));
    }

    /// Number of keys currently cached, including expired ones not yet
    /// evicted.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
