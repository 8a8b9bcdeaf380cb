//! The main interface: turns a [Destination] into a leased connection.

use crate::deadline::{self, DeadlineScheduler};
use crate::destination::Destination;
use crate::handle::Handle;
use crate::name_cache::NameCache;
use crate::observer::{Notifier, SharedObserver};
use crate::policy::Policy;
use crate::pool::{self, Acquired, Limits, Pool, SlotGuard, Stats};
#[cfg(feature = "probes")]
use crate::probes;
use crate::racer::{self, Racer};
use crate::resolver::{self, SharedResolver};
use crate::transport::{self, SharedSocketFactory, SharedTlsLayer, Transport, Verification};
use crate::AcquireId;

use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to resolve destination")]
    Resolution(#[from] resolver::Error),

    #[error("Timed out connecting")]
    ConnectTimeout,

    #[error("Connection refused after {attempts} attempts")]
    ConnectionRefused {
        attempts: usize,
        #[source]
        last: racer::AttemptError,
    },

    #[error("Connector closed")]
    PoolClosed,

    #[error("TLS upgrade failed")]
    Tls(#[source] transport::Error),
}

impl Error {
    #[cfg(feature = "probes")]
    const fn as_str(&self) -> &'static str {
        match self {
            Error::Resolution(_) => "Resolution",
            Error::ConnectTimeout => "ConnectTimeout",
            Error::ConnectionRefused { .. } => "ConnectionRefused",
            Error::PoolClosed => "PoolClosed",
            Error::Tls(_) => "Tls",
        }
    }
}

impl From<pool::Error> for Error {
    fn from(err: pool::Error) -> Self {
        match err {
            pool::Error::Timeout => Error::ConnectTimeout,
            pool::Error::Closed => Error::PoolClosed,
        }
    }
}

/// The lifecycle of a [Connector].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum State {
    // Accepting connects.
    //
    // - (On close_all) State becomes Closing
    Open,

    // Rejecting connects, waiting for connects past the pool to finish.
    //
    // - (Once drained) State becomes Closed
    Closing,

    // Final state.
    Closed,
}

/// Per-call options for [Connector::connect].
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    /// Bounds the whole call: waiting for a slot, resolving and racing.
    pub timeout: Option<Duration>,

    /// Bounds each individual connection attempt while racing.
    pub attempt_timeout: Option<Duration>,

    /// Overrides the policy's default certificate verification.
    pub verification: Option<Verification>,
}

/// Returned by [Connector::new] if the USDT probes could not be
/// registered.
pub struct RegistrationError<T: Transport>(Connector<T>);

impl<T: Transport> std::fmt::Debug for RegistrationError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationError").finish_non_exhaustive()
    }
}

impl<T: Transport> std::fmt::Display for RegistrationError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        "USDT probe registration failed".fmt(f)
    }
}

impl<T: Transport> RegistrationError<T> {
    /// Consume the error and get access to the contained connector.
    pub fn into_inner(self) -> Connector<T> {
        self.0
    }
}

/// Hands out pooled connections to destinations.
///
/// A connect first asks the pool for an idle connection or a slot. With a
/// slot, the destination's host is resolved through the name cache, its
/// addresses are raced, and secure destinations are upgraded by the TLS
/// layer. One deadline bounds all of it.
pub struct Connector<T: Transport> {
    policy: Policy,
    scheduler: DeadlineScheduler,
    resolver: SharedResolver,
    name_cache: NameCache,
    racer: Racer,
    socket_factory: SharedSocketFactory<T>,
    tls: Option<SharedTlsLayer<T>>,
    pool: Pool<T>,
    state: watch::Sender<State>,
}

fn name_cache(resolver: &SharedResolver, policy: &Policy, notifier: Notifier) -> NameCache {
    let cache = if policy.use_dns_cache {
        NameCache::new(resolver.clone(), policy.dns_ttl)
    } else {
        NameCache::disabled(resolver.clone())
    };
    cache.with_notifier(notifier)
}

impl<T: Transport> Connector<T> {
    /// Creates a new connector.
    ///
    /// - resolver: Describes how hosts are turned into addresses.
    /// - socket_factory: Describes how a socket to one address is opened.
    /// - policy: Limits, timeouts and caching behavior.
    ///
    /// ```no_run
    /// use tether::connector::{ConnectOptions, Connector};
    /// use tether::connectors::tcp::TcpConnector;
    /// use tether::destination::Destination;
    /// use tether::policy::Policy;
    /// use tether::resolvers::system::SystemResolver;
    /// use std::sync::Arc;
    ///
    /// # async {
    /// let connector = Connector::new(
    ///     Arc::new(SystemResolver::default()),
    ///     Arc::new(TcpConnector::new()),
    ///     Policy::default(),
    /// ).unwrap();
    ///
    /// let destination = Destination::http("example.com", 80);
    /// let conn = connector.connect(&destination, &ConnectOptions::default()).await.unwrap();
    /// # };
    /// ```
    pub fn new(
        resolver: SharedResolver,
        socket_factory: SharedSocketFactory<T>,
        policy: Policy,
    ) -> Result<Self, RegistrationError<T>> {
        let notifier = Notifier::default();
        let (state, _) = watch::channel(State::Open);
        let scheduler = DeadlineScheduler::new(policy.ceil_threshold);
        let self_ = Self {
            name_cache: name_cache(&resolver, &policy, notifier.clone()),
            racer: Racer::new(policy.happy_eyeballs_delay, policy.interleave)
                .with_scheduler(scheduler.clone()),
            pool: Pool::with_notifier(Limits::from(&policy), notifier),
            tls: None,
            resolver,
            socket_factory,
            scheduler,
            policy,
            state,
        };
        #[cfg(feature = "probes")]
        match usdt::register_probes() {
            Ok(_) => Ok(self_),
            Err(_) => Err(RegistrationError(self_)),
        }
        #[cfg(not(feature = "probes"))]
        Ok(self_)
    }

    /// Upgrades connections to secure destinations with `tls`.
    pub fn with_tls_layer(mut self, tls: SharedTlsLayer<T>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Notifies `observer` as connections are acquired.
    ///
    /// Must be called before the connector is used.
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        let notifier = Notifier::new(observer);
        self.name_cache = name_cache(&self.resolver, &self.policy, notifier.clone());
        self.pool = Pool::with_notifier(Limits::from(&self.policy), notifier);
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub fn name_cache(&self) -> &NameCache {
        &self.name_cache
    }

    /// Samples the pool's counters.
    pub fn stats(&self) -> Stats {
        self.pool.stats()
    }

    /// Acquires a connection to `destination`.
    ///
    /// Returns an idle connection if one is usable, and otherwise opens a
    /// new one once the limits allow. Dropping the returned future at any
    /// point gives back whatever it was holding.
    #[instrument(level = "debug", skip(self, options), name = "Connector::connect", err)]
    pub async fn connect(
        &self,
        destination: &Destination,
        options: &ConnectOptions,
    ) -> Result<Handle<T>, Error> {
        let id = AcquireId::default();
        event!(Level::DEBUG, acquire_id = id.0, "Acquiring connection");
        #[cfg(feature = "probes")]
        probes::connect__start!(|| (destination.label(), id.0));

        let result = self.do_connect(destination, options).await;

        #[cfg(feature = "probes")]
        match &result {
            Ok(handle) => {
                probes::connect__done!(|| (destination.label(), id.0, handle.id().as_u64()))
            }
            Err(err) => probes::connect__failed!(|| (destination.label(), id.0, err.as_str())),
        }
        result
    }

    async fn do_connect(
        &self,
        destination: &Destination,
        options: &ConnectOptions,
    ) -> Result<Handle<T>, Error> {
        let state = self.state();
        if state != State::Open {
            return Err(Error::PoolClosed);
        }

        let deadline = self.scheduler.schedule(options.timeout);
        let slot = match self.pool.acquire(destination, deadline.as_ref()).await? {
            Acquired::Reused(handle) => return Ok(handle),
            Acquired::Slot(slot) => slot,
        };

        match deadline::within(deadline.as_ref(), self.establish(slot, options)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::ConnectTimeout),
        }
    }

    // Opens a new connection for a granted slot. Any error drops the slot,
    // which gives it back to the pool.
    async fn establish(
        &self,
        slot: SlotGuard<T>,
        options: &ConnectOptions,
    ) -> Result<Handle<T>, Error> {
        let destination = slot.destination().clone();
        let tls = match (&self.tls, destination.is_secure()) {
            (_, false) => None,
            (Some(tls), true) => Some(tls),
            (None, true) => return Err(Error::Tls(transport::Error::TlsUnavailable)),
        };

        let addresses = self
            .name_cache
            .resolve(destination.host(), destination.port(), self.policy.family)
            .await?;
        let (socket, address) = self
            .racer
            .connect(&self.socket_factory, addresses, options.attempt_timeout)
            .await
            .map_err(|err| match err {
                racer::Error::NoAddresses => {
                    Error::Resolution(resolver::Error::not_found(destination.host()))
                }
                racer::Error::AllAttemptsFailed { attempts, last } => {
                    Error::ConnectionRefused { attempts, last }
                }
            })?;
        event!(Level::DEBUG, address = %address.address, "Connected");

        let socket = match tls {
            Some(tls) => {
                let verification = options
                    .verification
                    .as_ref()
                    .unwrap_or(&self.policy.default_verification);
                tls.upgrade(socket, &destination, verification)
                    .await
                    .map_err(Error::Tls)?
            }
            None => socket,
        };

        Ok(slot.into_handle(socket, address.address)?)
    }

    /// Closes the connector.
    ///
    /// Queued callers fail with [Error::PoolClosed], idle connections are
    /// closed, and leased connections are revoked. Returns once every
    /// connect which was already past the pool has finished.
    ///
    /// Safe to call repeatedly and concurrently.
    #[instrument(level = "debug", skip(self), name = "Connector::close_all")]
    pub async fn close_all(&self) {
        let closing = self.state.send_if_modified(|state| {
            let open = *state == State::Open;
            if open {
                *state = State::Closing;
            }
            open
        });
        if closing {
            event!(Level::INFO, "Closing connector");
        }

        self.pool.close();
        self.pool.drained().await;

        self.state.send_if_modified(|state| {
            let changed = *state != State::Closed;
            *state = State::Closed;
            changed
        });
    }
}
