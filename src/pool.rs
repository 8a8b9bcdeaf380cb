//! A pool of connections, keyed by [Destination].
//!
//! The pool counts a "slot" for every connection from the moment it is
//! granted until it is definitively closed, so connecting, active and idle
//! connections all count against the limits. Callers which cannot get a slot
//! wait in FIFO order; freed slots and released connections are handed
//! directly to the oldest eligible waiter.

use crate::connection::{Connection, ConnectionId};
use crate::deadline::{self, Deadline};
use crate::destination::Destination;
use crate::handle::{Handle, Lease};
use crate::observer::Notifier;
use crate::policy::Policy;
#[cfg(feature = "probes")]
use crate::probes;
use crate::transport::Transport;

use derive_where::derive_where;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{event, instrument, Level};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Timed out waiting for a connection slot")]
    Timeout,

    #[error("Pool closed")]
    Closed,
}

/// Limits and reuse behavior of a [Pool].
#[derive(Clone, Debug)]
pub struct Limits {
    /// Maximum connections across all destinations. Zero means unlimited.
    pub total: usize,

    /// Maximum connections per destination. Zero means unlimited.
    pub per_host: usize,

    /// How long a released connection may idle before it is discarded.
    /// `None` keeps idle connections until they are closed by the peer.
    pub keep_alive: Option<Duration>,

    /// Close connections on release instead of pooling them.
    pub force_close: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Self::from(&Policy::default())
    }
}

impl From<&Policy> for Limits {
    fn from(policy: &Policy) -> Self {
        Self {
            total: policy.total_limit,
            per_host: policy.per_host_limit,
            keep_alive: policy.keep_alive,
            force_close: policy.force_close,
        }
    }
}

impl Limits {
    fn pools_connections(&self) -> bool {
        !self.force_close && self.keep_alive != Some(Duration::ZERO)
    }
}

/// Per-destination counters at a single point-in-time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct EndpointStats {
    pub in_flight: usize,
    pub idle: usize,
    pub waiting: usize,
}

/// Pool-wide counters at a single point-in-time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Stats {
    /// Connecting, active and idle connections.
    pub in_flight: usize,
    /// Slots granted which are not yet connections.
    pub connecting: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub destinations: BTreeMap<Destination, EndpointStats>,
}

/// The outcome of [Pool::acquire].
#[derive_where(Debug)]
pub enum Acquired<T: Transport> {
    /// An idle connection, leased to the caller.
    Reused(Handle<T>),

    /// Permission to open a new connection.
    Slot(SlotGuard<T>),
}

// What a waiter is handed when it reaches the front of the queue.
enum Grant<T: Transport> {
    Reuse(Connection<T>),
    Slot,
}

struct Waiter<T: Transport> {
    // Global enqueue order, shared by all destinations.
    seq: u64,
    tx: oneshot::Sender<Grant<T>>,
}

// A grant which must be sent outside the lock.
type Delivery<T> = (Destination, oneshot::Sender<Grant<T>>, Grant<T>);

#[derive_where(Default)]
struct Endpoint<T: Transport> {
    // Least recently used at the front.
    idle: VecDeque<Connection<T>>,
    in_flight: usize,
    waiters: VecDeque<Waiter<T>>,
}

impl<T: Transport> Endpoint<T> {
    fn is_unused(&self) -> bool {
        self.in_flight == 0 && self.idle.is_empty() && self.waiters.is_empty()
    }
}

// Closes a connection, leaving its slot to the caller.
fn retire<T: Transport>(conn: &mut Connection<T>, reason: &'static str) {
    event!(
        Level::DEBUG,
        id = %conn.id(),
        destination = ?conn.destination(),
        reason,
        "Closing connection"
    );
    #[cfg(feature = "probes")]
    probes::connection__closed!(|| (conn.destination().label(), conn.id().as_u64(), reason));
    conn.close();
}

#[derive_where(Default)]
struct Inner<T: Transport> {
    endpoints: HashMap<Destination, Endpoint<T>>,
    in_flight: usize,
    connecting: usize,
    // Leased connections, by the transports their handles hold.
    active: HashMap<ConnectionId, Arc<Lease<T>>>,
    next_seq: u64,
    closed: bool,
}

impl<T: Transport> Inner<T> {
    fn endpoint(&mut self, destination: &Destination) -> &mut Endpoint<T> {
        self.endpoints.entry(destination.clone()).or_default()
    }

    fn has_waiters(&self, destination: &Destination) -> bool {
        self.endpoints
            .get(destination)
            .is_some_and(|e| !e.waiters.is_empty())
    }

    fn per_host_permits(&self, limits: &Limits, destination: &Destination) -> bool {
        let in_flight = self.endpoints.get(destination).map_or(0, |e| e.in_flight);
        limits.per_host == 0 || in_flight < limits.per_host
    }

    fn total_permits(&self, limits: &Limits) -> bool {
        limits.total == 0 || self.in_flight < limits.total
    }

    // Pops the most recently used idle connection which is still usable,
    // closing stale ones on the way.
    fn take_idle(
        &mut self,
        limits: &Limits,
        destination: &Destination,
        now: Instant,
    ) -> Option<Connection<T>> {
        loop {
            let conn = self.endpoints.get_mut(destination)?.idle.pop_back()?;
            if conn.is_usable(now, limits.keep_alive) {
                return Some(conn);
            }
            self.close_unit(conn, "stale");
        }
    }

    // Closes a connection owned by the pool, and frees its slot.
    fn close_unit(&mut self, mut conn: Connection<T>, reason: &'static str) {
        retire(&mut conn, reason);
        self.forget(conn.destination());
    }

    fn grant_slot(&mut self, destination: &Destination) {
        self.endpoint(destination).in_flight += 1;
        self.in_flight += 1;
        self.connecting += 1;
    }

    // Frees one slot of `destination`.
    fn forget(&mut self, destination: &Destination) {
        let Some(endpoint) = self.endpoints.get_mut(destination) else {
            debug_assert!(false, "Freeing a slot of unknown destination {destination:?}");
            return;
        };
        debug_assert!(endpoint.in_flight > 0, "Slot count of {destination:?} underflowed");
        debug_assert!(self.in_flight > 0, "Total slot count underflowed");
        endpoint.in_flight = endpoint.in_flight.saturating_sub(1);
        self.in_flight = self.in_flight.saturating_sub(1);
        if endpoint.is_unused() {
            self.endpoints.remove(destination);
        }
    }

    // Closes the least recently used idle connection of another destination.
    fn evict_lru_idle(&mut self, except: &Destination) -> bool {
        let victim = self
            .endpoints
            .iter()
            .filter(|(destination, _)| *destination != except)
            .filter_map(|(destination, e)| {
                e.idle
                    .front()
                    .map(|conn| (conn.last_used_at(), destination.clone()))
            })
            .min_by_key(|(last_used_at, _)| *last_used_at);
        let Some((_, destination)) = victim else {
            return false;
        };
        let Some(conn) = self
            .endpoints
            .get_mut(&destination)
            .and_then(|e| e.idle.pop_front())
        else {
            return false;
        };
        self.close_unit(conn, "evicted");
        true
    }

    // Returns true if a new slot may be granted to `destination`, evicting
    // another destination's idle connection if only the total limit blocks.
    fn make_room(&mut self, limits: &Limits, destination: &Destination) -> bool {
        if !self.per_host_permits(limits, destination) {
            return false;
        }
        self.total_permits(limits) || self.evict_lru_idle(destination)
    }

    // Parks an idle connection, handing it straight to the oldest waiter
    // for its destination if there is one.
    fn park(&mut self, limits: &Limits, conn: Connection<T>, now: Instant) -> Vec<Delivery<T>> {
        let destination = conn.destination().clone();
        let endpoint = self.endpoint(&destination);
        if let Some(waiter) = endpoint.waiters.pop_front() {
            return vec![(destination, waiter.tx, Grant::Reuse(conn))];
        }
        endpoint.idle.push_back(conn);
        // Waiters of other destinations may be blocked on the total limit.
        self.dispatch(limits, now)
    }

    // Grants as many waiters as the limits allow, oldest first.
    fn dispatch(&mut self, limits: &Limits, now: Instant) -> Vec<Delivery<T>> {
        let mut deliveries = Vec::new();
        loop {
            let oldest = self
                .endpoints
                .iter()
                .filter_map(|(destination, e)| {
                    let waiter = e.waiters.front()?;
                    let eligible = !e.idle.is_empty()
                        || limits.per_host == 0
                        || e.in_flight < limits.per_host;
                    eligible.then(|| (waiter.seq, destination.clone()))
                })
                .min_by_key(|(seq, _)| *seq);
            let Some((_, destination)) = oldest else {
                break;
            };

            let grant = if let Some(conn) = self.take_idle(limits, &destination, now) {
                Grant::Reuse(conn)
            } else if self.make_room(limits, &destination) {
                self.grant_slot(&destination);
                Grant::Slot
            } else {
                // The oldest eligible waiter is blocked by the total limit,
                // and so is everyone behind it.
                break;
            };

            let waiter = self
                .endpoints
                .get_mut(&destination)
                .and_then(|e| e.waiters.pop_front());
            match waiter {
                Some(waiter) => deliveries.push((destination, waiter.tx, grant)),
                None => {
                    debug_assert!(false, "Waiter vanished during dispatch");
                    break;
                }
            }
        }
        deliveries
    }

    fn remove_waiter(&mut self, destination: &Destination, seq: u64) {
        let Some(endpoint) = self.endpoints.get_mut(destination) else {
            return;
        };
        endpoint.waiters.retain(|w| w.seq != seq);
        if endpoint.is_unused() {
            self.endpoints.remove(destination);
        }
    }

    fn check_invariants(&self, limits: &Limits) {
        if !cfg!(debug_assertions) {
            return;
        }
        let mut in_flight = 0;
        let mut idle = 0;
        for (destination, e) in &self.endpoints {
            in_flight += e.in_flight;
            idle += e.idle.len();
            debug_assert!(
                e.idle.len() <= e.in_flight,
                "{destination:?} has more idle connections than slots"
            );
            debug_assert!(
                limits.per_host == 0 || e.in_flight <= limits.per_host,
                "{destination:?} exceeds the per-host limit"
            );
            debug_assert!(
                !self.closed || (e.waiters.is_empty() && e.idle.is_empty()),
                "Closed pool still holds waiters or idle connections"
            );
        }
        debug_assert_eq!(in_flight, self.in_flight, "Slot counts disagree");
        debug_assert!(
            limits.total == 0 || self.in_flight <= limits.total,
            "Pool exceeds the total limit"
        );
        debug_assert!(
            self.connecting + self.active.len() + idle <= self.in_flight,
            "More connections than slots"
        );
    }

    fn stats(&self) -> Stats {
        let destinations: BTreeMap<_, _> = self
            .endpoints
            .iter()
            .map(|(destination, e)| {
                (
                    destination.clone(),
                    EndpointStats {
                        in_flight: e.in_flight,
                        idle: e.idle.len(),
                        waiting: e.waiters.len(),
                    },
                )
            })
            .collect();
        Stats {
            in_flight: self.in_flight,
            connecting: self.connecting,
            active: self.active.len(),
            idle: destinations.values().map(|e| e.idle).sum(),
            waiting: destinations.values().map(|e| e.waiting).sum(),
            destinations,
        }
    }
}

struct Shared<T: Transport> {
    limits: Limits,
    notifier: Notifier,
    inner: Mutex<Inner<T>>,
    // Mirrors "Inner::connecting", so closing can wait for it to drain.
    connecting_tx: watch::Sender<usize>,
}

/// Idle connections, slot accounting and waiter queues for every
/// destination.
///
/// All state lives behind one mutex which is never held across an `.await`.
#[derive_where(Clone)]
pub struct Pool<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Pool<T> {
    pub fn new(limits: Limits) -> Self {
        Self::with_notifier(limits, Notifier::default())
    }

    pub(crate) fn with_notifier(limits: Limits, notifier: Notifier) -> Self {
        let (connecting_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                limits,
                notifier,
                inner: Mutex::new(Inner::default()),
                connecting_tx,
            }),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.shared.limits
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.shared.inner.lock().unwrap()
    }

    // Called at the end of every critical section which mutates state.
    fn settle(&self, inner: &Inner<T>) {
        inner.check_invariants(&self.shared.limits);
        self.shared.connecting_tx.send_if_modified(|connecting| {
            let changed = *connecting != inner.connecting;
            *connecting = inner.connecting;
            changed
        });
    }

    // Sends grants. Must be called without holding the lock.
    fn deliver(&self, deliveries: Vec<Delivery<T>>) {
        for (destination, tx, grant) in deliveries {
            if let Err(grant) = tx.send(grant) {
                self.reclaim(&destination, grant);
            }
        }
    }

    // Takes back a grant nobody received.
    fn reclaim(&self, destination: &Destination, grant: Grant<T>) {
        match grant {
            Grant::Reuse(conn) => {
                let deliveries = {
                    let mut inner = self.lock();
                    let deliveries = if inner.closed {
                        inner.close_unit(conn, "pool closed");
                        vec![]
                    } else {
                        inner.park(&self.shared.limits, conn, Instant::now())
                    };
                    self.settle(&inner);
                    deliveries
                };
                self.deliver(deliveries);
            }
            Grant::Slot => self.release_slot(destination),
        }
    }

    // Leases a connection to a caller.
    fn lease(&self, inner: &mut Inner<T>, mut conn: Connection<T>, reused: bool) -> Handle<T> {
        if reused {
            conn.activate();
        }
        let lease = Arc::new(Lease::new(conn.take_transport()));
        inner.active.insert(conn.id(), lease.clone());
        Handle::new(conn, self.clone(), lease, reused)
    }

    /// Acquires either an idle connection to `destination`, or a slot to
    /// open a new one.
    ///
    /// Waits in FIFO order behind other callers if the limits are reached.
    /// Dropping the returned future while waiting gives up the place in the
    /// queue.
    #[instrument(level = "debug", skip(self, deadline), name = "Pool::acquire", err)]
    pub async fn acquire(
        &self,
        destination: &Destination,
        deadline: Option<&Deadline>,
    ) -> Result<Acquired<T>, Error> {
        let limits = &self.shared.limits;
        let (seq, rx) = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Error::Closed);
            }
            let now = Instant::now();
            if !inner.has_waiters(destination) {
                if let Some(conn) = inner.take_idle(limits, destination, now) {
                    let handle = self.lease(&mut inner, conn, true);
                    self.settle(&inner);
                    drop(inner);
                    self.shared
                        .notifier
                        .connection_reused(destination, handle.id().as_u64());
                    return Ok(Acquired::Reused(handle));
                }
                if inner.make_room(limits, destination) {
                    inner.grant_slot(destination);
                    self.settle(&inner);
                    drop(inner);
                    self.shared.notifier.slot_granted(destination);
                    return Ok(Acquired::Slot(SlotGuard::new(self.clone(), destination)));
                }
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            inner
                .endpoint(destination)
                .waiters
                .push_back(Waiter { seq, tx });
            self.settle(&inner);
            (seq, rx)
        };

        event!(Level::DEBUG, seq, "Waiting for a slot");
        self.shared.notifier.slot_queued(destination);
        let mut waiter = WaitGuard {
            pool: self,
            destination,
            seq,
            rx: Some(rx),
        };
        let grant = match deadline::within(deadline, waiter.wait()).await {
            Err(_elapsed) => return Err(Error::Timeout),
            Ok(None) => return Err(Error::Closed),
            Ok(Some(grant)) => grant,
        };
        drop(waiter);

        self.accept_grant(destination, grant)
    }

    // Turns a grant received while waiting into what the caller gets.
    fn accept_grant(&self, destination: &Destination, grant: Grant<T>) -> Result<Acquired<T>, Error> {
        let mut inner = self.lock();
        if inner.closed {
            match grant {
                Grant::Reuse(conn) => inner.close_unit(conn, "pool closed"),
                Grant::Slot => {
                    inner.connecting -= 1;
                    inner.forget(destination);
                }
            }
            self.settle(&inner);
            return Err(Error::Closed);
        }

        match grant {
            Grant::Reuse(conn) if conn.is_usable(Instant::now(), self.shared.limits.keep_alive) => {
                let handle = self.lease(&mut inner, conn, true);
                self.settle(&inner);
                drop(inner);
                self.shared
                    .notifier
                    .connection_reused(destination, handle.id().as_u64());
                Ok(Acquired::Reused(handle))
            }
            Grant::Reuse(mut conn) => {
                // The connection died on the way; keep its slot for a new one.
                retire(&mut conn, "stale");
                inner.connecting += 1;
                self.settle(&inner);
                drop(inner);
                self.shared.notifier.slot_granted(destination);
                Ok(Acquired::Slot(SlotGuard::new(self.clone(), destination)))
            }
            Grant::Slot => {
                drop(inner);
                self.shared.notifier.slot_granted(destination);
                Ok(Acquired::Slot(SlotGuard::new(self.clone(), destination)))
            }
        }
    }

    // Adopts a freshly established connection for a granted slot.
    fn adopt(&self, conn: Connection<T>) -> Result<Handle<T>, Error> {
        let mut inner = self.lock();
        inner.connecting -= 1;
        if inner.closed {
            inner.close_unit(conn, "pool closed");
            self.settle(&inner);
            return Err(Error::Closed);
        }
        let destination = conn.destination().clone();
        let peer = conn.peer_address();
        let handle = self.lease(&mut inner, conn, false);
        self.settle(&inner);
        drop(inner);
        self.shared
            .notifier
            .connection_created(&destination, handle.id().as_u64(), peer);
        Ok(handle)
    }

    // Gives back a slot which never became a connection.
    fn release_slot(&self, destination: &Destination) {
        let deliveries = {
            let mut inner = self.lock();
            inner.connecting -= 1;
            inner.forget(destination);
            let deliveries = inner.dispatch(&self.shared.limits, Instant::now());
            self.settle(&inner);
            deliveries
        };
        self.deliver(deliveries);
    }

    /// Returns a leased connection to the pool.
    ///
    /// The connection is kept if it is healthy, the pool is open, and
    /// connections are being pooled at all; otherwise it is closed.
    pub(crate) fn check_in(&self, mut conn: Connection<T>) {
        let now = Instant::now();
        let deliveries = {
            let mut inner = self.lock();
            inner.active.remove(&conn.id());
            let deliveries = if !inner.closed
                && self.shared.limits.pools_connections()
                && conn.release(now)
            {
                inner.park(&self.shared.limits, conn, now)
            } else {
                inner.close_unit(conn, "released");
                inner.dispatch(&self.shared.limits, now)
            };
            self.settle(&inner);
            deliveries
        };
        self.deliver(deliveries);
    }

    /// Closes a leased connection.
    pub(crate) fn discard(&self, conn: Connection<T>) {
        let deliveries = {
            let mut inner = self.lock();
            inner.active.remove(&conn.id());
            inner.close_unit(conn, "closed by caller");
            let deliveries = inner.dispatch(&self.shared.limits, Instant::now());
            self.settle(&inner);
            deliveries
        };
        self.deliver(deliveries);
    }

    /// Stops the pool: rejects every waiter, closes idle connections and
    /// revokes leased ones, dropping their transports. Idempotent.
    pub(crate) fn close(&self) {
        let (waiters, leases) = {
            let mut inner = self.lock();
            inner.closed = true;
            let mut waiters = Vec::new();
            let mut idle = Vec::new();
            for endpoint in inner.endpoints.values_mut() {
                waiters.extend(endpoint.waiters.drain(..));
                idle.extend(endpoint.idle.drain(..));
            }
            for conn in idle {
                inner.close_unit(conn, "pool closed");
            }
            // Endpoints only held by waiters are now unused.
            inner.endpoints.retain(|_, e| !e.is_unused());
            let leases: Vec<_> = inner.active.values().cloned().collect();
            self.settle(&inner);
            (waiters, leases)
        };
        event!(
            Level::DEBUG,
            waiters = waiters.len(),
            active = leases.len(),
            "Closing pool"
        );
        // Dropping the senders wakes each waiter with "closed".
        drop(waiters);
        // The slots stay counted until each handle is dropped.
        for lease in leases {
            lease.revoke();
        }
    }

    /// Waits until no slot is between being granted and becoming a
    /// connection.
    pub(crate) async fn drained(&self) {
        let mut rx = self.shared.connecting_tx.subscribe();
        let _ = rx.wait_for(|connecting| *connecting == 0).await;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Samples the pool's counters at a single point-in-time.
    pub fn stats(&self) -> Stats {
        self.lock().stats()
    }
}

// Removes a waiter from its queue if the caller stops waiting, and takes
// back any grant which raced with that.
struct WaitGuard<'a, T: Transport> {
    pool: &'a Pool<T>,
    destination: &'a Destination,
    seq: u64,
    rx: Option<oneshot::Receiver<Grant<T>>>,
}

impl<T: Transport> WaitGuard<'_, T> {
    // Returns None if the pool closed.
    async fn wait(&mut self) -> Option<Grant<T>> {
        let rx = self.rx.as_mut()?;
        let result = rx.await;
        self.rx = None;
        result.ok()
    }
}

impl<T: Transport> Drop for WaitGuard<'_, T> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        {
            let mut inner = self.pool.lock();
            inner.remove_waiter(self.destination, self.seq);
            self.pool.settle(&inner);
        }
        rx.close();
        if let Ok(grant) = rx.try_recv() {
            self.pool.reclaim(self.destination, grant);
        }
    }
}

/// Permission to open one new connection to a destination.
///
/// The slot is counted against the limits until it becomes a connection
/// with [SlotGuard::into_handle]. Dropping the guard gives the slot back.
#[derive_where(Debug)]
pub struct SlotGuard<T: Transport> {
    #[derive_where(skip)]
    pool: Pool<T>,
    destination: Destination,
    armed: bool,
}

impl<T: Transport> SlotGuard<T> {
    fn new(pool: Pool<T>, destination: &Destination) -> Self {
        Self {
            pool,
            destination: destination.clone(),
            armed: true,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Turns the slot into a connection over `transport`, leased to the
    /// caller.
    ///
    /// Fails if the pool was closed in the meantime, in which case the
    /// transport is dropped.
    pub fn into_handle(mut self, transport: T, peer: SocketAddr) -> Result<Handle<T>, Error> {
        self.armed = false;
        let conn = Connection::new(transport, self.destination.clone(), peer);
        self.pool.adopt(conn)
    }
}

impl<T: Transport> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot(&self.destination);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::deadline::DeadlineScheduler;
    use crate::test_utils::{setup_tracing_subscriber, Event, MockTransport, ScriptedFactory};
    use crate::destination::ResolvedAddress;
    use crate::transport::SocketFactory;
    use futures::FutureExt;

    fn limits(total: usize, per_host: usize) -> Limits {
        Limits {
            total,
            per_host,
            keep_alive: Some(Duration::from_secs(15)),
            force_close: false,
        }
    }

    fn dest(host: &str) -> Destination {
        Destination::http(host, 80)
    }

    async fn connect(
        factory: &ScriptedFactory,
        acquired: Acquired<MockTransport>,
    ) -> Handle<MockTransport> {
        match acquired {
            Acquired::Reused(handle) => handle,
            Acquired::Slot(slot) => {
                let address = ResolvedAddress::new("10.0.0.1:80".parse().unwrap());
                let transport = factory.connect(&address).await.unwrap();
                slot.into_handle(transport, address.address).unwrap()
            }
        }
    }

    fn expect_slot(acquired: Acquired<MockTransport>) -> SlotGuard<MockTransport> {
        match acquired {
            Acquired::Slot(slot) => slot,
            Acquired::Reused(_) => panic!("expected a slot"),
        }
    }

    fn expect_reused(acquired: Acquired<MockTransport>) -> Handle<MockTransport> {
        match acquired {
            Acquired::Reused(handle) => handle,
            Acquired::Slot(_) => panic!("expected an idle connection"),
        }
    }

    #[tokio::test]
    async fn limits_are_never_exceeded() {
        setup_tracing_subscriber();
        let pool = Pool::<MockTransport>::new(limits(3, 2));
        let factory = ScriptedFactory::new(Duration::ZERO);
        let hosts = ["a", "b", "c"];

        // Drive a deterministic mix of acquires and releases.
        let mut held = Vec::new();
        let mut queued = Vec::new();
        for step in 0..60usize {
            let destination = dest(hosts[step * 7 % 3]);
            if step % 4 == 3 && !held.is_empty() {
                let handle: Handle<MockTransport> = held.remove(step % held.len());
                if step % 8 == 3 {
                    handle.close();
                } else {
                    drop(handle);
                }
            } else {
                let pool = pool.clone();
                let mut acquire = Box::pin(async move { pool.acquire(&destination, None).await });
                match (&mut acquire).now_or_never() {
                    Some(acquired) => held.push(connect(&factory, acquired.unwrap()).await),
                    None => queued.push(acquire),
                }
            }

            let stats = pool.stats();
            assert!(stats.in_flight <= 3, "step {step}: {stats:?}");
            for (destination, e) in &stats.destinations {
                assert!(e.in_flight <= 2, "step {step}: {destination:?} {e:?}");
            }
        }

        drop(queued);
        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.connecting, 0);
        assert!(stats.in_flight <= 3);
    }

    #[tokio::test]
    async fn idle_connections_are_reused() {
        let pool = Pool::new(limits(10, 0));
        let factory = ScriptedFactory::new(Duration::ZERO);

        let first = connect(&factory, pool.acquire(&dest("a"), None).await.unwrap()).await;
        let id = first.id();
        drop(first);

        let second = expect_reused(pool.acquire(&dest("a"), None).await.unwrap());
        assert_eq!(second.id(), id);
        assert!(second.is_reused());
        assert_eq!(factory.attempts(), 1);

        // Other destinations never get it.
        expect_slot(pool.acquire(&Destination::https("a", 80), None).await.unwrap());
        expect_slot(pool.acquire(&dest("b"), None).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_connections_are_evicted() {
        let pool = Pool::new(limits(10, 0));
        let factory = ScriptedFactory::new(Duration::ZERO);

        // Expired by keep-alive.
        drop(connect(&factory, pool.acquire(&dest("a"), None).await.unwrap()).await);
        tokio::time::advance(Duration::from_secs(16)).await;
        let slot = expect_slot(pool.acquire(&dest("a"), None).await.unwrap());
        assert_eq!(pool.stats().in_flight, 1);
        drop(slot);

        // Closed by the peer while idle.
        let handle = connect(&factory, pool.acquire(&dest("a"), None).await.unwrap()).await;
        handle.with_transport(|t| t.simulate_peer_close());
        let id = handle.id();
        drop(handle);
        // Peer-closed on release, so never parked.
        assert_eq!(pool.stats().idle, 0);

        let handle = connect(&factory, pool.acquire(&dest("a"), None).await.unwrap()).await;
        assert_ne!(handle.id(), id);
        drop(handle);
        assert_eq!(pool.stats().idle, 1);

        // Closed by the peer after being parked.
        let stats = pool.stats();
        assert_eq!(stats.in_flight, 1);
        {
            let inner = pool.lock();
            inner.endpoints[&dest("a")].idle[0]
                .transport()
                .unwrap()
                .simulate_peer_close();
        }
        let slot = expect_slot(pool.acquire(&dest("a"), None).await.unwrap());
        assert_eq!(pool.stats().in_flight, 1);
        assert_eq!(pool.stats().idle, 0);
        drop(slot);
        assert_eq!(pool.stats(), Stats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_handoffs_close_and_keep_the_slot() {
        setup_tracing_subscriber();
        let pool = Pool::<MockTransport>::new(limits(1, 0));
        let factory = ScriptedFactory::new(Duration::ZERO);
        let destination = dest("a");
        let handle = connect(&factory, pool.acquire(&destination, None).await.unwrap()).await;

        let mut waiting = Box::pin(pool.acquire(&destination, None));
        assert!((&mut waiting).now_or_never().is_none());
        // Handed to the waiter, which only looks at it after keep-alive.
        drop(handle);
        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(!matches!(factory.events().last(), Some(Event::Closed(_))));

        let slot = expect_slot(waiting.await.unwrap());
        assert!(matches!(factory.events().last(), Some(Event::Closed(_))));
        let stats = pool.stats();
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.connecting, 1);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.active, 0);

        drop(slot);
        assert_eq!(pool.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let pool = Pool::<MockTransport>::new(limits(1, 0));
        let factory = ScriptedFactory::new(Duration::ZERO);
        let holder = connect(&factory, pool.acquire(&dest("a"), None).await.unwrap()).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..3 {
            let task_pool = pool.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let acquired = task_pool.acquire(&dest("a"), None).await.unwrap();
                order.lock().unwrap().push(i);
                // Hold the connection briefly, then give it back.
                let handle = expect_reused(acquired);
                tokio::task::yield_now().await;
                drop(handle);
            }));
            // Let the task enqueue before spawning the next.
            while pool.stats().waiting < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(holder);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(factory.attempts(), 1);
    }

    #[tokio::test]
    async fn freed_slots_go_to_the_oldest_eligible_waiter() {
        let pool = Pool::<MockTransport>::new(limits(2, 1));
        let a = expect_slot(pool.acquire(&dest("a"), None).await.unwrap());
        let b = expect_slot(pool.acquire(&dest("b"), None).await.unwrap());

        // "a" is blocked per-host, "c" only by the total.
        let (dest_a, dest_c) = (dest("a"), dest("c"));
        let mut wait_a = Box::pin(pool.acquire(&dest_a, None));
        assert!((&mut wait_a).now_or_never().is_none());
        let mut wait_c = Box::pin(pool.acquire(&dest_c, None));
        assert!((&mut wait_c).now_or_never().is_none());
        assert_eq!(pool.stats().waiting, 2);

        // Freeing "b" does not help the older "a" waiter, so "c" gets it.
        drop(b);
        let c = expect_slot(wait_c.await.unwrap());
        assert_eq!(c.destination(), &dest("c"));
        assert!((&mut wait_a).now_or_never().is_none());

        drop(a);
        expect_slot(wait_a.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn total_limit_evicts_idle_connections_elsewhere() {
        let pool = Pool::new(limits(2, 0));
        let factory = ScriptedFactory::new(Duration::ZERO);

        drop(connect(&factory, pool.acquire(&dest("a"), None).await.unwrap()).await);
        tokio::time::advance(Duration::from_secs(1)).await;
        drop(connect(&factory, pool.acquire(&dest("b"), None).await.unwrap()).await);
        assert_eq!(pool.stats().idle, 2);

        // "a" idled first, so it goes.
        let _c = expect_slot(pool.acquire(&dest("c"), None).await.unwrap());
        let stats = pool.stats();
        assert_eq!(stats.in_flight, 2);
        assert!(!stats.destinations.contains_key(&dest("a")));
        assert_eq!(stats.destinations[&dest("b")].idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_times_out() {
        let pool = Pool::<MockTransport>::new(limits(1, 0));
        let _held = expect_slot(pool.acquire(&dest("a"), None).await.unwrap());

        let scheduler = DeadlineScheduler::default();
        let deadline = scheduler.schedule(Some(Duration::from_millis(100)));
        let err = pool
            .acquire(&dest("a"), deadline.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert_eq!(pool.stats().waiting, 0);
        assert_eq!(pool.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn cancelled_waiters_leave_no_trace() {
        let pool = Pool::<MockTransport>::new(limits(1, 0));
        let held = expect_slot(pool.acquire(&dest("a"), None).await.unwrap());

        let other = dest("b");
        let mut waiting = Box::pin(pool.acquire(&other, None));
        assert!((&mut waiting).now_or_never().is_none());
        assert_eq!(pool.stats().waiting, 1);
        drop(waiting);
        assert_eq!(pool.stats().waiting, 0);

        drop(held);
        assert_eq!(pool.stats(), Stats::default());
    }

    #[tokio::test]
    async fn grants_to_departed_waiters_are_reclaimed() {
        let pool = Pool::<MockTransport>::new(limits(1, 0));
        let destination = dest("a");
        let held = expect_slot(pool.acquire(&destination, None).await.unwrap());

        let mut waiting = Box::pin(pool.acquire(&destination, None));
        assert!((&mut waiting).now_or_never().is_none());

        // The slot is granted, but the waiter leaves before looking.
        drop(held);
        assert_eq!(pool.stats().in_flight, 1);
        drop(waiting);
        assert_eq!(pool.stats(), Stats::default());
    }

    #[tokio::test]
    async fn force_close_never_pools() {
        let pool = Pool::new(Limits {
            force_close: true,
            ..limits(10, 0)
        });
        let factory = ScriptedFactory::new(Duration::ZERO);

        drop(connect(&factory, pool.acquire(&dest("a"), None).await.unwrap()).await);
        assert_eq!(pool.stats(), Stats::default());
    }

    #[tokio::test]
    async fn closing_rejects_waiters_and_new_callers() {
        let pool = Pool::<MockTransport>::new(limits(1, 0));
        let factory = ScriptedFactory::new(Duration::ZERO);
        let destination = dest("a");
        let held = expect_slot(pool.acquire(&destination, None).await.unwrap());

        let mut waiting = Box::pin(pool.acquire(&destination, None));
        assert!((&mut waiting).now_or_never().is_none());

        pool.close();
        assert_eq!(waiting.await.unwrap_err(), Error::Closed);
        assert_eq!(
            pool.acquire(&dest("a"), None).await.unwrap_err(),
            Error::Closed
        );

        // A connect finishing after close is discarded.
        assert!(pool.drained().now_or_never().is_none());
        let address = ResolvedAddress::new("10.0.0.1:80".parse().unwrap());
        let transport = factory.connect(&address).await.unwrap();
        assert_eq!(
            held.into_handle(transport, address.address).unwrap_err(),
            Error::Closed
        );
        pool.drained().await;
        assert_eq!(pool.stats(), Stats::default());
    }
}
