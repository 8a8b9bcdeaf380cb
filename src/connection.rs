//! A single live connection, and the state it is in.

use crate::destination::Destination;
use crate::transport::Transport;

use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{event, Level};

/// Uniquely identifies a connection within the process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The state of an individual connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum State {
    // Leased to a caller through a handle.
    //
    // - (On release, if reusable) State becomes Idle
    // - (On release, otherwise) State becomes Closed
    Active,

    // Owned by the pool, waiting to be reused.
    //
    // - (On reuse) State becomes Active
    // - (On eviction) State becomes Closed
    Idle,

    // The transport is being torn down.
    Closing,

    // Final state. The transport has been dropped.
    Closed,
}

/// A transport together with where it goes and how it has been used.
///
/// A connection does not know about the pool which owns it; the pool
/// removes it from its own collections.
#[derive_where(Debug)]
pub struct Connection<T: Transport> {
    id: ConnectionId,
    transport: Option<DebugIgnore<T>>,
    destination: Destination,
    peer: SocketAddr,
    created_at: Instant,
    last_used_at: Instant,
    state: State,
}

impl<T: Transport> Connection<T> {
    /// Wraps a freshly established transport, leased to its creator.
    pub(crate) fn new(transport: T, destination: Destination, peer: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            transport: Some(DebugIgnore(transport)),
            destination,
            peer,
            created_at: now,
            last_used_at: now,
            state: State::Active,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// The address which won the race for this connection.
    pub fn peer_address(&self) -> SocketAddr {
        self.peer
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection last went idle (or was created).
    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The underlying transport, unless the connection is closed or leased
    /// through a [crate::handle::Handle].
    pub fn transport(&self) -> Option<&T> {
        self.transport.as_deref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.transport.as_deref_mut()
    }

    pub(crate) fn take_transport(&mut self) -> Option<T> {
        self.transport.take().map(|t| t.0)
    }

    // A closed connection stays closed; the transport is dropped.
    pub(crate) fn put_transport(&mut self, transport: T) {
        if self.state != State::Closed {
            self.transport = Some(DebugIgnore(transport));
        }
    }

    /// True if the peer has gone away, or the connection is closed.
    pub fn is_peer_closed(&self) -> bool {
        self.transport().map_or(true, |t| t.is_peer_closed())
    }

    /// True once the connection has idled for longer than `keep_alive`.
    pub fn is_expired(&self, now: Instant, keep_alive: Option<Duration>) -> bool {
        match keep_alive {
            None => false,
            Some(keep_alive) => now.saturating_duration_since(self.last_used_at) >= keep_alive,
        }
    }

    /// True if this idle connection may be handed out again.
    pub fn is_usable(&self, now: Instant, keep_alive: Option<Duration>) -> bool {
        self.state == State::Idle && !self.is_expired(now, keep_alive) && !self.is_peer_closed()
    }

    fn state_transition(&mut self, new: State) -> State {
        if self.state == State::Closed {
            return State::Closed;
        }
        event!(Level::TRACE, id = %self.id, from = ?self.state, to = ?new, "state_transition");
        std::mem::replace(&mut self.state, new)
    }

    /// Parks an active connection in the pool.
    ///
    /// Returns false (and closes the connection) if it cannot be reused.
    pub(crate) fn release(&mut self, now: Instant) -> bool {
        if self.state != State::Active || self.is_peer_closed() {
            self.close();
            return false;
        }
        self.last_used_at = now;
        self.state_transition(State::Idle);
        true
    }

    /// Leases an idle connection to a caller.
    pub(crate) fn activate(&mut self) {
        debug_assert_eq!(self.state, State::Idle);
        self.state_transition(State::Active);
    }

    /// Closes the connection, dropping its transport. Idempotent.
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state_transition(State::Closing);
        self.transport.take();
        self.state_transition(State::Closed);
    }
}
