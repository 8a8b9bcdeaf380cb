//! tether is the transport acquisition layer of an async HTTP client.
//!
//! tether turns a logical request for a [destination::Destination] into a
//! live connection, while sharing, reusing and bounding sockets across many
//! concurrent requests.
//!
//! It uses the following terminology:
//! * A destination is the `(host, port, is_secure)` triple which keys pooling
//!   and per-host limits.
//! * A slot is the right to hold one connection. Slots are counted from the
//!   moment they are granted until the connection is definitively closed, so
//!   connecting, active and idle connections all consume one.
//! * A handle is the caller's lease on a connection. Dropping it returns the
//!   connection to the pool.
//!
//! # Usage
//!
//! * The main interface for this crate is [connector::Connector].
//! * To construct a connector, you must supply a [resolver::Resolver] and
//!   a [transport::SocketFactory]. These are interfaces which specify "how to
//!   find addresses for a host" and "how to open a socket to one address",
//!   respectively. Secure destinations additionally need a
//!   [transport::TlsLayer].
//!
//! # DTrace probes
//!
//! tether contains a number of DTrace USDT probes, which fire as the connector
//! hands out connections. The full list of probes is:
//!
//! - `connect-start`: Fires before a caller starts acquiring a connection.
//! - `connect-done`: Fires before returning a connection to the caller.
//! - `connect-failed`: Fires when a caller could not acquire a connection.
//! - `slot-queued`: Fires when a caller must wait for a free slot.
//! - `slot-granted`: Fires when a caller is granted a slot for a new
//!   connection.
//! - `connection-created`: Fires when a new connection is established.
//! - `connection-reused`: Fires when an idle connection is handed out.
//! - `connection-closed`: Fires when the pool closes a connection.
//! - `dns-cache-hit`: Fires when a host is answered from the name cache.
//! - `dns-cache-miss`: Fires when a host must be resolved.
//! - `dns-resolve-failed`: Fires when the resolver fails for a host.
//! - `race-attempt-start`: Fires when the racer starts connecting to one
//!   address.
//! - `race-attempt-failed`: Fires when one raced address fails.
//! - `race-done`: Fires when an address wins the race.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly enabled,
//! by tracing the program with the `dtrace(1)` command-line tool.
//!
//! Registering the probes is technically fallible. The
//! `connector::Connector::new` constructor therefore returns a `Result` whose
//! error variant still gives access to the connector, so applications may
//! either propagate the failure or keep an uninstrumented connector.

// Public API
pub mod connection;
pub mod connector;
pub mod deadline;
pub mod destination;
pub mod handle;
pub mod name_cache;
pub mod observer;
pub mod policy;
pub mod pool;
pub mod racer;
pub mod resolver;
pub mod transport;

#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod connectors;
pub mod resolvers;

use std::sync::atomic::{AtomicU64, Ordering};

/// Uniquely identifies one call to [connector::Connector::connect].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct AcquireId(pub u64);

impl AcquireId {
    fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for AcquireId {
    fn default() -> Self {
        Self::new()
    }
}

/// USDT probes for tracing how tether acquires and hands out connections.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "tether")]
mod probes {
    /// Fires right before a caller starts acquiring a connection.
    fn connect__start(destination: &str, acquire_id: u64) {}

    /// Fires when a connection is handed to the caller.
    ///
    /// Also identifies the underlying connection.
    fn connect__done(destination: &str, acquire_id: u64, conn_id: u64) {}

    /// Fires when we _fail_ to hand out a connection, with a string
    /// identifying the reason.
    fn connect__failed(destination: &str, acquire_id: u64, reason: &str) {}

    /// Fires when a caller is enqueued behind the pool limits.
    fn slot__queued(destination: &str) {}

    /// Fires when a caller is granted a slot to open a new connection.
    fn slot__granted(destination: &str) {}

    /// Fires when a new connection has been established, with the address
    /// which won the race.
    fn connection__created(destination: &str, conn_id: u64, addr: &str) {}

    /// Fires when an idle connection is handed out again.
    fn connection__reused(destination: &str, conn_id: u64) {}

    /// Fires when the pool closes a connection, with a string identifying
    /// the reason.
    fn connection__closed(destination: &str, conn_id: u64, reason: &str) {}

    /// Fires when a host is answered from the name cache.
    fn dns__cache__hit(host: &str) {}

    /// Fires when a host must be resolved.
    fn dns__cache__miss(host: &str) {}

    /// Fires when the resolver fails for a host, with a string identifying
    /// the kind of failure.
    fn dns__resolve__failed(host: &str, reason: &str) {}

    /// Fires right before connecting to one raced address.
    fn race__attempt__start(addr: &str) {}

    /// Fires when connecting to one raced address fails.
    fn race__attempt__failed(addr: &str, reason: &str) {}

    /// Fires when one address wins the race.
    fn race__done(addr: &str, attempts: u64) {}
}
