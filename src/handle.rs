//! Connections which are leased from the pool.

use crate::connection::Connection;
use crate::pool::Pool;
use crate::transport::Transport;

use futures::task::AtomicWaker;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Shares a leased transport with the pool, so that closing the connector
/// can drop it while a caller still holds the handle.
pub(crate) struct Lease<T> {
    transport: Mutex<Option<T>>,
    revoked: AtomicBool,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
}

impl<T> Lease<T> {
    pub(crate) fn new(transport: Option<T>) -> Self {
        Self {
            transport: Mutex::new(transport),
            revoked: AtomicBool::new(false),
            read_waker: AtomicWaker::new(),
            write_waker: AtomicWaker::new(),
        }
    }

    /// Drops the transport and wakes pending I/O.
    pub(crate) fn revoke(&self) {
        // Set before taking the lock, so pollers which find the transport
        // gone also find the flag.
        self.revoked.store(true, Ordering::SeqCst);
        let transport = self.transport.lock().unwrap().take();
        drop(transport);
        self.read_waker.wake();
        self.write_waker.wake();
    }

    fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    // Takes the transport back when the lease ends.
    fn take(&self) -> Option<T> {
        self.transport.lock().unwrap().take()
    }
}

impl<T> std::fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("revoked", &self.is_revoked())
            .finish_non_exhaustive()
    }
}

/// A [Connection] which is returned to the pool when dropped.
///
/// The handle implements [std::ops::Deref] for the [Connection], and, when
/// the transport supports it, [AsyncRead] and [AsyncWrite].
///
/// While leased, the transport is held by the lease rather than the
/// [Connection], so [Connection::transport] returns `None`; reach it through
/// [Handle::with_transport] or the I/O traits instead.
///
/// If the connector is closed while the handle is alive, the lease is
/// revoked: the transport is dropped at once, and pending and future I/O
/// fails with [io::ErrorKind::ConnectionAborted].
pub struct Handle<T: Transport> {
    inner: Option<Connection<T>>,
    pool: Pool<T>,
    lease: Arc<Lease<T>>,
    reused: bool,
}

impl<T: Transport> Handle<T> {
    pub(crate) fn new(conn: Connection<T>, pool: Pool<T>, lease: Arc<Lease<T>>, reused: bool) -> Self {
        Self {
            inner: Some(conn),
            pool,
            lease,
            reused,
        }
    }

    /// True if this connection was previously used by another caller.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// True if the connector was closed while this handle was alive.
    pub fn is_revoked(&self) -> bool {
        self.lease.is_revoked()
    }

    /// Calls `f` with the transport, unless it has been dropped.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.lease.transport.lock().unwrap().as_mut().map(f)
    }

    /// True if the peer has gone away, or the transport was dropped.
    pub fn is_peer_closed(&self) -> bool {
        self.with_transport(|t| t.is_peer_closed()).unwrap_or(true)
    }

    /// Returns the connection to the pool. Equivalent to dropping the handle.
    pub fn release(self) {}

    /// Closes the connection instead of returning it to the pool.
    pub fn close(mut self) {
        if let Some(conn) = self.reclaim() {
            self.pool.discard(conn);
        }
    }

    // Ends the lease, moving the transport back into the connection.
    fn reclaim(&mut self) -> Option<Connection<T>> {
        let mut conn = self.inner.take()?;
        if let Some(transport) = self.lease.take() {
            conn.put_transport(transport);
        }
        Some(conn)
    }
}

// Polls the leased transport with `f`, after registering for revocation
// wakeups.
fn poll_io<T: Transport + Unpin, R>(
    inner: &mut Option<Connection<T>>,
    lease: &Lease<T>,
    waker: &AtomicWaker,
    cx: &mut Context<'_>,
    f: impl FnOnce(Pin<&mut T>, &mut Context<'_>) -> Poll<io::Result<R>>,
) -> Poll<io::Result<R>> {
    waker.register(cx.waker());
    let mut transport = lease.transport.lock().unwrap();
    if lease.is_revoked() {
        if let Some(conn) = inner.as_mut() {
            conn.close();
        }
        return Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "connector closed",
        )));
    }
    match transport.as_mut() {
        Some(transport) => f(Pin::new(transport), cx),
        None => Poll::Ready(Err(io::Error::from(io::ErrorKind::NotConnected))),
    }
}

impl<T: Transport> std::ops::Deref for Handle<T> {
    type Target = Connection<T>;
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref().unwrap()
    }
}

impl<T: Transport> std::ops::DerefMut for Handle<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut().unwrap()
    }
}

impl<T: Transport> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("connection", &self.inner)
            .field("reused", &self.reused)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

impl<T: Transport> Drop for Handle<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.reclaim() {
            self.pool.check_in(conn);
        }
    }
}

impl<T: Transport + AsyncRead + Unpin> AsyncRead for Handle<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let Self { inner, lease, .. } = self.get_mut();
        poll_io(inner, lease, &lease.read_waker, cx, |t, cx| t.poll_read(cx, buf))
    }
}

impl<T: Transport + AsyncWrite + Unpin> AsyncWrite for Handle<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let Self { inner, lease, .. } = self.get_mut();
        poll_io(inner, lease, &lease.write_waker, cx, |t, cx| t.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Self { inner, lease, .. } = self.get_mut();
        poll_io(inner, lease, &lease.write_waker, cx, |t, cx| t.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Self { inner, lease, .. } = self.get_mut();
        poll_io(inner, lease, &lease.write_waker, cx, |t, cx| t.poll_shutdown(cx))
    }
}
