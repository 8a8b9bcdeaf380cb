//! Utilities to help with testing tether

use crate::destination::{AddressFamily, Destination, ResolvedAddress};
use crate::observer::Observer;
use crate::resolver::{self, Resolver};
use crate::resolvers::fixed::FixedResolver;
use crate::transport::{self, SocketFactory, TlsLayer, Transport, Verification};

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::time::Instant;

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// A resolver which counts its calls, and can be slowed down or made to
/// fail.
pub struct CountingResolver {
    inner: FixedResolver,
    calls: AtomicUsize,
    delay: Duration,
    fail_next: AtomicBool,
}

impl CountingResolver {
    pub fn new<H: Into<String>>(hosts: impl IntoIterator<Item = (H, Vec<IpAddr>)>) -> Self {
        Self {
            inner: FixedResolver::new(hosts),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    /// Makes the next lookup fail with a lookup error.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for CountingResolver {
    async fn resolve_host(
        &self,
        host: &str,
        family: AddressFamily,
    ) -> Result<Vec<IpAddr>, resolver::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(resolver::Error::lookup(host, "SERVFAIL"));
        }
        self.inner.resolve_host(host, family).await
    }
}

/// Something which happened to a socket opened by [ScriptedFactory].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Started(SocketAddr),
    Connected(SocketAddr),
    Failed(SocketAddr),
    Cancelled(SocketAddr),
    Closed(SocketAddr),
}

type EventLog = Arc<Mutex<Vec<(Duration, Event)>>>;

fn record(log: &EventLog, epoch: Instant, event: Event) {
    log.lock().unwrap().push((epoch.elapsed(), event));
}

/// An in-memory connection handed out by [ScriptedFactory].
#[derive(Debug)]
pub struct MockTransport {
    io: DuplexStream,
    address: SocketAddr,
    peer_closed: AtomicBool,
    log: EventLog,
    epoch: Instant,
}

impl MockTransport {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Makes the connection look like the peer went away.
    pub fn simulate_peer_close(&self) {
        self.peer_closed.store(true, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn is_peer_closed(&self) -> bool {
        self.peer_closed.load(Ordering::SeqCst)
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        record(&self.log, self.epoch, Event::Closed(self.address));
    }
}

impl AsyncRead for MockTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// How a scripted connection attempt ends.
#[derive(Clone, Copy, Debug)]
pub enum Outcome {
    Connect,
    Refuse,
    Hang,
}

// Records a cancellation if the attempt is dropped before it resolves.
struct CancelGuard {
    log: EventLog,
    epoch: Instant,
    address: SocketAddr,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            record(&self.log, self.epoch, Event::Cancelled(self.address));
        }
    }
}

/// A socket factory whose attempts succeed or fail after scripted delays,
/// logging everything that happens to its sockets.
pub struct ScriptedFactory {
    scripts: Mutex<HashMap<SocketAddr, (Duration, Outcome)>>,
    default: (Duration, Outcome),
    log: EventLog,
    epoch: Instant,
    // Far ends of handed out connections, kept open.
    peers: Mutex<Vec<DuplexStream>>,
    attempts: AtomicUsize,
}

impl ScriptedFactory {
    /// Every address connects after `delay`, unless scripted otherwise.
    pub fn new(delay: Duration) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default: (delay, Outcome::Connect),
            log: Arc::new(Mutex::new(Vec::new())),
            epoch: Instant::now(),
            peers: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn script(self, address: SocketAddr, delay: Duration, outcome: Outcome) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(address, (delay, outcome));
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().unwrap().iter().map(|(_, e)| *e).collect()
    }

    /// Events with the time they happened, relative to the factory's
    /// creation.
    pub fn timeline(&self) -> Vec<(Duration, Event)> {
        self.log.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketFactory for ScriptedFactory {
    type Socket = MockTransport;

    async fn connect(&self, address: &ResolvedAddress) -> std::io::Result<MockTransport> {
        let address = address.address;
        let (delay, outcome) = self
            .scripts
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(self.default);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        record(&self.log, self.epoch, Event::Started(address));

        let mut guard = CancelGuard {
            log: self.log.clone(),
            epoch: self.epoch,
            address,
            armed: true,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Outcome::Hang = outcome {
            std::future::pending::<()>().await;
        }
        guard.armed = false;

        match outcome {
            Outcome::Connect => {
                record(&self.log, self.epoch, Event::Connected(address));
                let (io, peer) = tokio::io::duplex(1024);
                self.peers.lock().unwrap().push(peer);
                Ok(MockTransport {
                    io,
                    address,
                    peer_closed: AtomicBool::new(false),
                    log: self.log.clone(),
                    epoch: self.epoch,
                })
            }
            Outcome::Refuse | Outcome::Hang => {
                record(&self.log, self.epoch, Event::Failed(address));
                Err(std::io::ErrorKind::ConnectionRefused.into())
            }
        }
    }
}

/// A TLS layer which records the verification it was asked to use.
#[derive(Default)]
pub struct RecordingTls {
    seen: Mutex<Vec<(Destination, String)>>,
    fail: bool,
}

impl RecordingTls {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn seen(&self) -> Vec<(Destination, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TlsLayer<MockTransport> for RecordingTls {
    async fn upgrade(
        &self,
        socket: MockTransport,
        destination: &Destination,
        verification: &Verification,
    ) -> Result<MockTransport, transport::Error> {
        self.seen
            .lock()
            .unwrap()
            .push((destination.clone(), format!("{verification:?}")));
        if self.fail {
            return Err(transport::Error::Other(anyhow::anyhow!(
                "certificate verify failed"
            )));
        }
        Ok(socket)
    }
}

/// An observer which records each notification by name.
#[derive(Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.seen.lock().unwrap().push(event);
    }
}

impl Observer for RecordingObserver {
    fn slot_queued(&self, destination: &Destination) {
        self.push(format!("slot_queued {destination}"));
    }

    fn slot_granted(&self, destination: &Destination) {
        self.push(format!("slot_granted {destination}"));
    }

    fn connection_created(&self, destination: &Destination, peer: SocketAddr) {
        self.push(format!("connection_created {destination} {peer}"));
    }

    fn connection_reused(&self, destination: &Destination) {
        self.push(format!("connection_reused {destination}"));
    }

    fn dns_cache_hit(&self, host: &str) {
        self.push(format!("dns_cache_hit {host}"));
    }

    fn dns_cache_miss(&self, host: &str) {
        self.push(format!("dns_cache_miss {host}"));
    }
}
