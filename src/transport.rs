//! The interface for opening sockets and upgrading them to TLS.

use crate::destination::{Destination, ResolvedAddress};

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::ReadBuf;
use tokio::net::TcpStream;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error("Destination requires TLS, but no TLS layer is configured")]
    TlsUnavailable,

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Interface for raw connections.
pub trait Transport: Send + 'static {
    /// Returns true if the connection can no longer be reused.
    ///
    /// This must not block. Implementations should report a peer close or
    /// half-close, and any data the peer sent while the connection was idle.
    ///
    /// By default this reports every connection as open.
    fn is_peer_closed(&self) -> bool {
        false
    }
}

impl Transport for TcpStream {
    fn is_peer_closed(&self) -> bool {
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        match self.poll_peek(&mut cx, &mut buf) {
            Poll::Pending => false,
            // EOF, a reset, or bytes nobody asked for.
            Poll::Ready(_) => true,
        }
    }
}

/// Describes how a socket to a single address is opened.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    type Socket: Transport;

    /// Opens a socket to `address`.
    ///
    /// The future may be dropped at any point while the address is being
    /// raced against others; dropping it must release the socket.
    async fn connect(&self, address: &ResolvedAddress) -> std::io::Result<Self::Socket>;
}

pub type SharedSocketFactory<S> = Arc<dyn SocketFactory<Socket = S>>;

/// A SHA-256 certificate fingerprint.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("MD5 and SHA-1 fingerprints are insecure, use SHA-256")]
    Insecure,

    #[error("Fingerprint has invalid length {0}, expected 32 bytes (SHA-256)")]
    InvalidLength(usize),
}

impl Fingerprint {
    pub fn new(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns true if a certificate's SHA-256 `digest` matches.
    pub fn matches(&self, digest: &[u8]) -> bool {
        self.0.as_slice() == digest
    }
}

impl TryFrom<&[u8]> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(digest: &[u8]) -> Result<Self, Self::Error> {
        match digest.len() {
            // MD5 and SHA-1.
            16 | 20 => Err(FingerprintError::Insecure),
            _ => <[u8; 32]>::try_from(digest)
                .map(Self)
                .map_err(|_| FingerprintError::InvalidLength(digest.len())),
        }
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Fingerprint(")?;
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        f.write_str(")")
    }
}

/// How the peer's certificate should be verified.
///
/// The connector only routes this value to the [TlsLayer]; it never
/// inspects certificates itself.
#[derive(Clone, Default)]
pub enum Verification {
    /// Accept any certificate.
    TrustAll,

    /// The TLS layer's default verification.
    #[default]
    Default,

    /// Accept only a certificate with this SHA-256 fingerprint.
    Fingerprint(Fingerprint),

    /// A TLS-layer specific configuration, such as a prepared client
    /// config.
    Custom(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for Verification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verification::TrustAll => f.write_str("TrustAll"),
            Verification::Default => f.write_str("Default"),
            Verification::Fingerprint(fp) => fp.fmt(f),
            Verification::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Upgrades a freshly raced socket for a secure destination.
#[async_trait]
pub trait TlsLayer<S: Transport>: Send + Sync {
    async fn upgrade(
        &self,
        socket: S,
        destination: &Destination,
        verification: &Verification,
    ) -> Result<S, Error>;
}

pub type SharedTlsLayer<S> = Arc<dyn TlsLayer<S>>;
