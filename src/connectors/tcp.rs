//! Implementation of [SocketFactory] for TCP.

use crate::destination::ResolvedAddress;
use crate::transport::SocketFactory;

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpSocket, TcpStream};

/// Opens plain TCP connections.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    local_addr: Option<IpAddr>,
    nodelay: bool,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds outgoing sockets to `local_addr` before connecting.
    ///
    /// Addresses of the other family are connected without binding.
    pub fn with_local_addr(self, local_addr: IpAddr) -> Self {
        Self {
            local_addr: Some(local_addr),
            ..self
        }
    }

    /// Sets `TCP_NODELAY` on every connection.
    pub fn with_nodelay(self, nodelay: bool) -> Self {
        Self { nodelay, ..self }
    }
}

#[async_trait]
impl SocketFactory for TcpConnector {
    type Socket = TcpStream;

    async fn connect(&self, address: &ResolvedAddress) -> std::io::Result<Self::Socket> {
        let target = address.address;
        let stream = match self.local_addr {
            Some(local) if local.is_ipv4() == target.is_ipv4() => {
                let socket = if target.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(SocketAddr::new(local, 0))?;
                socket.connect(target).await?
            }
            _ => TcpStream::connect(target).await?,
        };
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}
