use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::events::EventDispatcher;

/// Errors raised by a datagram transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(String),
    #[error("transport closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Unreliable, unordered datagram capability used by the client.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Sends one datagram to `target`.
    async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> Result<(), TransportError>;

    /// Waits for the next datagram, returning its length and sender.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError>;
}

/// UDP socket bound to the configured local address with broadcast enabled.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(config: &ClientConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(config.local_addr).await?;
        socket.set_broadcast(true)?;
        let local = socket.local_addr()?;
        info!(%local, "udp transport listening");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> Result<(), TransportError> {
        self.socket.send_to(bytes, target).await?;
        debug!(peer = %target, len = bytes.len(), "udp datagram sent");
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        Ok(self.socket.recv_from(buf).await?)
    }
}

/// Spawns the inbound path: every received datagram is handed to the
/// dispatcher in arrival order. Stops when the transport reports `Closed`.
pub fn spawn_receiver<T>(
    transport: Arc<T>,
    dispatcher: Arc<EventDispatcher>,
    max_datagram_size: usize,
) -> JoinHandle<()>
where
    T: DatagramTransport + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; max_datagram_size];
        loop {
            match transport.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    debug!(%from, len, "datagram received");
                    dispatcher.dispatch_datagram(&buf[..len], from);
                }
                Err(TransportError::Closed) => {
                    debug!("transport closed, receiver stopping");
                    break;
                }
                Err(err) => warn!(error = %err, "receive failed"),
            }
        }
    })
}
