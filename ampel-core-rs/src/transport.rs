//! Broadcast transport for Ampelnetz frames

use crate::error::TransportError;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Maximum frame size (64KB should be plenty for JSON)
const MAX_FRAME_SIZE: usize = 65536;

/// Unreliable broadcast medium.
///
/// Frames may be lost, duplicated or reordered. A sender may or may not
/// receive its own frames back.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame to every reachable peer
    async fn broadcast(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next frame
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;
}

/// UDP transport sending every frame to a fixed destination list
pub struct UdpTransport {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
}

impl UdpTransport {
    /// Bind a socket with broadcast enabled
    pub async fn bind(addr: SocketAddr, peers: Vec<SocketAddr>) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;
        debug!("UDP transport bound to {} with {} destinations", addr, peers.len());
        Ok(Self { socket, peers })
    }

    /// Get the local address this transport is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn broadcast(&self, frame: &[u8]) -> Result<(), TransportError> {
        for addr in &self.peers {
            debug!("Sending {} bytes to {}", frame.len(), addr);
            if let Err(e) = self.socket.send_to(frame, addr).await {
                warn!("Failed to send to {}: {}", addr, e);
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        let (len, src) = self.socket.recv_from(&mut buf).await?;
        debug!("Received {} bytes from {}", len, src);
        buf.truncate(len);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let receiver = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .unwrap();
        let target = receiver.local_addr().unwrap();

        let sender = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), vec![target])
            .await
            .unwrap();
        sender.broadcast(b"{\"hello\":1}").await.unwrap();

        let frame = receiver.recv().await.unwrap();
        assert_eq!(frame, b"{\"hello\":1}");
    }
}
