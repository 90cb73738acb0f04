//! UDP exchange with the configured upstream resolver.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::packet::PACKET_SIZE;

/// Seam between the dispatcher and whatever answers forwarded queries.
/// Implementations take one encoded request datagram and produce one
/// response datagram, or fail.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn call(&self, request: &[u8; PACKET_SIZE]) -> Result<[u8; PACKET_SIZE]>;
}

/// One-datagram-out, one-datagram-in client for a fixed upstream peer.
/// Each call binds its own ephemeral socket, so concurrent in-flight
/// requests never contend for shared connection state.
pub struct UdpUpstream {
    peer: SocketAddr,
    timeout: Duration,
}

impl UdpUpstream {
    pub fn new(peer: SocketAddr, timeout: Duration) -> Self {
        Self { peer, timeout }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Forwarder for UdpUpstream {
    async fn call(&self, request: &[u8; PACKET_SIZE]) -> Result<[u8; PACKET_SIZE]> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("unable to bind an ephemeral socket for the upstream exchange")?;
        socket
            .connect(self.peer)
            .await
            .with_context(|| format!("unable to reach upstream {}", self.peer))?;
        socket.send(&request[..]).await?;

        let mut response = [0u8; PACKET_SIZE];
        timeout(self.timeout, socket.recv(&mut response))
            .await
            .with_context(|| format!("upstream {} timed out", self.peer))??;
        Ok(response)
    }
}
