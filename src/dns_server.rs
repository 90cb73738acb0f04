//! UDP listener: receives query datagrams and hands each one to the
//! dispatcher on its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::packet::PACKET_SIZE;
use crate::resolver::Resolver;

pub struct DnsServer {
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
}

impl DnsServer {
    pub async fn bind(addr: SocketAddr, resolver: Arc<Resolver>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("unable to bind UDP listener on {}", addr))?;
        info!("🚀 DNS listener bound on udp://{}", addr);
        Ok(Self {
            socket: Arc::new(socket),
            resolver,
        })
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serves until the shutdown signal flips. Receive errors are logged
    /// and the loop keeps going; every accepted datagram is answered.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            // 每个数据报独立一份 512 字节缓冲，避免残留上一个请求的字节。
            let mut buf = [0u8; PACKET_SIZE];
            let (len, peer) = tokio::select! {
                _ = shutdown_rx.changed() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Error receiving request: {}", e);
                        continue;
                    }
                }
            };
            debug!("Serving request: {} bytes from {}", len, peer);

            let socket = self.socket.clone();
            let resolver = self.resolver.clone();
            tokio::spawn(async move {
                let response = resolver.handle_request(&buf).await;
                if let Err(e) = socket.send_to(&response, peer).await {
                    error!("Unable to send response back to the client: {}", e);
                }
            });
        }
        info!("DNS listener shut down");
    }
}
