//! Runtime configuration assembled and validated from the command line.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// The upstream exchange is never allowed a timeout below this.
const MIN_UPSTREAM_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct Config {
    pub dns_bind: SocketAddr,
    pub admin_bind: SocketAddr,
    /// `None` means local-only mode: no forwarding, recursion not offered.
    pub upstream: Option<SocketAddr>,
    pub upstream_timeout: Duration,
}

impl Config {
    pub fn new(
        address: &str,
        dns_port: u16,
        admin_port: u16,
        upstream_addr: &str,
        upstream_port: u16,
        upstream_timeout_ms: u64,
    ) -> Result<Self> {
        let dns_bind: SocketAddr = format!("{}:{}", address, dns_port)
            .parse()
            .with_context(|| format!("invalid DNS bind address: {}:{}", address, dns_port))?;
        let admin_bind: SocketAddr = format!("{}:{}", address, admin_port)
            .parse()
            .with_context(|| format!("invalid admin bind address: {}:{}", address, admin_port))?;

        let upstream = if upstream_addr.is_empty() {
            info!("No upstream resolver configured, running in local-only mode");
            None
        } else {
            let peer: SocketAddr = format!("{}:{}", upstream_addr, upstream_port)
                .parse()
                .with_context(|| {
                    format!(
                        "invalid upstream address: {}:{}",
                        upstream_addr, upstream_port
                    )
                })?;
            Some(peer)
        };

        let mut upstream_timeout = Duration::from_millis(upstream_timeout_ms);
        if upstream_timeout < MIN_UPSTREAM_TIMEOUT {
            warn!(
                "Upstream timeout {}ms is below the {}ms floor, clamping.",
                upstream_timeout_ms,
                MIN_UPSTREAM_TIMEOUT.as_millis()
            );
            upstream_timeout = MIN_UPSTREAM_TIMEOUT;
        }

        Ok(Self {
            dns_bind,
            admin_bind,
            upstream,
            upstream_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_upstream_means_local_only() {
        let config = Config::new("127.0.0.1", 4000, 5000, "", 53, 2000).unwrap();
        assert!(config.upstream.is_none());
    }

    #[test]
    fn upstream_address_is_combined_with_its_port() {
        let config = Config::new("0.0.0.0", 4000, 5000, "8.8.8.8", 53, 2000).unwrap();
        assert_eq!(config.upstream.unwrap().to_string(), "8.8.8.8:53");
    }

    #[test]
    fn upstream_timeout_is_clamped_to_the_floor() {
        let config = Config::new("0.0.0.0", 4000, 5000, "8.8.8.8", 53, 100).unwrap();
        assert_eq!(config.upstream_timeout, Duration::from_millis(500));
    }

    #[test]
    fn malformed_bind_address_is_rejected() {
        assert!(Config::new("not-an-ip", 4000, 5000, "", 53, 2000).is_err());
    }
}
