use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::error::UpstreamError;

pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
pub const UPSTREAM_BUFFER_SIZE: usize = 1024;

/// One round-trip to an upstream resolver: send an encoded query, get back
/// the raw reply bytes.
#[async_trait(?Send)]
pub trait Upstream {
    async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError>;
}

/// Forwards over UDP using a fresh socket per attempt
#[derive(Debug, Clone)]
pub struct UdpUpstream {
    resolver_addr: SocketAddr,
    timeout: Duration,
}

impl UdpUpstream {
    pub fn new(resolver_addr: SocketAddr) -> Self {
        Self::with_timeout(resolver_addr, UPSTREAM_TIMEOUT)
    }

    pub fn with_timeout(resolver_addr: SocketAddr, timeout: Duration) -> Self {
        UdpUpstream {
            resolver_addr,
            timeout,
        }
    }

    pub fn resolver_addr(&self) -> SocketAddr {
        self.resolver_addr
    }

    fn local_bind_addr(&self) -> SocketAddr {
        match self.resolver_addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        }
    }
}

#[async_trait(?Send)]
impl Upstream for UdpUpstream {
    async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        // Dropped at the end of the attempt, including on timeout
        let socket = UdpSocket::bind(self.local_bind_addr())
            .await
            .map_err(UpstreamError::Bind)?;

        socket
            .send_to(query, self.resolver_addr)
            .await
            .map_err(UpstreamError::Send)?;

        let deadline = Instant::now() + self.timeout;
        let mut response_buf = [0u8; UPSTREAM_BUFFER_SIZE];

        loop {
            let (size, from) = timeout_at(deadline, socket.recv_from(&mut response_buf))
                .await
                .map_err(|_| UpstreamError::Timeout(self.timeout))?
                .map_err(UpstreamError::Recv)?;

            if from == self.resolver_addr {
                debug!("Received {} bytes from upstream {}", size, from);
                return Ok(response_buf[..size].to_vec());
            }
            trace!("Ignoring {} bytes from unexpected peer {}", size, from);
        }
    }
}
