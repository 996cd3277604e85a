//! Fire-and-forget UDP delivery of encoded packets.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::error::{RelayError, Result};

/// Destination of the OSC stream. Resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub async fn resolve(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.host, self.port);
        let mut addrs = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| RelayError::Config(format!("cannot resolve {target}: {e}")))?;
        let addr = addrs
            .next()
            .ok_or_else(|| RelayError::Config(format!("no address for {target}")));
        addr
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Datagram transmission seam; the relay worker only sees this.
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// One datagram, no retry, no acknowledgement.
    async fn send_packet(&self, packet: &[u8]) -> Result<()>;
}

pub struct UdpDispatcher {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpDispatcher {
    pub async fn new(endpoint: &Endpoint) -> Result<Self> {
        let target = endpoint.resolve().await?;
        let bind_addr = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| RelayError::Dispatch(format!("bind {bind_addr}: {e}")))?;
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

#[async_trait]
impl PacketSink for UdpDispatcher {
    async fn send_packet(&self, packet: &[u8]) -> Result<()> {
        let sent = self
            .socket
            .send_to(packet, self.target)
            .await
            .map_err(|e| RelayError::Dispatch(format!("send to {}: {e}", self.target)))?;
        if sent != packet.len() {
            return Err(RelayError::Dispatch(format!(
                "short send to {}: {}/{} bytes",
                self.target,
                sent,
                packet.len()
            )));
        }
        Ok(())
    }
}
