//! Connectionless socket abstraction

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::transport::NetworkError;

/// A datagram socket as seen by media stacks
///
/// Deadlines are absolute; `None` clears them. A deadline in the past makes
/// the affected operations fail with [`NetworkError::Timeout`] immediately.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive one datagram; returns its length and source address
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, String), NetworkError>;

    /// Send one datagram to `address`
    async fn write_to(&self, buf: &[u8], address: &str) -> Result<usize, NetworkError>;

    async fn close(&self) -> Result<(), NetworkError>;

    fn local_addr(&self) -> SocketAddr;

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<(), NetworkError>;

    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<(), NetworkError>;

    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<(), NetworkError>;
}

/// Fail fast when a deadline has already passed
pub(crate) fn check_deadline(deadline: Option<Instant>) -> Result<(), NetworkError> {
    match deadline {
        Some(d) if d <= Instant::now() => Err(NetworkError::Timeout),
        _ => Ok(()),
    }
}
