//! Stream and dialer abstractions shared by the overlay and its users

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::OverlayError;

/// Bidirectional byte stream to one peer
pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerIo for T {}

pub type PeerStream = Box<dyn PeerIo>;

/// Accepts connections for one hosted service
#[async_trait]
pub trait OverlayListener: Send + Sync {
    /// Wait for the next dialer; returns the stream and the peer's identity
    async fn accept(&self) -> Result<(PeerStream, String), OverlayError>;

    fn service(&self) -> &str;
}

/// Dials and hosts services by name
#[async_trait]
pub trait Overlay: Send + Sync {
    async fn dial(&self, service: &str) -> Result<PeerStream, OverlayError>;

    async fn listen(&self, service: &str) -> Result<Box<dyn OverlayListener>, OverlayError>;

    /// New edge routers and session token after a catalog refresh
    fn refresh(&self, _routers: Vec<String>, _session: &str) {}
}

/// Opens a stream for a Go-style `network`/`address` pair
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, address: &str) -> Result<PeerStream, OverlayError>;
}
