//! Overlay module
//!
//! Service catalog, TLS data plane to edge routers, and the authenticated
//! context that dials and hosts services.

mod catalog;
mod context;
mod dial;
mod error;
mod fabric;

pub use catalog::{
    EdgeRouter, InterceptConfig, Permission, PortRange, ServiceCatalog, ServiceConfigs,
    ServiceInfo, SupportedProtocols,
};
pub use context::OverlayContext;
pub use dial::{Dialer, Overlay, OverlayListener, PeerIo, PeerStream};
pub use error::OverlayError;
pub use fabric::TlsFabric;
