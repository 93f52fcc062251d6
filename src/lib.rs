//! zitirtc - Zero-trust overlay networking for real-time media
//!
//! This library enrolls identities with an overlay controller, keeps their
//! API session alive, and exposes the overlay as a network provider with a
//! packet multiplexer suitable for ICE candidate gathering.

pub mod app;
pub mod config;
pub mod controller;
pub mod identity;
pub mod mux;
pub mod overlay;
pub mod transport;

pub use app::{AppContext, SetupError};
pub use config::Config;
pub use controller::SessionManager;
pub use mux::{PacketConn, PacketMux};
pub use overlay::OverlayContext;
pub use transport::{Net, NetworkError, OverlayNet};
