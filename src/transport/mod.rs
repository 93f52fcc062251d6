//! Transport module
//!
//! Network provider that routes through the overlay with optional underlay
//! fallback, plus underlay UDP sockets and interface enumeration.

mod error;
mod interfaces;
mod net;
mod udp;

pub use error::NetworkError;
pub use interfaces::{list_interfaces, Interface};
pub use net::{FallbackPolicy, Net, NetConn, NetListener, OverlayNet, Route};
pub use udp::UdpPacketConn;
