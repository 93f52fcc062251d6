//! Packet multiplexer module
//!
//! A connectionless socket built from one overlay stream per peer.

mod conn;
mod framing;
mod packet_mux;
mod record;

pub(crate) use conn::check_deadline;
pub use conn::PacketConn;
pub use framing::{Framing, MAX_DATAGRAM};
pub use packet_mux::{MuxConfig, PacketMux, DEFAULT_QUEUE_CAPACITY};
