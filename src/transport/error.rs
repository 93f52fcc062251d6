//! Network error types

use thiserror::Error;

use crate::overlay::OverlayError;

/// Errors that can occur in the transport adapter and packet multiplexer
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Dial {address} failed: {source}")]
    Dial {
        address: String,
        #[source]
        source: OverlayError,
    },

    #[error("Dial {address} failed on the overlay ({overlay}) and the underlay ({underlay})")]
    Fallback {
        address: String,
        overlay: OverlayError,
        underlay: std::io::Error,
    },

    #[error("No connection for address {0}")]
    AddressNotFound(String),

    #[error("No peer connections")]
    NoPeers,

    #[error("Connection closed")]
    Closed,

    #[error("Deadline exceeded")]
    Timeout,

    #[error("{op} failed for {} peer(s)", .failures.len())]
    FanOut {
        op: &'static str,
        failures: Vec<(String, NetworkError)>,
    },

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("No default packet endpoint configured")]
    NoPacketEndpoint,

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Datagram of {0} bytes does not fit a frame")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}
