//! Overlay error types

use thiserror::Error;

use crate::controller::ControllerError;
use crate::identity::IdentityError;

/// Errors that can occur while reaching services through the overlay
#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("No service matches {network} {address}")]
    NoService { network: String, address: String },

    #[error("No edge router available for service {0}")]
    NoRouter(String),

    #[error("Router refused {op} on service {service}: {reason}")]
    Refused {
        op: &'static str,
        service: String,
        reason: String,
    },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),
}

impl From<IdentityError> for OverlayError {
    fn from(e: IdentityError) -> Self {
        OverlayError::Credential(e.to_string())
    }
}
