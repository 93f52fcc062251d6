//! Controller error types

use thiserror::Error;

use crate::identity::IdentityError;

/// Errors that can occur while talking to the controller
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("No active API session")]
    NoSession,

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected controller response ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode controller response: {0}")]
    Decode(String),

    #[error("Invalid controller URL: {0}")]
    Url(#[from] url::ParseError),
}

impl From<IdentityError> for ControllerError {
    fn from(e: IdentityError) -> Self {
        ControllerError::Credential(e.to_string())
    }
}
