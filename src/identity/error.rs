//! Identity error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while enrolling or loading an identity
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse enrollment token: {0}")]
    Parse(String),

    #[error("Enrollment failed: {0}")]
    Enrollment(#[from] EnrollmentError),

    #[error("Enrollment succeeded but the identity file could not be written to {path}: {reason}")]
    Persist { path: PathBuf, reason: String },

    #[error("Invalid credential: {0}")]
    Credential(String),

    #[error("Invalid output path: {0}")]
    OutputPath(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),
}

/// Failures of the token exchange with the controller
#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("Enrollment token has expired")]
    TokenExpired,

    #[error("Unsupported enrollment method: {0}")]
    UnsupportedMethod(String),

    #[error("Missing enrollment parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Controller rejected enrollment ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected enrollment response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for EnrollmentError {
    fn from(e: reqwest::Error) -> Self {
        EnrollmentError::Transport(e.to_string())
    }
}

impl From<rcgen::Error> for EnrollmentError {
    fn from(e: rcgen::Error) -> Self {
        EnrollmentError::KeyGeneration(e.to_string())
    }
}
