//! Identity module
//!
//! Enrollment of one-time tokens into durable credentials, the credential
//! file format, and the static role table.

mod credential;
mod enroll;
mod error;
mod roles;
mod token;

pub use credential::{
    credential_path, inline_pem, parse_certificates, token_path, AuthMethod, IdentityCredential,
    IdentityMaterial, PasswordCredential,
};
pub use enroll::{
    enroll_if_needed, output_path_for_token, EnrollOutcome, Enrollment, EnrollmentParams,
    KeyAlgorithm,
};
pub use error::{EnrollmentError, IdentityError};
pub use roles::{role_attributes, Role};
pub use token::{EnrollmentClaims, EnrollmentMethod, EnrollmentToken};
