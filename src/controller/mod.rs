//! Controller module
//!
//! Authenticates identities against the controller, holds the API session,
//! keeps it alive, and administers identities.

mod client;
mod error;
mod identities;
mod keepalive;
mod session;

pub use client::{Api, Authenticated, ControllerClient, SESSION_HEADER};
pub use error::ControllerError;
pub use identities::{CreatedIdentity, EnrollmentInfo, IdentityAdmin, IdentityDetail, OttEnrollment};
pub use keepalive::{KeepAlive, KeepAliveHandle, KeepAliveStatus, KEEPALIVE_INTERVAL};
pub use session::{ApiSession, SessionManager};
