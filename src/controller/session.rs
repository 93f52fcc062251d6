//! API session lifecycle
//!
//! The session token lives in a [`SessionManager`] owned by the application
//! context rather than in process-global state. Re-authentication is
//! serialized so that at most one attempt is in flight.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::identity::{credential_path, IdentityCredential};

use super::client::{Api, ControllerClient, SESSION_HEADER};
use super::error::ControllerError;

/// An authenticated controller session
#[derive(Clone)]
pub struct ApiSession {
    token: String,
    identity_id: Option<String>,
    created_at: SystemTime,
}

impl ApiSession {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Identity id reported by the controller, when present
    pub fn identity_id(&self) -> Option<&str> {
        self.identity_id.as_deref()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

impl fmt::Debug for ApiSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiSession")
            .field("token", &"<redacted>")
            .field("identity_id", &self.identity_id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Holds the current session for one identity
pub struct SessionManager {
    client: ControllerClient,
    credential: IdentityCredential,
    current: RwLock<Option<Arc<ApiSession>>>,
    auth_lock: Mutex<()>,
    dev_env: bool,
}

impl SessionManager {
    /// Load `<identity_path>.json` and prepare a client for `controller_url`
    pub fn new(controller_url: &str, identity_path: &Path) -> Result<Self, ControllerError> {
        let path = credential_path(identity_path);
        let credential = IdentityCredential::load(&path)?;
        Self::from_credential(controller_url, credential)
    }

    pub fn from_credential(
        controller_url: &str,
        credential: IdentityCredential,
    ) -> Result<Self, ControllerError> {
        let client = ControllerClient::from_credential(controller_url, &credential)?;
        Ok(Self {
            client,
            credential,
            current: RwLock::new(None),
            auth_lock: Mutex::new(()),
            dev_env: false,
        })
    }

    /// Log session tokens at debug level
    pub fn with_dev_env(mut self, dev_env: bool) -> Self {
        self.dev_env = dev_env;
        self
    }

    /// Load the credential and authenticate in one step
    pub async fn create_api_session(
        controller_url: &str,
        identity_path: &Path,
    ) -> Result<Self, ControllerError> {
        let manager = Self::new(controller_url, identity_path)?;
        manager.authenticate().await?;
        Ok(manager)
    }

    /// Authenticate against the management API and store the new session
    pub async fn authenticate(&self) -> Result<Arc<ApiSession>, ControllerError> {
        let _guard = self.auth_lock.lock().await;

        let auth = self.client.authenticate(Api::Management, &[]).await?;
        let session = Arc::new(ApiSession {
            token: auth.token,
            identity_id: auth.identity_id,
            created_at: SystemTime::now(),
        });

        if self.dev_env {
            debug!("Controller session token: {}", session.token);
        } else {
            info!("Created controller API session");
        }

        *self.current.write() = Some(session.clone());
        Ok(session)
    }

    /// Current session, if authenticated
    pub fn current(&self) -> Option<Arc<ApiSession>> {
        self.current.read().clone()
    }

    /// Current session token
    pub fn token(&self) -> Result<String, ControllerError> {
        self.current()
            .map(|s| s.token.clone())
            .ok_or(ControllerError::NoSession)
    }

    /// Drop the current session
    pub fn invalidate(&self) {
        if self.current.write().take().is_some() {
            info!("Controller API session invalidated");
        }
    }

    pub fn client(&self) -> &ControllerClient {
        &self.client
    }

    pub fn credential(&self) -> &IdentityCredential {
        &self.credential
    }

    pub fn controller_url(&self) -> &str {
        self.client.base_url()
    }

    /// Issue one authenticated keep-alive request; returns the HTTP status
    pub async fn ping(&self) -> Result<u16, ControllerError> {
        let token = self.token()?;
        let response = self
            .client
            .http()
            .get(self.client.url(Api::Management, "")?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SESSION_HEADER, token)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!("Keep-alive response ({}): {}", status, body);
        Ok(status)
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("controller", &self.client.base_url())
            .field("session", &self.current())
            .finish()
    }
}
