//! Application context
//!
//! Owns everything a process needs to use the overlay: the controller
//! session, its keep-alive, the overlay context and the network provider.
//! Setup runs enrollment, session creation, overlay connection and the
//! keep-alive in that order and stops at the first failure.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, ConfigError};
use crate::controller::{
    ControllerError, IdentityAdmin, KeepAlive, KeepAliveHandle, SessionManager,
};
use crate::identity::{enroll_if_needed, EnrollOutcome, EnrollmentParams, IdentityError};
use crate::overlay::{OverlayContext, OverlayError};
use crate::transport::OverlayNet;

/// Errors that can occur during setup
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
}

/// Live overlay setup for one identity
pub struct AppContext {
    config: Config,
    session: Arc<SessionManager>,
    overlay: Arc<OverlayContext>,
    net: Arc<OverlayNet>,
    keepalive: KeepAliveHandle,
}

impl AppContext {
    /// Set up with default enrollment parameters
    pub async fn setup(config: Config) -> Result<Self, SetupError> {
        Self::setup_with(config, EnrollmentParams::default()).await
    }

    pub async fn setup_with(config: Config, params: EnrollmentParams) -> Result<Self, SetupError> {
        config.validate()?;

        match enroll_if_needed(&config.identity_path, params).await? {
            EnrollOutcome::Enrolled(path) => info!("Identity enrolled into {}", path.display()),
            EnrollOutcome::AlreadyEnrolled => debug!("Identity already enrolled"),
        }

        let session = SessionManager::new(&config.controller_url, &config.identity_path)?
            .with_dev_env(config.dev_env);
        session.authenticate().await?;
        let session = Arc::new(session);

        let overlay = Arc::new(OverlayContext::connect(session.credential(), &config).await?);
        let net = Arc::new(OverlayNet::new(overlay.clone(), &config));
        let keepalive = KeepAlive::spawn(session.clone(), config.keepalive_interval());

        info!("Overlay setup complete for {}", config.identity_path.display());
        Ok(Self {
            config,
            session,
            overlay,
            net,
            keepalive,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn overlay(&self) -> &Arc<OverlayContext> {
        &self.overlay
    }

    /// Network provider for media and signaling stacks
    pub fn net(&self) -> &Arc<OverlayNet> {
        &self.net
    }

    pub fn keepalive(&self) -> &KeepAliveHandle {
        &self.keepalive
    }

    pub fn identity_admin(&self) -> IdentityAdmin {
        IdentityAdmin::new(self.session.clone(), self.config.services.clone())
    }

    /// Stop the keep-alive and drop the session
    pub fn shutdown(mut self) {
        self.keepalive.stop();
        self.session.invalidate();
        info!("Overlay context shut down");
    }
}
