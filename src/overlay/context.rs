//! Authenticated overlay context
//!
//! Binds an identity to the controller's client API, keeps the service
//! catalog, and turns `network`/`address` pairs into overlay streams.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::controller::{Api, ControllerClient, ControllerError};
use crate::identity::IdentityCredential;

use super::catalog::{EdgeRouter, Permission, ServiceCatalog, ServiceInfo};
use super::dial::{Dialer, Overlay, OverlayListener, PeerStream};
use super::error::OverlayError;
use super::fabric::TlsFabric;

const SERVICES_PATH: &str = "services?limit=500";
const ROUTERS_PATH: &str = "current-identity/edge-routers";

#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

struct ControllerLink {
    client: ControllerClient,
    token: RwLock<String>,
}

/// Overlay access for one identity
pub struct OverlayContext {
    link: Option<ControllerLink>,
    catalog: RwLock<Arc<ServiceCatalog>>,
    overlay: Arc<dyn Overlay>,
}

impl OverlayContext {
    /// Authenticate against the client API and load the service catalog
    pub async fn connect(
        credential: &IdentityCredential,
        config: &Config,
    ) -> Result<Self, OverlayError> {
        let client = ControllerClient::from_credential(&config.controller_url, credential)?;
        let auth = client.authenticate(Api::Client, &["all"]).await?;
        info!("Authenticated overlay identity with {}", client.base_url());

        let fabric = TlsFabric::new(credential)?;
        let context = Self {
            link: Some(ControllerLink {
                client,
                token: RwLock::new(auth.token),
            }),
            catalog: RwLock::new(Arc::new(ServiceCatalog::default())),
            overlay: Arc::new(fabric),
        };
        context.refresh_services().await?;
        Ok(context)
    }

    /// Context over a fixed catalog and a caller-supplied overlay
    pub fn with_overlay(catalog: ServiceCatalog, overlay: Arc<dyn Overlay>) -> Self {
        Self {
            link: None,
            catalog: RwLock::new(Arc::new(catalog)),
            overlay,
        }
    }

    /// Re-fetch services and edge routers; returns the service count
    pub async fn refresh_services(&self) -> Result<usize, OverlayError> {
        let link = self
            .link
            .as_ref()
            .ok_or(OverlayError::Controller(ControllerError::NoSession))?;
        let token = link.token.read().clone();

        let services: ListEnvelope<ServiceInfo> =
            link.client.get_json(Api::Client, SERVICES_PATH, &token).await?;
        let routers: ListEnvelope<EdgeRouter> =
            link.client.get_json(Api::Client, ROUTERS_PATH, &token).await?;

        let catalog = ServiceCatalog::new(services.data, routers.data);
        let count = catalog.services().len();
        info!(
            "Service catalog refreshed: {} service(s), {} edge router(s)",
            count,
            catalog.routers().len()
        );
        self.overlay.refresh(catalog.router_addresses(), &token);
        *self.catalog.write() = Arc::new(catalog);
        Ok(count)
    }

    pub fn catalog(&self) -> Arc<ServiceCatalog> {
        self.catalog.read().clone()
    }

    /// Dial a service by name
    pub async fn dial_service(&self, service: &str) -> Result<PeerStream, OverlayError> {
        self.overlay.dial(service).await
    }

    /// Host a service by name
    pub async fn listen_service(&self, service: &str) -> Result<Box<dyn OverlayListener>, OverlayError> {
        self.overlay.listen(service).await
    }

    /// Host the service that `network`/`address` resolves to
    pub async fn listen(
        &self,
        network: &str,
        address: &str,
    ) -> Result<Box<dyn OverlayListener>, OverlayError> {
        let service = self.resolve(network, address, Permission::Bind)?;
        self.overlay.listen(&service).await
    }

    fn resolve(&self, network: &str, address: &str, permission: Permission) -> Result<String, OverlayError> {
        let catalog = self.catalog();
        let service = catalog.resolve(network, address, permission)?;
        debug!("{} {} resolved to service {}", network, address, service.name);
        Ok(service.name.clone())
    }
}

#[async_trait]
impl Dialer for OverlayContext {
    async fn dial(&self, network: &str, address: &str) -> Result<PeerStream, OverlayError> {
        let service = self.resolve(network, address, Permission::Dial)?;
        self.overlay.dial(&service).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::catalog::ServiceConfigs;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingOverlay {
        dialed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Overlay for RecordingOverlay {
        async fn dial(&self, service: &str) -> Result<PeerStream, OverlayError> {
            self.dialed.lock().push(service.to_string());
            let (a, _b) = tokio::io::duplex(64);
            Ok(Box::new(a))
        }

        async fn listen(&self, service: &str) -> Result<Box<dyn OverlayListener>, OverlayError> {
            Err(OverlayError::NoRouter(service.to_string()))
        }
    }

    fn catalog() -> ServiceCatalog {
        ServiceCatalog::new(
            vec![ServiceInfo {
                id: "s1".to_string(),
                name: "api".to_string(),
                permissions: vec![Permission::Dial],
                config: ServiceConfigs::default(),
            }],
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_dial_resolves_service_name() {
        let overlay = Arc::new(RecordingOverlay::default());
        let context = OverlayContext::with_overlay(catalog(), overlay.clone());

        Dialer::dial(&context, "tcp", "api:443").await.unwrap();
        assert_eq!(*overlay.dialed.lock(), vec!["api".to_string()]);

        assert!(matches!(
            Dialer::dial(&context, "tcp", "unknown:443").await,
            Err(OverlayError::NoService { .. })
        ));
        assert_eq!(overlay.dialed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_without_controller() {
        let context =
            OverlayContext::with_overlay(catalog(), Arc::new(RecordingOverlay::default()));
        assert!(matches!(
            context.refresh_services().await,
            Err(OverlayError::Controller(ControllerError::NoSession))
        ));
        assert_eq!(context.catalog().services().len(), 1);
    }
}
