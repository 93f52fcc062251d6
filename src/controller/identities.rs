//! Identity administration through the management API

use std::sync::Arc;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ServiceNames;
use crate::identity::Role;

use super::client::{expect_status, Api, SESSION_HEADER};
use super::error::ControllerError;
use super::session::SessionManager;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRequest<'a> {
    is_admin: bool,
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    enrollment: EnrollmentRequest,
    role_attributes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EnrollmentRequest {
    ott: bool,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct CreatedId {
    id: String,
}

/// One-time token attached to a not yet enrolled identity
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct OttEnrollment {
    #[serde(default)]
    pub jwt: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct EnrollmentInfo {
    #[serde(default)]
    pub ott: Option<OttEnrollment>,
}

/// Identity as returned by the management API
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDetail {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub enrollment: EnrollmentInfo,
    #[serde(default)]
    pub role_attributes: Vec<String>,
}

impl IdentityDetail {
    /// Enrollment token, if the identity has not enrolled yet
    pub fn enrollment_jwt(&self) -> Option<&str> {
        self.enrollment
            .ott
            .as_ref()
            .map(|o| o.jwt.as_str())
            .filter(|jwt| !jwt.is_empty())
    }
}

/// A newly created identity and its enrollment token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedIdentity {
    pub id: String,
    pub jwt: String,
}

/// Creates, reads, updates and deletes identities
pub struct IdentityAdmin {
    session: Arc<SessionManager>,
    services: ServiceNames,
}

impl IdentityAdmin {
    pub fn new(session: Arc<SessionManager>, services: ServiceNames) -> Self {
        Self { session, services }
    }

    fn body<'a>(&self, name: &'a str, role: Role) -> IdentityRequest<'a> {
        IdentityRequest {
            is_admin: role.is_admin(),
            name,
            kind: "User",
            enrollment: EnrollmentRequest { ott: true },
            role_attributes: role.attributes(&self.services),
        }
    }

    /// Create an identity and return its id and one-time enrollment token
    pub async fn create_identity(
        &self,
        name: &str,
        role: Role,
    ) -> Result<CreatedIdentity, ControllerError> {
        let client = self.session.client();
        let response = client
            .http()
            .post(client.url(Api::Management, "identities")?)
            .header(SESSION_HEADER, self.session.token()?)
            .json(&self.body(name, role))
            .send()
            .await?;
        let response = expect_status(response, StatusCode::CREATED).await?;
        let created: DataEnvelope<CreatedId> = response
            .json()
            .await
            .map_err(|e| ControllerError::Decode(e.to_string()))?;

        let detail = self.get_identity(&created.data.id).await?;
        let jwt = detail.enrollment_jwt().unwrap_or_default().to_string();
        if jwt.is_empty() {
            warn!("Identity {} was created without an enrollment token", created.data.id);
        }

        info!("Created identity {} ({}) with role {}", name, created.data.id, role);
        Ok(CreatedIdentity {
            id: created.data.id,
            jwt,
        })
    }

    /// Fetch one identity
    pub async fn get_identity(&self, id: &str) -> Result<IdentityDetail, ControllerError> {
        let envelope: DataEnvelope<IdentityDetail> = self
            .session
            .client()
            .get_json(
                Api::Management,
                &format!("identities/{}", id),
                &self.session.token()?,
            )
            .await?;
        Ok(envelope.data)
    }

    /// Replace name and role attributes of an identity
    pub async fn update_identity(
        &self,
        id: &str,
        name: &str,
        role: Role,
    ) -> Result<(), ControllerError> {
        let client = self.session.client();
        let response = client
            .http()
            .patch(client.url(Api::Management, &format!("identities/{}", id))?)
            .header(SESSION_HEADER, self.session.token()?)
            .json(&self.body(name, role))
            .send()
            .await?;
        expect_status(response, StatusCode::OK).await?;
        info!("Updated identity {} with role {}", id, role);
        Ok(())
    }

    /// Delete an identity
    pub async fn delete_identity(&self, id: &str) -> Result<(), ControllerError> {
        let client = self.session.client();
        let response = client
            .http()
            .delete(client.url(Api::Management, &format!("identities/{}", id))?)
            .header(SESSION_HEADER, self.session.token()?)
            .send()
            .await?;
        expect_status(response, StatusCode::OK).await?;
        info!("Deleted identity {}", id);
        Ok(())
    }
}
