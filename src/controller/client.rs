//! HTTPS client for the controller's management and client APIs

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::identity::{AuthMethod, IdentityCredential};

use super::error::ControllerError;

/// Header carrying the session token on every authenticated call
pub const SESSION_HEADER: &str = "zt-session";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Controller API surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Api {
    Management,
    Client,
}

impl Api {
    fn prefix(&self) -> &'static str {
        match self {
            Api::Management => "/edge/management/v1",
            Api::Client => "/edge/client/v1",
        }
    }
}

/// Token returned by a successful authentication
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub token: String,
    pub identity_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest<'a> {
    config_types: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEnvelope {
    #[serde(default)]
    data: AuthData,
}

#[derive(Debug, Default, Deserialize)]
struct AuthData {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    identity: Option<IdentityRef>,
}

#[derive(Debug, Deserialize)]
struct IdentityRef {
    id: String,
}

/// HTTPS client bound to one controller and one identity
#[derive(Debug, Clone)]
pub struct ControllerClient {
    base: String,
    http: reqwest::Client,
    auth: AuthMethod,
}

impl ControllerClient {
    /// Build a client presenting the credential's certificate and trusting its CA bundle
    ///
    /// An empty `controller_url` falls back to the URL stored in the credential.
    pub fn from_credential(
        controller_url: &str,
        credential: &IdentityCredential,
    ) -> Result<Self, ControllerError> {
        let base = if controller_url.trim().is_empty() {
            credential.controller_url.clone()
        } else {
            controller_url.to_string()
        };
        let base = base.trim_end_matches('/').to_string();
        Url::parse(&base)?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(REQUEST_TIMEOUT);

        for der in credential.ca_certificates()? {
            let cert = reqwest::Certificate::from_der(&der)
                .map_err(|e| ControllerError::Credential(format!("invalid CA: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(pem) = credential.client_identity_pem()? {
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| ControllerError::Credential(format!("invalid client identity: {}", e)))?;
            builder = builder.identity(identity);
        }

        let http = builder
            .build()
            .map_err(|e| ControllerError::Credential(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base,
            http,
            auth: credential.auth_method(),
        })
    }

    /// Controller base URL without trailing slash
    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// URL of `path` under the given API
    pub fn url(&self, api: Api, path: &str) -> Result<Url, ControllerError> {
        Ok(Url::parse(&format!(
            "{}{}/{}",
            self.base,
            api.prefix(),
            path.trim_start_matches('/')
        ))?)
    }

    /// Authenticate the identity against `api`
    ///
    /// The token is taken from the `zt-session` response header, falling back
    /// to `data.token` in the body. A missing or empty token is an
    /// authentication failure.
    pub async fn authenticate(
        &self,
        api: Api,
        config_types: &[&str],
    ) -> Result<Authenticated, ControllerError> {
        let mut url = self.url(api, "authenticate")?;
        url.query_pairs_mut().append_pair("method", self.auth.as_str());

        let (username, password) = match &self.auth {
            AuthMethod::Password(p) => (Some(p.username.as_str()), Some(p.password.as_str())),
            AuthMethod::Certificate => (None, None),
        };
        let body = AuthRequest {
            config_types,
            username,
            password,
        };

        debug!("Authenticating against {}", url);
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ControllerError::Auth(format!("request failed: {}", e)))?;

        let status = response.status();
        let header_token = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response
            .text()
            .await
            .map_err(|e| ControllerError::Auth(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            warn!("Controller rejected authentication ({}): {}", status, text);
            return Err(ControllerError::Auth(format!("{}: {}", status, text)));
        }

        let envelope: AuthEnvelope = serde_json::from_str(&text).unwrap_or_default();
        let token = header_token
            .or(envelope.data.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ControllerError::Auth("controller returned no session token".to_string()))?;

        Ok(Authenticated {
            token,
            identity_id: envelope.data.identity.map(|i| i.id),
        })
    }

    /// GET `path` with the session header and decode the JSON body
    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        api: Api,
        path: &str,
        token: &str,
    ) -> Result<T, ControllerError> {
        let response = self
            .http
            .get(self.url(api, path)?)
            .header(SESSION_HEADER, token)
            .send()
            .await?;
        let response = expect_status(response, reqwest::StatusCode::OK).await?;
        response
            .json()
            .await
            .map_err(|e| ControllerError::Decode(e.to_string()))
    }
}

/// Fail with the response body unless the status matches
pub(crate) async fn expect_status(
    response: reqwest::Response,
    expected: reqwest::StatusCode,
) -> Result<reqwest::Response, ControllerError> {
    let status = response.status();
    if status == expected {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!("Controller returned {} (expected {}): {}", status, expected, body);
    Err(ControllerError::Status {
        status: status.as_u16(),
        body,
    })
}
