//! Enrollment: exchanging a one-time token for a durable identity

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use der::{Decode, Encode};
use rcgen::{CertificateParams, DnType, DnValue, KeyPair};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::credential::{
    credential_path, inline_pem, parse_certificates, token_path, IdentityCredential,
    IdentityMaterial, PasswordCredential,
};
use super::error::{EnrollmentError, IdentityError};
use super::token::{EnrollmentMethod, EnrollmentToken};

const ENROLL_TIMEOUT: Duration = Duration::from_secs(30);
const RSA_KEY_BITS: usize = 2048;
const CA_BUNDLE_PATH: &str = "/.well-known/est/cacerts";

/// Key algorithm for locally generated identity keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyAlgorithm {
    #[default]
    EcP256,
    EcP384,
    /// 2048-bit RSA, signed with SHA-256
    Rsa,
}

impl KeyAlgorithm {
    fn generate(&self) -> Result<KeyPair, EnrollmentError> {
        match self {
            KeyAlgorithm::EcP256 => Ok(KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?),
            KeyAlgorithm::EcP384 => Ok(KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)?),
            KeyAlgorithm::Rsa => {
                // rcgen can sign with RSA but not generate it
                let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_KEY_BITS)
                    .map_err(|e| EnrollmentError::KeyGeneration(e.to_string()))?;
                let pem = key
                    .to_pkcs8_pem(LineEnding::LF)
                    .map_err(|e| EnrollmentError::KeyGeneration(e.to_string()))?;
                Ok(KeyPair::from_pem_and_sign_algo(&pem, &rcgen::PKCS_RSA_SHA256)?)
            }
        }
    }
}

impl FromStr for KeyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ec" | "ec-p256" | "p256" => Ok(KeyAlgorithm::EcP256),
            "ec-p384" | "p384" => Ok(KeyAlgorithm::EcP384),
            "rsa" | "rsa-2048" => Ok(KeyAlgorithm::Rsa),
            other => Err(format!("unsupported key algorithm: {}", other)),
        }
    }
}

/// Parameters for one enrollment
#[derive(Debug, Clone, Default)]
pub struct EnrollmentParams {
    pub key_alg: KeyAlgorithm,
    /// Common name for the certificate request (defaults to the token subject)
    pub id_name: Option<String>,
    /// Trust roots for the controller, also stored as the identity CA
    ///
    /// When unset, the bundle published by the token issuer is used.
    pub ca_override: Option<PathBuf>,
    /// Third-party certificate (ottca)
    pub cert_path: Option<PathBuf>,
    /// Third-party private key (ottca)
    pub key_path: Option<PathBuf>,
    /// Username (updb)
    pub username: Option<String>,
    /// Password (updb)
    pub password: Option<String>,
    /// Where to write the credential; derived from the token path when unset
    pub output_path: Option<PathBuf>,
}

/// Result of [`enroll_if_needed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollOutcome {
    /// No token file; the identity is assumed to be enrolled already
    AlreadyEnrolled,
    /// A token was consumed and the credential written to this path
    Enrolled(PathBuf),
}

/// Enroll the identity at `identity_path` if an enrollment token is pending
pub async fn enroll_if_needed(
    identity_path: &Path,
    params: EnrollmentParams,
) -> Result<EnrollOutcome, IdentityError> {
    let jwt = token_path(identity_path);

    match tokio::fs::metadata(&jwt).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No enrollment token at {}", jwt.display());
            return Ok(EnrollOutcome::AlreadyEnrolled);
        }
        Err(e) => {
            warn!("Failed to stat enrollment token {}: {}", jwt.display(), e);
            return Err(IdentityError::Io(e));
        }
    }

    let params = EnrollmentParams {
        output_path: params
            .output_path
            .or_else(|| Some(credential_path(identity_path))),
        ..params
    };

    info!("Enrolling identity: {}", identity_path.display());
    let written = Enrollment::from_token_file(jwt, params).run().await?;
    Ok(EnrollOutcome::Enrolled(written))
}

/// Derive the credential path from a token path
///
/// `x.jwt` becomes `x.json`; any other name gets `.json` appended. A token
/// file ending in `.json` is rejected because the output cannot be inferred.
pub fn output_path_for_token(jwt: &Path) -> Result<PathBuf, IdentityError> {
    let s = jwt.to_string_lossy();
    if let Some(stem) = s.strip_suffix(".jwt") {
        Ok(PathBuf::from(format!("{}.json", stem)))
    } else if s.ends_with(".json") {
        Err(IdentityError::OutputPath(format!(
            "cannot infer the output path when the token file ends in .json: {}",
            s
        )))
    } else {
        Ok(PathBuf::from(format!("{}.json", s)))
    }
}

/// A pending enrollment backed by a token file
#[derive(Debug, Clone)]
pub struct Enrollment {
    token_path: PathBuf,
    params: EnrollmentParams,
}

impl Enrollment {
    pub fn from_token_file(token_path: impl Into<PathBuf>, params: EnrollmentParams) -> Self {
        Self {
            token_path: token_path.into(),
            params,
        }
    }

    /// Exchange the token, write the credential and remove the token file
    ///
    /// Returns the credential path.
    pub async fn run(&self) -> Result<PathBuf, IdentityError> {
        let output = match &self.params.output_path {
            Some(path) if !path.as_os_str().is_empty() => path.clone(),
            _ => output_path_for_token(&self.token_path)?,
        };
        if output == self.token_path {
            return Err(IdentityError::OutputPath(
                "the output path must not be the same as the token path".to_string(),
            ));
        }

        let raw = tokio::fs::read_to_string(&self.token_path).await?;
        let token = EnrollmentToken::parse(&raw)?;

        let credential = exchange(&token, &self.params).await?;

        // The controller may already hold the identity at this point; a failed
        // write leaves it orphaned server-side.
        credential.save(&output)?;
        info!("Enrolled successfully, identity file written to {}", output.display());

        if let Err(e) = tokio::fs::remove_file(&self.token_path).await {
            warn!(
                "Unable to remove enrollment token {}: {}",
                self.token_path.display(),
                e
            );
        }

        Ok(output)
    }

    /// Enroll from an in-memory token and return the credential JSON
    pub async fn run_to_string(
        token: &str,
        params: &EnrollmentParams,
    ) -> Result<String, IdentityError> {
        let token = EnrollmentToken::parse(token)?;
        let credential = exchange(&token, params).await?;
        credential.to_json()
    }
}

#[derive(Debug, Deserialize)]
struct EnrollResponse {
    data: EnrollResponseData,
}

#[derive(Debug, Deserialize)]
struct EnrollResponseData {
    #[serde(default)]
    cert: Option<String>,
    #[serde(default)]
    ca: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpdbRequest<'a> {
    username: &'a str,
    password: &'a str,
}

async fn exchange(
    token: &EnrollmentToken,
    params: &EnrollmentParams,
) -> Result<IdentityCredential, IdentityError> {
    if token.is_expired() {
        return Err(EnrollmentError::TokenExpired.into());
    }
    let method = token.method()?;
    debug!(
        "Enrolling {} via {} at {}",
        token.claims.sub,
        method.as_str(),
        token.controller_url()
    );

    let ca_pem = match &params.ca_override {
        Some(path) => Some(tokio::fs::read_to_string(path).await?),
        None => match fetch_ca_bundle(token).await {
            Ok(pem) => Some(pem),
            Err(e) => {
                warn!(
                    "No CA bundle from {}, falling back to system roots: {}",
                    token.controller_url(),
                    e
                );
                None
            }
        },
    };

    let url = enroll_url(token, method)?;

    match method {
        EnrollmentMethod::Ott => enroll_ott(token, params, url, ca_pem).await,
        EnrollmentMethod::OttCa => enroll_ottca(token, params, url, ca_pem).await,
        EnrollmentMethod::Updb => enroll_updb(token, params, url, ca_pem).await,
    }
}

fn enroll_url(token: &EnrollmentToken, method: EnrollmentMethod) -> Result<Url, IdentityError> {
    let mut url = Url::parse(&format!(
        "{}/edge/client/v1/enroll/{}",
        token.controller_url(),
        method.as_str()
    ))
    .map_err(|e| IdentityError::Parse(format!("invalid issuer URL: {}", e)))?;
    url.query_pairs_mut().append_pair("token", &token.claims.jti);
    Ok(url)
}

fn http_client(
    ca_pem: Option<&str>,
    identity_pem: Option<&[u8]>,
) -> Result<reqwest::Client, EnrollmentError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(ENROLL_TIMEOUT);

    if let Some(pem) = ca_pem {
        let certs = parse_certificates(pem)
            .map_err(|e| EnrollmentError::Transport(e.to_string()))?;
        for der in certs {
            builder = builder.add_root_certificate(reqwest::Certificate::from_der(&der)?);
        }
    }
    if let Some(pem) = identity_pem {
        builder = builder.identity(reqwest::Identity::from_pem(pem)?);
    }

    Ok(builder.build()?)
}

/// Fetch the CA bundle the token issuer publishes for enrollment
///
/// The server certificate is not verified here; the bundle is trusted as
/// far as the token naming this issuer is, and pins the exchange after it.
async fn fetch_ca_bundle(token: &EnrollmentToken) -> Result<String, EnrollmentError> {
    let url = format!("{}{}", token.controller_url(), CA_BUNDLE_PATH);
    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .danger_accept_invalid_certs(true)
        .timeout(ENROLL_TIMEOUT)
        .build()?;

    let response = client
        .get(&url)
        .header(reqwest::header::ACCEPT, "application/pkcs7-mime")
        .send()
        .await?;
    let body = check_status(response).await?.text().await?;

    let pem = ca_bundle_to_pem(&body)?;
    debug!("Fetched controller CA bundle from {}", url);
    Ok(pem)
}

/// Normalize an EST `cacerts` body (base64 PKCS#7, or plain PEM) to PEM
fn ca_bundle_to_pem(body: &str) -> Result<String, EnrollmentError> {
    if body.contains("-----BEGIN CERTIFICATE-----") {
        return Ok(body.to_string());
    }

    let invalid = |e: der::Error| EnrollmentError::InvalidResponse(format!("bad CA bundle: {}", e));
    let compact: String = body.split_whitespace().collect();
    let raw = BASE64
        .decode(compact)
        .map_err(|e| EnrollmentError::InvalidResponse(format!("CA bundle is not base64: {}", e)))?;
    let info = ContentInfo::from_der(&raw).map_err(invalid)?;
    let signed = SignedData::from_der(&info.content.to_der().map_err(invalid)?).map_err(invalid)?;

    let mut pem = String::new();
    for choice in signed.certificates.iter().flat_map(|set| set.0.iter()) {
        if let CertificateChoices::Certificate(cert) = choice {
            pem.push_str(&der_to_pem(&cert.to_der().map_err(invalid)?));
        }
    }
    if pem.is_empty() {
        return Err(EnrollmentError::InvalidResponse(
            "CA bundle contains no certificates".to_string(),
        ));
    }
    Ok(pem)
}

fn der_to_pem(der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, EnrollmentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!("Enrollment rejected ({}): {}", status, body);
    Err(EnrollmentError::Rejected {
        status: status.as_u16(),
        body,
    })
}

async fn enroll_ott(
    token: &EnrollmentToken,
    params: &EnrollmentParams,
    url: Url,
    ca_pem: Option<String>,
) -> Result<IdentityCredential, IdentityError> {
    let key_pair = params.key_alg.generate()?;
    let common_name = params
        .id_name
        .clone()
        .unwrap_or_else(|| token.claims.sub.clone());

    let mut request = CertificateParams::new(Vec::<String>::new()).map_err(EnrollmentError::from)?;
    request
        .distinguished_name
        .push(DnType::CommonName, DnValue::Utf8String(common_name));
    let csr = request
        .serialize_request(&key_pair)
        .and_then(|csr| csr.pem())
        .map_err(EnrollmentError::from)?;

    let client = http_client(ca_pem.as_deref(), None)?;
    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/x-pem-file")
        .header(reqwest::header::ACCEPT, "application/json")
        .body(csr)
        .send()
        .await
        .map_err(EnrollmentError::from)?;
    let response = check_status(response).await?;

    let (cert, returned_ca) = read_certificate(response).await?;
    let ca = returned_ca.or(ca_pem);

    Ok(IdentityCredential {
        controller_url: token.controller_url().to_string(),
        controller_urls: None,
        id: IdentityMaterial {
            key: Some(inline_pem(&key_pair.serialize_pem())),
            cert: Some(inline_pem(&cert)),
            ca: ca.as_deref().map(inline_pem),
        },
        config_types: None,
        updb: None,
    })
}

async fn enroll_ottca(
    token: &EnrollmentToken,
    params: &EnrollmentParams,
    url: Url,
    ca_pem: Option<String>,
) -> Result<IdentityCredential, IdentityError> {
    let cert_path = params
        .cert_path
        .as_ref()
        .ok_or(EnrollmentError::MissingParameter("cert_path"))?;
    let key_path = params
        .key_path
        .as_ref()
        .ok_or(EnrollmentError::MissingParameter("key_path"))?;

    let cert = tokio::fs::read_to_string(cert_path).await?;
    let key = tokio::fs::read_to_string(key_path).await?;

    let mut identity = cert.clone().into_bytes();
    if !identity.ends_with(b"\n") {
        identity.push(b'\n');
    }
    identity.extend_from_slice(key.as_bytes());

    let client = http_client(ca_pem.as_deref(), Some(&identity))?;
    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body("{}")
        .send()
        .await
        .map_err(EnrollmentError::from)?;
    check_status(response).await?;

    Ok(IdentityCredential {
        controller_url: token.controller_url().to_string(),
        controller_urls: None,
        id: IdentityMaterial {
            key: Some(inline_pem(&key)),
            cert: Some(inline_pem(&cert)),
            ca: ca_pem.as_deref().map(inline_pem),
        },
        config_types: None,
        updb: None,
    })
}

async fn enroll_updb(
    token: &EnrollmentToken,
    params: &EnrollmentParams,
    url: Url,
    ca_pem: Option<String>,
) -> Result<IdentityCredential, IdentityError> {
    let username = params
        .username
        .as_deref()
        .ok_or(EnrollmentError::MissingParameter("username"))?;
    let password = params
        .password
        .as_deref()
        .ok_or(EnrollmentError::MissingParameter("password"))?;

    let client = http_client(ca_pem.as_deref(), None)?;
    let response = client
        .post(url)
        .json(&UpdbRequest { username, password })
        .send()
        .await
        .map_err(EnrollmentError::from)?;
    check_status(response).await?;

    Ok(IdentityCredential {
        controller_url: token.controller_url().to_string(),
        controller_urls: None,
        id: IdentityMaterial {
            key: None,
            cert: None,
            ca: ca_pem.as_deref().map(inline_pem),
        },
        config_types: None,
        updb: Some(PasswordCredential {
            username: username.to_string(),
            password: password.to_string(),
        }),
    })
}

/// Extract the signed certificate (and CA, when returned) from the response
async fn read_certificate(
    response: reqwest::Response,
) -> Result<(String, Option<String>), EnrollmentError> {
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("json"));

    let (cert, ca) = if is_json {
        let body: EnrollResponse = response
            .json()
            .await
            .map_err(|e| EnrollmentError::InvalidResponse(e.to_string()))?;
        let cert = body
            .data
            .cert
            .ok_or_else(|| EnrollmentError::InvalidResponse("no certificate returned".to_string()))?;
        (cert, body.data.ca)
    } else {
        (response.text().await?, None)
    };

    if !cert.contains("-----BEGIN CERTIFICATE-----") {
        return Err(EnrollmentError::InvalidResponse(
            "response does not contain a PEM certificate".to_string(),
        ));
    }
    Ok((cert, ca))
}
