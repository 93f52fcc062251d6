//! One-time enrollment token

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::error::{EnrollmentError, IdentityError};

/// How the token is exchanged for an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentMethod {
    /// Locally generated key, certificate signed by the controller
    Ott,
    /// Certificate issued by a third-party CA known to the controller
    OttCa,
    /// Username and password
    Updb,
}

impl EnrollmentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentMethod::Ott => "ott",
            EnrollmentMethod::OttCa => "ottca",
            EnrollmentMethod::Updb => "updb",
        }
    }
}

/// Claims carried by an enrollment token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnrollmentClaims {
    /// Controller URL
    pub iss: String,
    /// Identity id
    pub sub: String,
    /// One-time token presented on exchange
    pub jti: String,
    /// Enrollment method
    #[serde(default = "default_method")]
    pub em: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

fn default_method() -> String {
    "ott".to_string()
}

/// Parsed enrollment token
///
/// The signature is not checked here; the controller verifies the token when
/// it is exchanged.
#[derive(Debug, Clone)]
pub struct EnrollmentToken {
    pub claims: EnrollmentClaims,
}

impl EnrollmentToken {
    /// Parse a JWT string
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let raw = raw.trim();
        let header = decode_header(raw).map_err(|e| IdentityError::Parse(e.to_string()))?;

        let mut validation = Validation::new(header.alg);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<EnrollmentClaims>(raw, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| IdentityError::Parse(e.to_string()))?;
        let claims = data.claims;

        if claims.jti.is_empty() {
            return Err(IdentityError::Parse("token has no jti".to_string()));
        }
        if !claims.iss.starts_with("http://") && !claims.iss.starts_with("https://") {
            return Err(IdentityError::Parse(format!(
                "issuer is not a controller URL: {}",
                claims.iss
            )));
        }

        Ok(Self { claims })
    }

    /// Enrollment method named by the `em` claim
    pub fn method(&self) -> Result<EnrollmentMethod, EnrollmentError> {
        match self.claims.em.as_str() {
            "ott" => Ok(EnrollmentMethod::Ott),
            "ottca" => Ok(EnrollmentMethod::OttCa),
            "updb" => Ok(EnrollmentMethod::Updb),
            other => Err(EnrollmentError::UnsupportedMethod(other.to_string())),
        }
    }

    /// Controller URL without a trailing slash
    pub fn controller_url(&self) -> &str {
        self.claims.iss.trim_end_matches('/')
    }

    pub fn is_expired(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.claims.exp.is_some_and(|exp| exp < now)
    }
}
