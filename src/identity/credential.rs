//! Identity credential file
//!
//! The credential is a JSON document holding the controller URL and the
//! identity's key material:
//!
//! ```json
//! {
//!   "ztAPI": "https://ctrl.example:1280",
//!   "id": { "key": "pem:...", "cert": "pem:...", "ca": "pem:..." }
//! }
//! ```
//!
//! PEM values are stored inline with a `pem:` prefix or referenced with a
//! `file://` URL. Password identities carry an `updb` block instead of a
//! certificate and key.

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};

use super::error::IdentityError;

const PEM_PREFIX: &str = "pem:";
const FILE_PREFIX: &str = "file://";

/// Append a suffix to a path without replacing an existing extension
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Credential file for an identity path (`<path>.json`)
pub fn credential_path(identity_path: &Path) -> PathBuf {
    with_suffix(identity_path, ".json")
}

/// Pending enrollment token for an identity path (`<path>.jwt`)
pub fn token_path(identity_path: &Path) -> PathBuf {
    with_suffix(identity_path, ".jwt")
}

/// Key material of an identity
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityMaterial {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

/// Username/password pair for `updb` identities
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PasswordCredential {
    pub username: String,
    pub password: String,
}

/// How an identity proves itself to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Certificate,
    Password(PasswordCredential),
}

impl AuthMethod {
    /// Value of the `method` query parameter on `authenticate`
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Certificate => "cert",
            AuthMethod::Password(_) => "password",
        }
    }
}

/// Durable identity produced by enrollment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityCredential {
    #[serde(rename = "ztAPI")]
    pub controller_url: String,

    #[serde(rename = "ztAPIs", default, skip_serializing_if = "Option::is_none")]
    pub controller_urls: Option<Vec<String>>,

    pub id: IdentityMaterial,

    #[serde(rename = "configTypes", default)]
    pub config_types: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updb: Option<PasswordCredential>,
}

impl IdentityCredential {
    /// Load a credential from its JSON file
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let content = fs::read(path).map_err(|e| {
            IdentityError::Credential(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse a credential from JSON bytes
    pub fn from_json(content: &[u8]) -> Result<Self, IdentityError> {
        let credential: Self = serde_json::from_slice(content)
            .map_err(|e| IdentityError::Credential(format!("malformed identity file: {}", e)))?;
        credential.check()?;
        Ok(credential)
    }

    fn check(&self) -> Result<(), IdentityError> {
        if self.controller_url.trim().is_empty() {
            return Err(IdentityError::Credential("ztAPI is empty".to_string()));
        }
        if self.updb.is_none() && (self.id.cert.is_none() || self.id.key.is_none()) {
            return Err(IdentityError::Credential(
                "identity has neither a certificate/key pair nor password credentials".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to JSON (HTML characters are not escaped)
    pub fn to_json(&self) -> Result<String, IdentityError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| IdentityError::Credential(format!("failed to encode identity: {}", e)))
    }

    /// Write the credential file, readable only by the owner on unix
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let persist_err = |reason: String| IdentityError::Persist {
            path: path.to_path_buf(),
            reason,
        };

        let json = self.to_json().map_err(|e| persist_err(e.to_string()))?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path).map_err(|e| persist_err(e.to_string()))?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| persist_err(e.to_string()))?;
        Ok(())
    }

    /// Authentication method implied by the stored material
    pub fn auth_method(&self) -> AuthMethod {
        match (&self.id.cert, &self.updb) {
            (None, Some(updb)) => AuthMethod::Password(updb.clone()),
            _ => AuthMethod::Certificate,
        }
    }

    /// Certificate chain PEM, if any
    pub fn cert_pem(&self) -> Result<Option<String>, IdentityError> {
        self.id.cert.as_deref().map(resolve_pem).transpose()
    }

    /// Private key PEM, if any
    pub fn key_pem(&self) -> Result<Option<String>, IdentityError> {
        self.id.key.as_deref().map(resolve_pem).transpose()
    }

    /// CA bundle PEM, if any
    pub fn ca_pem(&self) -> Result<Option<String>, IdentityError> {
        self.id.ca.as_deref().map(resolve_pem).transpose()
    }

    /// Certificate followed by private key, the layout HTTPS clients accept as an identity
    pub fn client_identity_pem(&self) -> Result<Option<Vec<u8>>, IdentityError> {
        match (self.cert_pem()?, self.key_pem()?) {
            (Some(cert), Some(key)) => {
                let mut pem = cert.into_bytes();
                if !pem.ends_with(b"\n") {
                    pem.push(b'\n');
                }
                pem.extend_from_slice(key.as_bytes());
                Ok(Some(pem))
            }
            _ => Ok(None),
        }
    }

    /// Parsed certificate chain
    pub fn certificate_chain(&self) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
        match self.cert_pem()? {
            Some(pem) => parse_certificates(&pem),
            None => Ok(Vec::new()),
        }
    }

    /// Parsed CA certificates
    pub fn ca_certificates(&self) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
        match self.ca_pem()? {
            Some(pem) => parse_certificates(&pem),
            None => Ok(Vec::new()),
        }
    }

    /// Parsed private key
    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>, IdentityError> {
        let pem = self
            .key_pem()?
            .ok_or_else(|| IdentityError::Credential("identity has no private key".to_string()))?;
        rustls_pemfile::private_key(&mut pem.as_bytes())
            .map_err(|e| IdentityError::Credential(format!("invalid private key: {}", e)))?
            .ok_or_else(|| IdentityError::Credential("no private key in PEM".to_string()))
    }
}

/// Resolve an inline (`pem:`), file (`file://`) or bare PEM value
fn resolve_pem(value: &str) -> Result<String, IdentityError> {
    if let Some(pem) = value.strip_prefix(PEM_PREFIX) {
        Ok(pem.to_string())
    } else if let Some(path) = value.strip_prefix(FILE_PREFIX) {
        fs::read_to_string(path)
            .map_err(|e| IdentityError::Credential(format!("failed to read {}: {}", path, e)))
    } else if value.contains("-----BEGIN") {
        Ok(value.to_string())
    } else {
        Err(IdentityError::Credential(format!(
            "unsupported key material reference: {}",
            value.chars().take(16).collect::<String>()
        )))
    }
}

/// Parse every certificate in a PEM bundle
pub fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| IdentityError::Credential(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(IdentityError::Credential(
            "no certificate in PEM".to_string(),
        ));
    }
    Ok(certs)
}

/// Store PEM text inline
pub fn inline_pem(pem: &str) -> String {
    format!("{}{}", PEM_PREFIX, pem)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["test.local".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_paths_append_suffix() {
        let base = Path::new("/tmp/ids/publisher.v2");
        assert_eq!(credential_path(base), PathBuf::from("/tmp/ids/publisher.v2.json"));
        assert_eq!(token_path(base), PathBuf::from("/tmp/ids/publisher.v2.jwt"));
    }

    #[test]
    fn test_parse_ziti_identity_json() {
        let (cert, key) = self_signed();
        let json = serde_json::json!({
            "ztAPI": "https://ctrl.example:1280",
            "id": { "key": inline_pem(&key), "cert": inline_pem(&cert), "ca": inline_pem(&cert) },
            "configTypes": null
        });
        let credential = IdentityCredential::from_json(json.to_string().as_bytes()).unwrap();

        assert_eq!(credential.controller_url, "https://ctrl.example:1280");
        assert_eq!(credential.auth_method(), AuthMethod::Certificate);
        assert_eq!(credential.certificate_chain().unwrap().len(), 1);
        assert_eq!(credential.ca_certificates().unwrap().len(), 1);
        assert!(credential.private_key().is_ok());

        let identity = credential.client_identity_pem().unwrap().unwrap();
        let text = String::from_utf8(identity).unwrap();
        assert!(text.contains("BEGIN CERTIFICATE"));
        assert!(text.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_missing_material_is_credential_error() {
        let json = br#"{"ztAPI":"https://ctrl","id":{"ca":"pem:x"}}"#;
        assert!(matches!(
            IdentityCredential::from_json(json),
            Err(IdentityError::Credential(_))
        ));

        assert!(matches!(
            IdentityCredential::from_json(b"not json"),
            Err(IdentityError::Credential(_))
        ));
    }

    #[test]
    fn test_password_identity() {
        let json = br#"{"ztAPI":"https://ctrl","id":{},"updb":{"username":"u","password":"p"}}"#;
        let credential = IdentityCredential::from_json(json).unwrap();
        assert_eq!(credential.auth_method().as_str(), "password");
        assert!(credential.client_identity_pem().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let (cert, key) = self_signed();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        let credential = IdentityCredential {
            controller_url: "https://ctrl.example:1280".to_string(),
            controller_urls: None,
            id: IdentityMaterial {
                key: Some(inline_pem(&key)),
                cert: Some(inline_pem(&cert)),
                ca: None,
            },
            config_types: None,
            updb: None,
        };

        credential.save(&path).unwrap();
        let loaded = IdentityCredential::load(&path).unwrap();
        assert_eq!(loaded, credential);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_file_reference() {
        let (cert, _) = self_signed();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.pem");
        fs::write(&cert_path, &cert).unwrap();

        let resolved = resolve_pem(&format!("file://{}", cert_path.display())).unwrap();
        assert_eq!(resolved, cert);
        assert!(resolve_pem("base64:abcd").is_err());
    }
}
