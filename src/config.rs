//! Configuration loading
//!
//! Settings are read from a TOML file and can be overridden from the
//! environment, using the same variable names the controller tooling uses
//! (`ZITI_CTRL_URL`, `ZITI_SERVICE_*`, `DEV_ENV`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mux::{Framing, DEFAULT_QUEUE_CAPACITY};
use crate::transport::FallbackPolicy;

/// Default keep-alive ping interval (10 minutes)
pub const DEFAULT_KEEPALIVE_SECS: u64 = 600;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Service names used to build role attributes (`<service>.dial`)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceNames {
    pub api: String,
    pub frontend: String,
    pub rtc: String,
    pub livekit: String,
    pub nats: String,
    pub turn: String,
    pub zac: String,
    pub dmz: String,
}

impl ServiceNames {
    /// Read service names from `ZITI_SERVICE_*` variables, leaving unset ones empty
    pub fn from_env() -> Self {
        let mut names = Self::default();
        names.apply_env();
        names
    }

    fn apply_env(&mut self) {
        let fields: [(&str, &mut String); 8] = [
            ("ZITI_SERVICE_API", &mut self.api),
            ("ZITI_SERVICE_FRONTEND", &mut self.frontend),
            ("ZITI_SERVICE_LIVEKIT_RTC", &mut self.rtc),
            ("ZITI_SERVICE_LIVEKIT", &mut self.livekit),
            ("ZITI_SERVICE_NATS", &mut self.nats),
            ("ZITI_SERVICE_TURN", &mut self.turn),
            ("ZITI_SERVICE_ZAC", &mut self.zac),
            ("ZITI_SERVICE_DMZ", &mut self.dmz),
        ];
        for (var, field) in fields {
            if let Ok(value) = std::env::var(var) {
                *field = value;
            }
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Controller base URL, e.g. `https://ctrl.example:1280`
    pub controller_url: String,

    /// Identity path without extension; `<path>.json` is the credential,
    /// `<path>.jwt` a pending enrollment token
    pub identity_path: PathBuf,

    /// Keep-alive ping interval in seconds
    pub keepalive_interval_secs: u64,

    /// What to do when the overlay cannot resolve a dial or listen
    pub fallback: FallbackPolicy,

    /// Endpoint used by `listen_packet` when the caller passes an unspecified address
    pub default_packet_endpoint: Option<String>,

    /// Capacity of the multiplexer's inbound datagram queue
    pub mux_queue_capacity: usize,

    /// How datagrams are delimited on peer streams
    pub framing: Framing,

    /// Development mode: log session tokens at debug level
    pub dev_env: bool,

    pub services: ServiceNames,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_url: String::new(),
            identity_path: PathBuf::from("identity"),
            keepalive_interval_secs: DEFAULT_KEEPALIVE_SECS,
            fallback: FallbackPolicy::Underlay,
            default_packet_endpoint: None,
            mux_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            framing: Framing::Raw,
            dev_env: false,
            services: ServiceNames::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Override fields from the environment
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("ZITI_CTRL_URL") {
            self.controller_url = url;
        }
        if let Ok(dev) = std::env::var("DEV_ENV") {
            self.dev_env = dev == "true";
        }
        self.services.apply_env();
    }

    /// Keep-alive interval as a duration
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.controller_url.starts_with("http://") && !self.controller_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid(format!(
                "controller_url must start with http:// or https://, got: {:?}",
                self.controller_url
            )));
        }

        if self.identity_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("identity_path is empty".to_string()));
        }

        if self.keepalive_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "keepalive_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.mux_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "mux_queue_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.keepalive_interval(), Duration::from_secs(600));
        assert_eq!(config.fallback, FallbackPolicy::Underlay);
        assert_eq!(config.framing, Framing::Raw);
        assert!(config.default_packet_endpoint.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let config = Config::from_toml(
            r#"
            controller_url = "https://ctrl.example:1280"
            identity_path = "/var/lib/zitirtc/publisher"
            keepalive_interval_secs = 30
            fallback = "disabled"
            framing = "length_prefixed"
            default_packet_endpoint = "turn.ziti:3478"

            [services]
            rtc = "livekit-rtc"
            turn = "turn"
            "#,
        )
        .unwrap();

        assert_eq!(config.controller_url, "https://ctrl.example:1280");
        assert_eq!(config.keepalive_interval_secs, 30);
        assert_eq!(config.fallback, FallbackPolicy::Disabled);
        assert_eq!(config.framing, Framing::LengthPrefixed);
        assert_eq!(config.services.rtc, "livekit-rtc");
        assert_eq!(config.services.nats, "");
        assert_eq!(config.mux_queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config {
            controller_url: "ctrl.example:1280".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.controller_url = "https://ctrl.example:1280".to_string();
        config.keepalive_interval_secs = 0;
        assert!(config.validate().is_err());

        config.keepalive_interval_secs = 10;
        config.identity_path = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_fallback_rejected() {
        let result = Config::from_toml(r#"fallback = "sometimes""#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
