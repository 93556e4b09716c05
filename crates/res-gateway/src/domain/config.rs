//! Gateway configuration with validation.
//!
//! Loaded in three layers: defaults, an optional JSON file, then command
//! line overrides. [`GatewayConfig::validate`] must pass before the
//! service is started.

use super::rid::{is_valid_rid, is_valid_rid_part, split_method};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// NATS server URL
    pub nats_url: String,
    /// Bind address
    pub addr: IpAddr,
    /// Port for websocket and HTTP traffic
    pub port: u16,
    /// Path for websocket upgrades
    pub ws_path: String,
    /// Path prefix for HTTP resource access
    pub api_path: String,
    /// Resource method called with HTTP headers on new connections
    pub header_auth: Option<String>,
    /// `*` or a `;` separated list of origins
    pub allow_origin: String,
    /// Call method mapped to HTTP PUT
    pub put_method: Option<String>,
    /// Call method mapped to HTTP DELETE
    pub delete_method: Option<String>,
    /// Call method mapped to HTTP PATCH
    pub patch_method: Option<String>,
    /// Serve over TLS
    pub tls: bool,
    /// TLS certificate file
    pub cert_file: Option<PathBuf>,
    /// TLS key file
    pub key_file: Option<PathBuf>,
    /// Timeout for requests on the bus
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Idle time before an unused event subscription is dropped
    #[serde(with = "humantime_serde")]
    pub unsubscribe_delay: Duration,
    /// Number of resource cache workers
    pub cache_workers: usize,
    /// Max direct subscriptions per resource on one connection
    pub subscription_limit: u32,
    /// Max parallel get requests reloading resources on a system reset.
    /// 0 means no limit.
    pub reset_throttle: usize,
    /// Max parallel get requests while loading the references of one
    /// subscription. 0 means no limit.
    pub reference_throttle: usize,
    /// Ask for permessage-deflate on websocket connections
    pub ws_compression: bool,
    /// Log level used when RUST_LOG is not set
    pub log_level: String,
    /// Output logs as JSON
    pub json_logs: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://127.0.0.1:4222".to_string(),
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            ws_path: "/ws".to_string(),
            api_path: "/api/".to_string(),
            header_auth: None,
            allow_origin: "*".to_string(),
            put_method: None,
            delete_method: None,
            patch_method: None,
            tls: false,
            cert_file: None,
            key_file: None,
            request_timeout: Duration::from_secs(5),
            unsubscribe_delay: Duration::from_secs(5),
            cache_workers: 10,
            subscription_limit: 256,
            reset_throttle: 0,
            reference_throttle: 0,
            ws_compression: false,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON file on top of the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))
    }

    /// Validate configuration and normalize paths.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port cannot be 0".into()));
        }

        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.ws_path.clone()));
        }
        if !self.api_path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.api_path.clone()));
        }
        if !self.api_path.ends_with('/') {
            self.api_path.push('/');
        }
        if self.api_path == self.ws_path {
            return Err(ConfigError::Invalid(
                "wsPath and apiPath must differ".into(),
            ));
        }

        if let Some(ref header_auth) = self.header_auth {
            if !is_valid_rid(header_auth, false) || split_method(header_auth).is_none() {
                return Err(ConfigError::InvalidHeaderAuth(header_auth.clone()));
            }
        }

        self.allow_origin = validate_allow_origin(&self.allow_origin)?;

        for method in [&self.put_method, &self.delete_method, &self.patch_method]
            .into_iter()
            .flatten()
        {
            if !is_valid_rid_part(method) {
                return Err(ConfigError::InvalidMethod(method.clone()));
            }
        }

        if self.tls && (self.cert_file.is_none() || self.key_file.is_none()) {
            return Err(ConfigError::MissingTlsFiles);
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "requestTimeout cannot be 0".into(),
            ));
        }
        if self.unsubscribe_delay.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "unsubscribeDelay cannot be 0".into(),
            ));
        }
        if self.cache_workers == 0 {
            return Err(ConfigError::Invalid("cacheWorkers cannot be 0".into()));
        }
        if self.subscription_limit == 0 {
            return Err(ConfigError::Invalid(
                "subscriptionLimit cannot be 0".into(),
            ));
        }

        Ok(())
    }

    /// Get server bind address
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Header auth split into resource and method
    pub fn header_auth_method(&self) -> Option<(&str, &str)> {
        self.header_auth.as_deref().and_then(split_method)
    }

    /// Allowed origins, or `None` when any origin is allowed
    pub fn allowed_origins(&self) -> Option<Vec<String>> {
        if self.allow_origin == "*" {
            None
        } else {
            Some(self.allow_origin.split(';').map(str::to_string).collect())
        }
    }

    /// Value of the `Access-Control-Allow-Methods` header
    pub fn allow_methods(&self) -> String {
        let mut methods = String::from("GET, HEAD, OPTIONS, POST");
        if self.put_method.is_some() {
            methods.push_str(", PUT");
        }
        if self.delete_method.is_some() {
            methods.push_str(", DELETE");
        }
        if self.patch_method.is_some() {
            methods.push_str(", PATCH");
        }
        methods
    }

    /// URL scheme for Location headers
    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }
}

/// Lowercase and check each origin, returning the normalized setting.
fn validate_allow_origin(setting: &str) -> Result<String, ConfigError> {
    let origins: Vec<String> = setting.split(';').map(|o| o.to_ascii_lowercase()).collect();
    for origin in &origins {
        if origin == "*" {
            if origins.len() > 1 {
                return Err(ConfigError::InvalidOrigin(
                    "'*' must not be used together with other origins".into(),
                ));
            }
            continue;
        }
        if !is_plain_origin(origin) {
            return Err(ConfigError::InvalidOrigin(format!(
                "'{}' doesn't match <scheme>://<hostname>[:<port>]",
                origin
            )));
        }
    }
    let mut origins = origins;
    origins.sort();
    Ok(origins.join(";"))
}

fn is_plain_origin(origin: &str) -> bool {
    let Some((scheme, host)) = origin.split_once("://") else {
        return false;
    };
    !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        && !host.is_empty()
        && !host.contains(['/', '?', '#', '@', ' '])
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file: {0}")]
    Read(String),
    /// Config file is not valid JSON
    #[error("failed to parse config file: {0}")]
    Parse(String),
    /// Path setting does not start with a slash
    #[error("invalid path: {0} (must start with '/')")]
    InvalidPath(String),
    /// Header auth is not a valid resource method
    #[error("invalid headerAuth: {0} (must be a valid resource method)")]
    InvalidHeaderAuth(String),
    /// Invalid origin list
    #[error("invalid allowOrigin: {0}")]
    InvalidOrigin(String),
    /// Invalid HTTP verb mapping
    #[error("invalid method mapping: {0} (must be a valid call method name)")]
    InvalidMethod(String),
    /// TLS enabled without certificate or key
    #[error("tls enabled without certFile and keyFile")]
    MissingTlsFiles,
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Humantime serde module for Duration serialization
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    pub fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .ok()
                .and_then(|m| m.checked_mul(60))
                .map(Duration::from_secs)
                .ok_or("invalid minutes")
        } else {
            // Plain seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}

pub use humantime_serde::parse_duration;
