//! CLI configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MWRPC_CONFIG or --config)
//! 3. Environment variables
//! 4. Command-line flags (applied by `main`)

use mwrpc_client::{ClientConfig, ConnectionConfig, TlsClientConfig};
use mwrpc_protocol::DEFAULT_WEBSOCKET_PATH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Daemon connection settings.
    pub connection: ConnectionSection,
    /// Job polling settings.
    pub jobs: JobsSection,
    /// TLS settings for `wss://` URLs.
    pub tls: TlsSection,
}

impl Config {
    /// Loads configuration from `path` (or MWRPC_CONFIG), then applies
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("MWRPC_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `MWRPC_*` overrides read through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        self.connection.apply_overrides(&var);
        self.jobs.apply_overrides(&var);
        self.tls.apply_overrides(&var);
    }

    /// Validates the merged configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.connection.url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::ValidationError(format!(
                "url must start with ws:// or wss://, got '{}'",
                url
            )));
        }
        if self.connection.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.jobs.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        self.tls.validate()
    }

    /// Builds the client configuration.
    pub fn client_config(&self) -> ClientConfig {
        let connection = ConnectionConfig::new(self.connection.url.clone())
            .with_connect_timeout(self.connection.connect_timeout())
            .with_tls(self.tls.client_tls());

        ClientConfig::new(self.connection.url.clone())
            .with_connection(connection)
            .with_request_timeout(self.connection.request_timeout())
            .with_poll_interval(self.jobs.poll_interval())
    }
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// WebSocket URL of the daemon.
    pub url: String,
    /// Dial timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Per-call timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            url: format!("ws://127.0.0.1{}", DEFAULT_WEBSOCKET_PATH),
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl ConnectionSection {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("MWRPC_URL") {
            if !url.is_empty() {
                self.url = url;
            }
        }
        if let Some(secs) = var("MWRPC_CONNECT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.connect_timeout_secs = secs;
        }
        if let Some(secs) = var("MWRPC_REQUEST_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.request_timeout_secs = secs;
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Job polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    /// Delay between job status queries, in milliseconds.
    pub poll_interval_ms: u64,
    /// Default upper bound on waiting for a job, in seconds.
    pub max_wait_secs: u64,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            max_wait_secs: 600,
        }
    }
}

impl JobsSection {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(ms) = var("MWRPC_POLL_INTERVAL").and_then(|v| v.parse().ok()) {
            self.poll_interval_ms = ms;
        }
        if let Some(secs) = var("MWRPC_MAX_WAIT").and_then(|v| v.parse().ok()) {
            self.max_wait_secs = secs;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

/// TLS settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    /// CA certificate used to verify the daemon.
    pub ca_cert: Option<PathBuf>,
    /// Client certificate (for mTLS).
    pub client_cert: Option<PathBuf>,
    /// Client private key (for mTLS).
    pub client_key: Option<PathBuf>,
    /// Skip certificate verification (INSECURE).
    pub insecure: bool,
}

impl TlsSection {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("MWRPC_CA_CERT") {
            self.ca_cert = Some(PathBuf::from(path));
        }
        if let Some(path) = var("MWRPC_CLIENT_CERT") {
            self.client_cert = Some(PathBuf::from(path));
        }
        if let Some(path) = var("MWRPC_CLIENT_KEY") {
            self.client_key = Some(PathBuf::from(path));
        }
        if let Some(insecure) = var("MWRPC_INSECURE") {
            self.insecure = insecure == "1" || insecure.to_lowercase() == "true";
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.client_cert.is_some() != self.client_key.is_some() {
            return Err(ConfigError::ValidationError(
                "client_cert and client_key must be set together".to_string(),
            ));
        }
        Ok(())
    }

    fn client_tls(&self) -> TlsClientConfig {
        let mut tls = TlsClientConfig::new();
        if let Some(ref path) = self.ca_cert {
            tls = tls.with_ca_cert(path);
        }
        if let (Some(cert), Some(key)) = (&self.client_cert, &self.client_key) {
            tls = tls.with_client_cert(cert, key);
        }
        if self.insecure {
            tls = tls.with_insecure();
        }
        tls
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
