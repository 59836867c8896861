//! Configuration management for Agrichat
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{AgrichatError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for Agrichat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Backend endpoints and request behavior
    #[serde(default)]
    pub server: ServerConfig,
    /// Session and credential settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Streaming transport settings
    #[serde(default)]
    pub transport: TransportConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the REST API (e.g. `https://api.example.com/api`)
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// URL of the streaming endpoint (e.g. `wss://api.example.com/chat`)
    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// Timeout for ordinary REST calls (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Language code attached to generate and question requests
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_api_base() -> String {
    "http://localhost:3000/api".to_string()
}

fn default_stream_url() -> String {
    "ws://localhost:3000/chat".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            stream_url: default_stream_url(),
            request_timeout_seconds: default_request_timeout(),
            language: default_language(),
        }
    }
}

/// Where session credentials are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialBackend {
    /// OS native keyring
    #[default]
    Keyring,
    /// JSON file under the data directory
    File,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Timeout applied to `authenticate` and `refresh` (seconds)
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_seconds: u64,

    /// How long before server-side expiry a token counts as expired (seconds)
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_seconds: i64,

    /// Credential persistence backend
    #[serde(default)]
    pub credential_backend: CredentialBackend,

    /// Override for the credential file path (file backend only)
    #[serde(default)]
    pub credential_file: Option<PathBuf>,
}

fn default_auth_timeout() -> u64 {
    15
}

fn default_refresh_skew() -> i64 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_timeout_seconds: default_auth_timeout(),
            refresh_skew_seconds: default_refresh_skew(),
            credential_backend: CredentialBackend::default(),
            credential_file: None,
        }
    }
}

/// Streaming transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// First reconnect delay (milliseconds)
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Multiplier applied after each failed attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on any reconnect delay (milliseconds)
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,

    /// Fraction of each delay randomized as jitter (0.0 disables)
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// Timeout for the websocket handshake (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

fn default_backoff_base() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_backoff_cap() -> u64 {
    30_000
}

fn default_backoff_jitter() -> f64 {
    0.1
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base(),
            backoff_factor: default_backoff_factor(),
            backoff_cap_ms: default_backoff_cap(),
            backoff_jitter: default_backoff_jitter(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON-formatted logs
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "agrichat=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl ServerConfig {
    /// Per-request REST timeout as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl SessionConfig {
    /// Authentication timeout as a [`Duration`]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_seconds)
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AgrichatError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| AgrichatError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(api_base) = std::env::var("AGRICHAT_API_BASE") {
            self.server.api_base = api_base;
        }

        if let Ok(stream_url) = std::env::var("AGRICHAT_STREAM_URL") {
            self.server.stream_url = stream_url;
        }

        if let Ok(language) = std::env::var("AGRICHAT_LANGUAGE") {
            self.server.language = language;
        }

        if let Ok(timeout) = std::env::var("AGRICHAT_REQUEST_TIMEOUT_SECONDS") {
            match timeout.parse() {
                Ok(value) => self.server.request_timeout_seconds = value,
                Err(_) => tracing::warn!("Invalid AGRICHAT_REQUEST_TIMEOUT_SECONDS: {}", timeout),
            }
        }

        if let Ok(timeout) = std::env::var("AGRICHAT_AUTH_TIMEOUT_SECONDS") {
            match timeout.parse() {
                Ok(value) => self.session.auth_timeout_seconds = value,
                Err(_) => tracing::warn!("Invalid AGRICHAT_AUTH_TIMEOUT_SECONDS: {}", timeout),
            }
        }

        if let Ok(base) = std::env::var("AGRICHAT_BACKOFF_BASE_MS") {
            match base.parse() {
                Ok(value) => self.transport.backoff_base_ms = value,
                Err(_) => tracing::warn!("Invalid AGRICHAT_BACKOFF_BASE_MS: {}", base),
            }
        }

        if let Ok(cap) = std::env::var("AGRICHAT_BACKOFF_CAP_MS") {
            match cap.parse() {
                Ok(value) => self.transport.backoff_cap_ms = value,
                Err(_) => tracing::warn!("Invalid AGRICHAT_BACKOFF_CAP_MS: {}", cap),
            }
        }

        if let Ok(json_logs) = std::env::var("AGRICHAT_LOG_JSON") {
            match json_logs.parse::<bool>() {
                Ok(v) => {
                    self.logging.json_format = v;
                    tracing::debug!(json_logs = v, "Env override: AGRICHAT_LOG_JSON");
                }
                Err(_) => tracing::warn!("Invalid value for AGRICHAT_LOG_JSON: {}", json_logs),
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(api_base) = &cli.api_base {
            self.server.api_base = api_base.clone();
        }
        if let Some(language) = &cli.language {
            self.server.language = language.clone();
        }
        if cli.verbose {
            self.logging.level = "agrichat=debug".to_string();
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`AgrichatError::Config`] naming the first invalid field
    pub fn validate(&self) -> Result<()> {
        let api_base = url::Url::parse(&self.server.api_base)
            .map_err(|e| AgrichatError::Config(format!("Invalid server.api_base: {}", e)))?;
        if !matches!(api_base.scheme(), "http" | "https") {
            return Err(AgrichatError::Config(
                "server.api_base must use http or https".to_string(),
            )
            .into());
        }

        let stream_url = url::Url::parse(&self.server.stream_url)
            .map_err(|e| AgrichatError::Config(format!("Invalid server.stream_url: {}", e)))?;
        if !matches!(stream_url.scheme(), "ws" | "wss") {
            return Err(
                AgrichatError::Config("server.stream_url must use ws or wss".to_string()).into(),
            );
        }

        if self.server.request_timeout_seconds == 0 {
            return Err(AgrichatError::Config(
                "server.request_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.session.auth_timeout_seconds == 0 {
            return Err(AgrichatError::Config(
                "session.auth_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.transport.backoff_base_ms == 0 {
            return Err(AgrichatError::Config(
                "transport.backoff_base_ms must be greater than 0".to_string(),
            )
            .into());
        }

        if self.transport.backoff_cap_ms < self.transport.backoff_base_ms {
            return Err(AgrichatError::Config(
                "transport.backoff_cap_ms must be at least backoff_base_ms".to_string(),
            )
            .into());
        }

        if self.transport.backoff_factor < 1.0 {
            return Err(AgrichatError::Config(
                "transport.backoff_factor must be at least 1.0".to_string(),
            )
            .into());
        }

        if !(0.0..=1.0).contains(&self.transport.backoff_jitter) {
            return Err(AgrichatError::Config(
                "transport.backoff_jitter must be between 0.0 and 1.0".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
