//! Configuration loading and management
//!
//! ```yaml
//! api_base_url: https://play.example.com
//! ws_url: wss://play.example.com/ws
//! handshake_timeout_ms: 10000
//! backoff_initial_ms: 1000
//! backoff_max_ms: 30000
//! max_attempts: 10
//! ```
//!
//! Every key except the two URLs has a default.

use crate::core::entity::EntityId;
use crate::core::error::ConfigError;
use crate::protocol::PROTOCOL_VERSION;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Settings of a synchronization client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_backoff"))]
pub struct SyncConfig {
    /// Base URL of the REST API (snapshots, commands, tokens)
    #[validate(url)]
    pub api_base_url: String,

    /// URL of the live connection endpoint
    #[validate(url)]
    pub ws_url: String,

    /// Path of the connection-token endpoint, relative to `api_base_url`
    #[serde(default = "default_token_path")]
    pub token_path: String,

    #[serde(default = "default_protocol_version")]
    #[validate(range(min = 1))]
    pub protocol_version: u32,

    #[serde(default = "default_handshake_timeout_ms")]
    #[validate(range(min = 1))]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_fetch_timeout_ms")]
    #[validate(range(min = 1))]
    pub fetch_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    #[validate(range(min = 1))]
    pub command_timeout_ms: u64,

    #[serde(default = "default_backoff_initial_ms")]
    #[validate(range(min = 1))]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    #[validate(range(min = 1))]
    pub backoff_max_ms: u64,

    /// Reconnect attempts before giving up
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    /// Silence on the live connection after which it is considered stalled
    #[serde(default = "default_liveness_timeout_ms")]
    #[validate(range(min = 1))]
    pub liveness_timeout_ms: u64,

    /// How long a confirmed command may wait for its authoritative echo
    /// before the entity is refetched
    #[serde(default = "default_confirm_timeout_ms")]
    #[validate(range(min = 1))]
    pub confirm_timeout_ms: u64,

    #[serde(default = "default_event_capacity")]
    #[validate(range(min = 1))]
    pub event_capacity: usize,
}

fn default_token_path() -> String {
    "/api/ws/token".to_string()
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

// The server pings every 20s and drops silent clients after 40s.
fn default_liveness_timeout_ms() -> u64 {
    45_000
}

fn default_confirm_timeout_ms() -> u64 {
    5_000
}

fn default_event_capacity() -> usize {
    1024
}

fn validate_backoff(config: &SyncConfig) -> std::result::Result<(), ValidationError> {
    if config.backoff_initial_ms > config.backoff_max_ms {
        return Err(ValidationError::new("backoff_initial_exceeds_max"));
    }
    Ok(())
}

impl SyncConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&content).with_context(|| format!("in config file '{}'", path))
    }

    /// Load configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Run field and cross-field validation
    pub fn check(&self) -> std::result::Result<(), ConfigError> {
        self.validate()
            .map_err(|errors| ConfigError::Invalid(errors.to_string()))
    }

    /// Defaults pointing at a local development server
    pub fn default_config() -> Self {
        Self::for_endpoints("http://127.0.0.1:3001", "ws://127.0.0.1:3001/ws")
    }

    /// Defaults for the given endpoints
    pub fn for_endpoints(api_base_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ws_url: ws_url.into(),
            token_path: default_token_path(),
            protocol_version: default_protocol_version(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_attempts: default_max_attempts(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            event_capacity: default_event_capacity(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }

    pub fn token_url(&self) -> String {
        self.api_url(&self.token_path)
    }

    pub fn snapshot_url(&self, entity_id: EntityId) -> String {
        self.api_url(&format!("/api/games/{}/snapshot", entity_id))
    }

    /// Endpoint accepting one kind of command (`bid`, `play`, ...)
    pub fn command_url(&self, entity_id: EntityId, command: &str) -> String {
        self.api_url(&format!("/api/games/{}/{}", entity_id, command))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::default_config()
    }
}
