//! Listener configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use tether_protocol::auth::SharedSecret;
use tether_protocol::codec::DEFAULT_MAX_LINE_LENGTH;

use super::serde_utils::duration_secs;
use super::{parse_env, parse_env_bool, validate_duration, validate_shared_secret};
use super::{ENV_AUTH, ENV_CERT, ENV_INTERFACE, ENV_KEY, ENV_PORT, ENV_SECRET};
use crate::error::ConfigError;

/// Configuration for the listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// TCP port to accept agents on
    pub port: u16,

    /// Interface address to bind
    pub interface: String,

    /// Require agents to prove possession of the shared secret
    pub auth_enabled: bool,

    /// Shared secret, 64 hex characters (required when `auth_enabled`)
    pub shared_secret: Option<String>,

    /// Certificate chain presented to agents (PEM)
    pub cert_path: Option<PathBuf>,

    /// Private key for the certificate (PEM)
    pub key_path: Option<PathBuf>,

    /// Timeout for writing one command to an agent
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Timeout for collecting a complete response
    #[serde(with = "duration_secs")]
    pub response_timeout: Duration,

    /// Upload chunk size in bytes
    pub transfer_chunk_size: usize,

    /// Ceiling for a single protocol line in bytes
    pub max_line_length: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            port: 8443,
            interface: "0.0.0.0".to_string(),
            auth_enabled: false,
            shared_secret: None,
            cert_path: Some(config_dir.join("listener.crt")),
            key_path: Some(config_dir.join("listener.key")),
            command_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            transfer_chunk_size: 64 * 1024,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl ListenerConfig {
    /// Get the bind address (interface:port)
    pub fn bind_address(&self) -> String {
        if self.interface.contains(':') && !self.interface.starts_with('[') {
            format!("[{}]:{}", self.interface, self.port)
        } else {
            format!("{}:{}", self.interface, self.port)
        }
    }

    /// Apply `TETHER_*` overrides from an environment lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_PORT) {
            self.port = parse_env(ENV_PORT, value)?;
        }
        if let Some(value) = lookup(ENV_INTERFACE) {
            self.interface = value;
        }
        if let Some(value) = lookup(ENV_AUTH) {
            self.auth_enabled = parse_env_bool(ENV_AUTH, value)?;
        }
        if let Some(value) = lookup(ENV_SECRET) {
            self.shared_secret = Some(value);
        }
        if let Some(value) = lookup(ENV_CERT) {
            self.cert_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_KEY) {
            self.key_path = Some(PathBuf::from(value));
        }
        Ok(())
    }

    /// Validate the configuration before the listener starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".to_string()));
        }
        if self.interface.trim().is_empty() {
            return Err(ConfigError::MissingField("interface".to_string()));
        }
        if self.cert_path.is_none() {
            return Err(ConfigError::MissingField("cert_path".to_string()));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::MissingField("key_path".to_string()));
        }
        validate_duration("command_timeout", self.command_timeout)?;
        validate_duration("response_timeout", self.response_timeout)?;
        if self.transfer_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "transfer_chunk_size must be non-zero".to_string(),
            ));
        }
        // An encoded chunk must fit in one line (hex doubles, gzip may grow slightly)
        if self.transfer_chunk_size.saturating_mul(2).saturating_add(1024) > self.max_line_length {
            return Err(ConfigError::Invalid(
                "transfer_chunk_size does not fit within max_line_length".to_string(),
            ));
        }
        self.shared_secret()?;
        Ok(())
    }

    /// The decoded shared secret, if authentication is enabled
    pub fn shared_secret(&self) -> Result<Option<SharedSecret>, ConfigError> {
        if !self.auth_enabled {
            return Ok(None);
        }
        match &self.shared_secret {
            Some(secret) => validate_shared_secret(secret).map(Some),
            None => Err(ConfigError::MissingField("shared_secret".to_string())),
        }
    }
}
