//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use tether_protocol::codec::DEFAULT_MAX_LINE_LENGTH;

use super::serde_utils::{duration_secs, option_duration_secs};
use super::{normalize_fingerprint, parse_env, validate_duration, validate_shared_secret};
use super::{ENV_FINGERPRINT, ENV_MAX_RETRIES, ENV_SECRET, ENV_TARGET};
use crate::auth::AuthContext;
use crate::error::ConfigError;

/// Configuration for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Listener address to dial (`host:port`)
    pub target: String,

    /// Stop after this many failed attempts (0 = retry forever)
    pub max_retries: u32,

    /// Shared secret, 64 hex characters
    pub shared_secret: Option<String>,

    /// Expected SHA-256 fingerprint of the listener certificate
    pub fingerprint: Option<String>,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,

    /// Connection timeout (TCP connect plus TLS handshake)
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Kill `EXEC` children that run longer than this
    #[serde(with = "option_duration_secs")]
    pub exec_timeout: Option<Duration>,

    /// Shell spawned for PTY sessions
    pub shell: Option<String>,

    /// Ceiling for a single protocol line in bytes
    pub max_line_length: usize,

    /// Largest file `DOWNLOAD` will send
    pub max_download_size: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            target: "localhost:8443".to_string(),
            max_retries: 0,
            shared_secret: None,
            fingerprint: None,
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(30),
            exec_timeout: None,
            shell: None,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_download_size: 32 * 1024 * 1024,
        }
    }
}

impl AgentConfig {
    /// Apply `TETHER_*` overrides from an environment lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_TARGET) {
            self.target = value;
        }
        if let Some(value) = lookup(ENV_MAX_RETRIES) {
            self.max_retries = parse_env(ENV_MAX_RETRIES, value)?;
        }
        if let Some(value) = lookup(ENV_SECRET) {
            self.shared_secret = Some(value);
        }
        if let Some(value) = lookup(ENV_FINGERPRINT) {
            self.fingerprint = Some(value);
        }
        Ok(())
    }

    /// Validate the configuration before the agent starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.trim().is_empty() {
            return Err(ConfigError::MissingField("target".to_string()));
        }
        if !self.target.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "target must be host:port, got {:?}",
                self.target
            )));
        }
        validate_duration("connect_timeout", self.connect_timeout)?;
        if let Some(timeout) = self.exec_timeout {
            validate_duration("exec_timeout", timeout)?;
        }
        self.backoff.validate()?;
        self.auth_context()?;
        Ok(())
    }

    /// Shell for PTY sessions, falling back to `$SHELL` then the platform default
    pub fn pty_shell(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| default_shell().to_string())
    }

    /// Decode the authentication material
    pub fn auth_context(&self) -> Result<AuthContext, ConfigError> {
        let secret = self
            .shared_secret
            .as_deref()
            .map(validate_shared_secret)
            .transpose()?;
        let fingerprint = self
            .fingerprint
            .as_deref()
            .map(normalize_fingerprint)
            .transpose()?;
        Ok(AuthContext::new(secret, fingerprint))
    }
}

#[cfg(windows)]
fn default_shell() -> &'static str {
    "cmd.exe"
}

#[cfg(not(windows))]
fn default_shell() -> &'static str {
    "/bin/sh"
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_duration("backoff max", self.max)?;
        if self.initial.is_zero() || self.max < self.initial {
            return Err(ConfigError::Invalid(
                "backoff requires 0 < initial <= max".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff multiplier must be a finite number of at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(
                "backoff jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }
}
