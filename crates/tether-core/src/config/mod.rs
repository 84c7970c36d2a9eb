//! Configuration management for tether
//!
//! Configuration is layered: defaults, then an optional TOML file, then
//! `TETHER_*` environment variables, then command-line flags. The result is
//! validated once before anything starts; invalid values are fatal at startup
//! and never surface at runtime.

mod agent;
mod listener;
pub mod serde_utils;

pub use agent::{AgentConfig, BackoffConfig};
pub use listener::ListenerConfig;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tether_protocol::auth::{SharedSecret, SECRET_LEN};

use crate::error::ConfigError;

/// Environment variable: listener port
pub const ENV_PORT: &str = "TETHER_PORT";
/// Environment variable: listener bind interface
pub const ENV_INTERFACE: &str = "TETHER_INTERFACE";
/// Environment variable: enable shared-secret authentication on the listener
pub const ENV_AUTH: &str = "TETHER_AUTH";
/// Environment variable: shared secret (64 hex characters)
pub const ENV_SECRET: &str = "TETHER_SECRET";
/// Environment variable: listener certificate (PEM)
pub const ENV_CERT: &str = "TETHER_CERT";
/// Environment variable: listener private key (PEM)
pub const ENV_KEY: &str = "TETHER_KEY";
/// Environment variable: agent target address
pub const ENV_TARGET: &str = "TETHER_TARGET";
/// Environment variable: agent retry limit (0 = infinite)
pub const ENV_MAX_RETRIES: &str = "TETHER_MAX_RETRIES";
/// Environment variable: expected listener certificate fingerprint
pub const ENV_FINGERPRINT: &str = "TETHER_FINGERPRINT";

/// Longest accepted timeout or backoff delay
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Reject durations that are zero or longer than [`MAX_DURATION`]
pub(crate) fn validate_duration(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() || value > MAX_DURATION {
        return Err(ConfigError::Invalid(format!(
            "{} must be non-zero and at most {}s",
            name,
            MAX_DURATION.as_secs()
        )));
    }
    Ok(())
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Validate a shared secret and decode it
///
/// Accepts exactly 64 hexadecimal characters (either case).
pub fn validate_shared_secret(secret: &str) -> Result<SharedSecret, ConfigError> {
    if secret.len() != SECRET_LEN * 2 {
        return Err(ConfigError::InvalidSecret);
    }

    let mut out = [0u8; SECRET_LEN];
    hex::decode_to_slice(secret, &mut out).map_err(|_| ConfigError::InvalidSecret)?;
    Ok(out)
}

/// Validate a certificate fingerprint and normalise it to lowercase hex
///
/// Accepts 64 hex characters, optionally grouped with `:` separators as
/// printed by `openssl x509 -fingerprint -sha256`.
pub fn normalize_fingerprint(fingerprint: &str) -> Result<String, ConfigError> {
    let normalized: String = fingerprint
        .trim()
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if normalized.len() != 64 || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidFingerprint);
    }

    Ok(normalized)
}

/// Read the process environment (for `apply_env_overrides`)
pub fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

/// Parse an environment override
fn parse_env<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

/// Parse a boolean environment override
fn parse_env_bool(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { var, value }),
    }
}
