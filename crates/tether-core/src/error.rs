//! Core error types for tether

use std::path::PathBuf;
use std::time::Duration;

use tether_protocol::{ProtocolError, SessionMode};
use thiserror::Error;

/// Top-level error type for the tether ecosystem
#[derive(Error, Debug)]
pub enum TetherError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Transfer error
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors establishing an outbound transport
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// TCP connect failed
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Connect did not complete in time
    #[error("Connection to {0} timed out")]
    Timeout(String),

    /// TLS negotiation failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Target address could not be used
    #[error("Invalid target address: {0}")]
    InvalidTarget(String),
}

/// Authentication handshake failures
///
/// Any of these aborts the connection attempt; the listener never admits the
/// session.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Pinned certificate fingerprint does not match the peer's certificate
    #[error("Certificate fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// Fingerprint pinning is configured but the peer presented no certificate
    #[error("Peer presented no certificate")]
    NoPeerCertificate,

    /// Listener demands a shared secret the agent does not have
    #[error("Listener requires a shared secret but none is configured")]
    SecretRequired,

    /// Listener rejected the agent's proof
    #[error("Listener rejected the shared-secret proof")]
    Denied,

    /// Agent's proof did not verify (listener side)
    #[error("Invalid shared-secret proof")]
    InvalidProof,

    /// Peer sent something other than the expected handshake line
    #[error("Unexpected handshake line: {0}")]
    UnexpectedLine(String),

    /// Handshake did not complete in time
    #[error("Handshake timed out")]
    Timeout,

    /// Stream failed during the handshake
    #[error("Transport failure during handshake: {0}")]
    Transport(String),
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// No session is registered under the address, or it was closed by the peer
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Write or read failure on the session's connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// No end marker arrived within the timeout
    #[error("No complete response within {0:?}")]
    ResponseTimeout(Duration),

    /// Another exchange held the session for longer than the command timeout
    #[error("Session {addr} is busy; gave up after {waited:?}")]
    Busy { addr: String, waited: Duration },

    /// The operation is not allowed in the session's current mode
    #[error("Session {addr} is in {mode} mode")]
    ModeConflict { addr: String, mode: SessionMode },

    /// Command text cannot be sent as a single line
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Agent answered with something the operation did not expect
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl SessionError {
    /// Whether the caller should drop the session
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }
}

/// File transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    /// Local file could not be read or written
    #[error("Local I/O error on {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Agent reported a failure
    #[error("Agent reported: {0}")]
    Remote(String),

    /// Payload could not be decoded
    #[error("Corrupt payload: {0}")]
    Decode(#[from] ProtocolError),

    /// Agent acknowledged the wrong chunk or answered with something else
    #[error("Expected acknowledgment of chunk {expected}, got {got:?}")]
    Acknowledgement { expected: u64, got: String },

    /// Underlying exchange failed
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl TransferError {
    /// Whether the caller should drop the session
    pub fn is_session_fatal(&self) -> bool {
        match self {
            TransferError::Session(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Shared secret is not exactly 64 hex characters
    #[error("Shared secret must be exactly 64 hexadecimal characters")]
    InvalidSecret,

    /// Fingerprint is not a SHA-256 hex digest
    #[error("Fingerprint must be a SHA-256 digest (64 hex characters, optional ':' separators)")]
    InvalidFingerprint,

    /// Environment override could not be parsed
    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    /// Certificate or key could not be loaded
    #[error("Certificate error for {path}: {reason}")]
    Certificate { path: PathBuf, reason: String },
}
