//! Agent error types
//!
//! Every variant ends the current connection and feeds the reconnect driver.

use tether_core::{AuthError, ConnectionError};
use tether_protocol::ProtocolError;
use thiserror::Error;

/// Why a connection ended
#[derive(Error, Debug)]
pub enum AgentError {
    /// The listener could not be reached
    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectionError),

    /// Handshake failed or the listener was not the one we pinned
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The stream failed or was closed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The listener sent something that could not be framed
    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    /// The configured retry limit was reached
    #[error("Giving up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl From<ProtocolError> for AgentError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => AgentError::Transport(e.to_string()),
            other => AgentError::Protocol(other),
        }
    }
}
