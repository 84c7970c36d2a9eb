//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown PTY frame kind
    #[error("Unknown PTY frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// A PTY frame payload did not match its kind
    #[error("Malformed {kind} frame: {reason}")]
    MalformedFrame { kind: &'static str, reason: String },

    /// A received line exceeded the configured ceiling
    #[error("Line exceeds maximum length of {max} bytes")]
    LineTooLong { max: usize },

    /// A line to be sent contains a line break
    #[error("Line contains an embedded line break")]
    EmbeddedNewline,

    /// A command line could not be parsed
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// An encoded payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
