//! Session mode and terminal geometry

use std::fmt;

/// Framing mode of a session's byte stream
///
/// A session is in exactly one mode at a time. While `PtyActive`, no
/// command/response exchange may be issued against it, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionMode {
    /// Line-oriented command/response traffic
    #[default]
    Command,
    /// Raw interactive terminal relay
    PtyActive,
}

impl SessionMode {
    /// Whether the session is relaying raw terminal bytes
    pub fn is_pty(&self) -> bool {
        matches!(self, SessionMode::PtyActive)
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Command => write!(f, "command"),
            SessionMode::PtyActive => write!(f, "pty"),
        }
    }
}

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}
