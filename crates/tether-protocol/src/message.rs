//! Command and response lines for the tether protocol
//!
//! # Message Flow
//!
//! 1. Listener sends exactly one command line (`EXEC id`, `UPLOAD /tmp/x`, ...)
//! 2. Agent answers with zero or more response frames, each one line:
//!    - `::tether:data::<encoded>` carries a wire-encoded binary payload
//!    - any other line is a plain status line (`OK`, `ACK 3`, `ERR ...`)
//! 3. Agent terminates the response with `::tether:end::`
//!
//! The agent routes all command output through `Data` frames, so output that
//! happens to contain a marker never reaches the wire as a plain line. The
//! end marker is authoritative: a response is complete when it is seen.
//!
//! `PTY <rows> <cols>` is answered with the `::tether:pty::` marker instead of
//! an end marker; both directions then switch to binary PTY frames.

use std::fmt;

use crate::error::ProtocolError;
use crate::session::TerminalSize;
use crate::wire;

/// Sentinel line marking the end of a response
pub const END_MARKER: &str = "::tether:end::";

/// Prefix of a line carrying a wire-encoded payload
pub const DATA_PREFIX: &str = "::tether:data::";

/// Sentinel line announcing the switch to PTY framing
pub const PTY_MARKER: &str = "::tether:pty::";

/// A single response line from the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Plain status line
    Plain(String),
    /// Wire-encoded binary payload (still encoded)
    Data(String),
    /// End of the current response
    End,
    /// The agent has entered PTY mode
    PtyStart,
}

impl Frame {
    /// Build a `Data` frame by encoding a payload
    pub fn data(payload: &[u8]) -> Self {
        Frame::Data(wire::encode(payload))
    }

    /// Classify a received line
    pub fn parse(line: &str) -> Self {
        if line == END_MARKER {
            Frame::End
        } else if line == PTY_MARKER {
            Frame::PtyStart
        } else if let Some(encoded) = line.strip_prefix(DATA_PREFIX) {
            Frame::Data(encoded.to_string())
        } else {
            Frame::Plain(line.to_string())
        }
    }

    /// Render the frame as a protocol line (without the trailing newline)
    pub fn to_line(&self) -> String {
        match self {
            Frame::Plain(text) => text.clone(),
            Frame::Data(encoded) => format!("{}{}", DATA_PREFIX, encoded),
            Frame::End => END_MARKER.to_string(),
            Frame::PtyStart => PTY_MARKER.to_string(),
        }
    }

    /// Decode the payload of a `Data` frame
    ///
    /// Returns None for frames that carry no payload.
    pub fn decode_payload(&self) -> Option<Result<Vec<u8>, ProtocolError>> {
        match self {
            Frame::Data(encoded) => Some(wire::decode(encoded)),
            _ => None,
        }
    }
}

/// A command line sent from the listener to an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run a shell command
    Exec(String),
    /// Begin an upload to the given remote path
    Upload { path: String },
    /// One upload chunk; `payload` is wire-encoded
    Chunk { index: u64, payload: String },
    /// Finish the current upload
    UploadEnd,
    /// Discard the current upload
    UploadAbort,
    /// Fetch a remote file
    Download { path: String },
    /// Start an interactive shell with the given geometry
    Pty(TerminalSize),
    /// Liveness probe
    Ping,
}

impl Command {
    /// Build a chunk command by encoding the raw chunk bytes
    pub fn chunk(index: u64, data: &[u8]) -> Self {
        Command::Chunk {
            index,
            payload: wire::encode(data),
        }
    }

    /// Render the command as a protocol line (without the trailing newline)
    pub fn to_line(&self) -> String {
        match self {
            Command::Exec(text) => format!("EXEC {}", text),
            Command::Upload { path } => format!("UPLOAD {}", path),
            Command::Chunk { index, payload } => format!("CHUNK {} {}", index, payload),
            Command::UploadEnd => "UPLOAD_END".to_string(),
            Command::UploadAbort => "UPLOAD_ABORT".to_string(),
            Command::Download { path } => format!("DOWNLOAD {}", path),
            Command::Pty(size) => format!("PTY {} {}", size.rows, size.cols),
            Command::Ping => "PING".to_string(),
        }
    }

    /// Parse a command line
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest),
            None => (line, ""),
        };

        let command = match verb {
            "EXEC" => Command::Exec(rest.to_string()),
            "UPLOAD" if !rest.is_empty() => Command::Upload {
                path: rest.to_string(),
            },
            "CHUNK" => {
                let (index, payload) = rest
                    .split_once(' ')
                    .ok_or_else(|| ProtocolError::InvalidCommand("CHUNK without payload".into()))?;
                let index = index.parse().map_err(|_| {
                    ProtocolError::InvalidCommand(format!("bad chunk index: {}", index))
                })?;
                Command::Chunk {
                    index,
                    payload: payload.to_string(),
                }
            }
            "UPLOAD_END" => Command::UploadEnd,
            "UPLOAD_ABORT" => Command::UploadAbort,
            "DOWNLOAD" if !rest.is_empty() => Command::Download {
                path: rest.to_string(),
            },
            "PTY" => {
                let mut parts = rest.split_whitespace().map(str::parse::<u16>);
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(Ok(rows)), Some(Ok(cols)), None) => {
                        Command::Pty(TerminalSize::new(rows, cols))
                    }
                    _ => {
                        return Err(ProtocolError::InvalidCommand(format!(
                            "bad terminal size: {}",
                            rest
                        )))
                    }
                }
            }
            "PING" => Command::Ping,
            _ => return Err(ProtocolError::InvalidCommand(truncate(line, 64))),
        };

        Ok(command)
    }
}

/// Status words the agent sends as plain response lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    /// Generic success
    Ok,
    /// Upload chunk accepted
    Ack(u64),
    /// Upload complete with total byte count
    Done(u64),
    /// Operation failed on the agent
    Err(String),
    /// Answer to `PING`
    Pong,
}

impl AgentReply {
    /// Parse a plain status line
    pub fn parse(line: &str) -> Option<Self> {
        let (word, rest) = match line.split_once(' ') {
            Some((word, rest)) => (word, Some(rest)),
            None => (line, None),
        };

        match (word, rest) {
            ("OK", None) => Some(AgentReply::Ok),
            ("PONG", None) => Some(AgentReply::Pong),
            ("ACK", Some(n)) => n.parse().ok().map(AgentReply::Ack),
            ("DONE", Some(n)) => n.parse().ok().map(AgentReply::Done),
            ("ERR", Some(message)) => Some(AgentReply::Err(message.to_string())),
            ("ERR", None) => Some(AgentReply::Err(String::new())),
            _ => None,
        }
    }

    /// Wrap the reply in a plain frame
    pub fn into_frame(self) -> Frame {
        Frame::Plain(self.to_string())
    }
}

impl fmt::Display for AgentReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentReply::Ok => write!(f, "OK"),
            AgentReply::Ack(index) => write!(f, "ACK {}", index),
            AgentReply::Done(bytes) => write!(f, "DONE {}", bytes),
            // Keep status lines single-line whatever the error text contains
            AgentReply::Err(message) => write!(f, "ERR {}", message.replace(['\r', '\n'], " ")),
            AgentReply::Pong => write!(f, "PONG"),
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
