//! tether-protocol: Wire protocol for tether command sessions
//!
//! This crate defines the line-oriented protocol spoken between the listener
//! and its agents over TLS: command lines, framed response lines, the binary
//! PTY framing used while an interactive shell is attached, and the text-safe
//! encoding used to carry binary payloads inside lines.

pub mod auth;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod session;
pub mod wire;

pub use codec::{ChannelCodec, ChannelMode, Inbound, Outbound};
pub use error::ProtocolError;
pub use frame::{PtyFrame, PtyFrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{AgentReply, Command, Frame, DATA_PREFIX, END_MARKER, PTY_MARKER};
pub use session::{SessionMode, TerminalSize};
