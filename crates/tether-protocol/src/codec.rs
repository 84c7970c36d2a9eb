//! Tokio codec for the session byte stream
//!
//! A session's stream starts out line-oriented and can be switched into PTY
//! framing and back. The switch happens between items: `FramedRead` hands out
//! one decoded item per poll, so whoever owns the reader can flip the mode
//! right after the item that announces the transition and no byte is ever
//! interpreted under the wrong framing.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::error::ProtocolError;
use crate::frame::PtyFrame;

/// Default ceiling for a single protocol line (64MB)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024 * 1024;

/// Framing currently applied to inbound bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelMode {
    /// Newline-terminated text lines
    #[default]
    Lines,
    /// Binary PTY frames
    Pty,
}

/// A decoded inbound item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One text line, without its terminator
    Line(String),
    /// One PTY frame
    Pty(PtyFrame),
}

/// An outbound item to encode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One text line; must not contain a line break
    Line(String),
    /// One PTY frame
    Pty(PtyFrame),
}

/// Codec for the mode-switching session stream
#[derive(Debug)]
pub struct ChannelCodec {
    /// Framing applied to the next decoded item
    mode: ChannelMode,
    /// Line decoder (enforces the line length ceiling)
    lines: LinesCodec,
    /// Configured line ceiling, kept for error reporting
    max_line_length: usize,
}

impl ChannelCodec {
    /// Create a codec with the default line ceiling
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Create a codec with a custom line ceiling
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            mode: ChannelMode::Lines,
            lines: LinesCodec::new_with_max_length(max_line_length),
            max_line_length,
        }
    }

    /// Current decoding mode
    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Switch the decoding mode for subsequent items
    pub fn set_mode(&mut self, mode: ChannelMode) {
        if self.mode != mode {
            tracing::trace!("Channel framing {:?} -> {:?}", self.mode, mode);
        }
        self.mode = mode;
    }

    fn map_lines_error(&self, err: LinesCodecError) -> ProtocolError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::LineTooLong {
                max: self.max_line_length,
            },
            LinesCodecError::Io(e) => ProtocolError::Io(e),
        }
    }
}

impl Default for ChannelCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChannelCodec {
    type Item = Inbound;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.mode {
            ChannelMode::Lines => match self.lines.decode(src) {
                Ok(line) => Ok(line.map(Inbound::Line)),
                Err(e) => Err(self.map_lines_error(e)),
            },
            ChannelMode::Pty => Ok(PtyFrame::decode(src)?.map(Inbound::Pty)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.mode {
            ChannelMode::Lines => match self.lines.decode_eof(src) {
                Ok(line) => Ok(line.map(Inbound::Line)),
                Err(e) => Err(self.map_lines_error(e)),
            },
            ChannelMode::Pty => match self.decode(src)? {
                Some(item) => Ok(Some(item)),
                None if src.is_empty() => Ok(None),
                None => Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside a PTY frame",
                ))),
            },
        }
    }
}

impl Encoder<Outbound> for ChannelCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Outbound::Line(line) => {
                if line.contains(['\n', '\r']) {
                    return Err(ProtocolError::EmbeddedNewline);
                }
                dst.reserve(line.len() + 1);
                dst.extend_from_slice(line.as_bytes());
                dst.extend_from_slice(b"\n");
                Ok(())
            }
            Outbound::Pty(frame) => frame.encode(dst),
        }
    }
}
