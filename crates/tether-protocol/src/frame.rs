//! PTY frame encoding/decoding
//!
//! While a session is in PTY mode the stream carries binary frames instead of
//! lines. Each frame uses a 4-byte header:
//! - kind: 1 byte (u8)
//! - payload_length: 3 bytes (u24, big-endian, max 16MB)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::session::TerminalSize;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size (16MB - 1, limited by 24-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// PTY frame kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PtyFrameKind {
    /// Raw terminal bytes
    Data = 0x01,
    /// Terminal resize (listener -> agent)
    Resize = 0x02,
    /// Leave PTY mode
    Exit = 0x03,
}

impl PtyFrameKind {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Resize),
            0x03 => Some(Self::Exit),
            _ => None,
        }
    }
}

/// A frame exchanged while a session is in PTY mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyFrame {
    /// Terminal bytes, relayed verbatim
    Data(Bytes),
    /// New terminal geometry
    Resize(TerminalSize),
    /// Request (or acknowledge) a return to line mode.
    ///
    /// The agent includes the shell's exit code when the shell ended on its own.
    Exit { exit_code: Option<i32> },
}

impl PtyFrame {
    /// Get the kind of this frame
    pub fn kind(&self) -> PtyFrameKind {
        match self {
            PtyFrame::Data(_) => PtyFrameKind::Data,
            PtyFrame::Resize(_) => PtyFrameKind::Resize,
            PtyFrame::Exit { .. } => PtyFrameKind::Exit,
        }
    }

    /// Encode the frame (header and payload) into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload_len = match self {
            PtyFrame::Data(data) => data.len(),
            PtyFrame::Resize(_) => 4,
            PtyFrame::Exit { exit_code } => exit_code.map_or(0, |_| 4),
        };

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(HEADER_SIZE + payload_len);
        dst.put_u8(self.kind().as_u8());
        // payload_length: 3 bytes big-endian (24-bit)
        dst.put_u8((payload_len >> 16) as u8);
        dst.put_u16(payload_len as u16);

        match self {
            PtyFrame::Data(data) => dst.extend_from_slice(data),
            PtyFrame::Resize(size) => {
                dst.put_u16(size.rows);
                dst.put_u16(size.cols);
            }
            PtyFrame::Exit { exit_code } => {
                if let Some(code) = exit_code {
                    dst.put_i32(*code);
                }
            }
        }

        Ok(())
    }

    /// Decode a frame from a byte buffer
    ///
    /// Returns None if the buffer does not yet hold a complete frame; in that
    /// case nothing is consumed.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the kind first to validate
        let kind = PtyFrameKind::from_u8(src[0]).ok_or(ProtocolError::UnknownFrameKind(src[0]))?;
        let payload_len = ((src[1] as usize) << 16) | ((src[2] as usize) << 8) | src[3] as usize;

        if src.len() < HEADER_SIZE + payload_len {
            src.reserve(HEADER_SIZE + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let mut payload = src.split_to(payload_len).freeze();

        let frame = match kind {
            PtyFrameKind::Data => PtyFrame::Data(payload),
            PtyFrameKind::Resize => {
                if payload.len() != 4 {
                    return Err(ProtocolError::MalformedFrame {
                        kind: "resize",
                        reason: format!("expected 4 payload bytes, got {}", payload.len()),
                    });
                }
                let rows = payload.get_u16();
                let cols = payload.get_u16();
                PtyFrame::Resize(TerminalSize::new(rows, cols))
            }
            PtyFrameKind::Exit => match payload.len() {
                0 => PtyFrame::Exit { exit_code: None },
                4 => PtyFrame::Exit {
                    exit_code: Some(payload.get_i32()),
                },
                n => {
                    return Err(ProtocolError::MalformedFrame {
                        kind: "exit",
                        reason: format!("expected 0 or 4 payload bytes, got {}", n),
                    })
                }
            },
        };

        Ok(Some(frame))
    }
}
