//! Text-safe encoding for binary payloads
//!
//! Binary data (command output, file chunks) travels inside protocol lines as
//! gzip-compressed bytes rendered as lowercase hex. The transform is pure and
//! stateless; both sides use it.

use std::io::{Read, Write};

use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::ProtocolError;

/// Compress and hex-encode a payload
pub fn encode(data: &[u8]) -> String {
    // Compressing into a Vec cannot fail
    hex::encode(compress(data).unwrap_or_default())
}

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Hex-decode and decompress a payload produced by [`encode`]
///
/// Any malformed input (bad hex, truncated or corrupted gzip stream, trailing
/// garbage) is an error; partial output is never returned.
pub fn decode(text: &str) -> Result<Vec<u8>, ProtocolError> {
    if text.is_empty() {
        return Err(ProtocolError::Decode("empty payload".to_string()));
    }

    let compressed =
        hex::decode(text).map_err(|e| ProtocolError::Decode(format!("invalid hex: {}", e)))?;

    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Decode(format!("invalid gzip stream: {}", e)))?;

    let trailing = decoder.into_inner();
    if !trailing.is_empty() {
        return Err(ProtocolError::Decode(format!(
            "{} trailing bytes after gzip stream",
            trailing.len()
        )));
    }

    Ok(out)
}
