//! Shared-secret challenge/response and certificate fingerprints.
//!
//! The listener issues a random nonce; the agent proves possession of the
//! shared secret by returning a keyed SHA-256 digest over the nonce:
//! - proof = SHA-256(AUTH_CTX || "agent" || secret || nonce)
//!
//! The secret itself never crosses the wire. Inputs are fixed length, so the
//! digest cannot be extended into a proof for another nonce.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Domain separation for the proof digest
pub const AUTH_CTX: &[u8] = b"tether-auth-v1";

/// Length of the listener's challenge nonce in bytes
pub const NONCE_LEN: usize = 32;

/// Length of a decoded shared secret in bytes
pub const SECRET_LEN: usize = 32;

/// Handshake line prefix
pub const HANDSHAKE_PREFIX: &str = "TETHER/1";

/// A decoded shared secret
pub type SharedSecret = [u8; SECRET_LEN];

/// Handshake lines exchanged right after TLS setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeLine {
    /// Listener admits the agent
    Ready,
    /// Listener demands a proof for this nonce
    Challenge([u8; NONCE_LEN]),
    /// Agent's proof for the last challenge
    Proof([u8; 32]),
    /// Listener rejected the proof
    Denied,
}

impl HandshakeLine {
    /// Render as a protocol line
    pub fn to_line(&self) -> String {
        match self {
            HandshakeLine::Ready => format!("{} READY", HANDSHAKE_PREFIX),
            HandshakeLine::Challenge(nonce) => {
                format!("{} CHALLENGE {}", HANDSHAKE_PREFIX, hex::encode(nonce))
            }
            HandshakeLine::Proof(proof) => {
                format!("{} PROOF {}", HANDSHAKE_PREFIX, hex::encode(proof))
            }
            HandshakeLine::Denied => format!("{} DENIED", HANDSHAKE_PREFIX),
        }
    }

    /// Parse a protocol line; None if it is not a well-formed handshake line
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix(HANDSHAKE_PREFIX)?.strip_prefix(' ')?;
        let (word, arg) = match rest.split_once(' ') {
            Some((word, arg)) => (word, Some(arg)),
            None => (rest, None),
        };

        match (word, arg) {
            ("READY", None) => Some(HandshakeLine::Ready),
            ("DENIED", None) => Some(HandshakeLine::Denied),
            ("CHALLENGE", Some(hex_nonce)) => decode_fixed(hex_nonce).map(HandshakeLine::Challenge),
            ("PROOF", Some(hex_proof)) => decode_fixed(hex_proof).map(HandshakeLine::Proof),
            _ => None,
        }
    }
}

fn decode_fixed<const N: usize>(text: &str) -> Option<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(text, &mut out).ok()?;
    Some(out)
}

/// Generate a random challenge nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Compute the agent's proof for a nonce.
pub fn compute_proof(secret: &SharedSecret, nonce: &[u8; NONCE_LEN]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(AUTH_CTX);
    hasher.update(b"agent");
    hasher.update(secret);
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Check a proof against the expected value in constant time.
pub fn verify_proof(secret: &SharedSecret, nonce: &[u8; NONCE_LEN], proof: &[u8; 32]) -> bool {
    let expected = compute_proof(secret, nonce);
    constant_time_eq(&expected, proof)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Compute the SHA-256 fingerprint of a DER-encoded certificate as lowercase hex.
pub fn certificate_fingerprint(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: SharedSecret = [7u8; SECRET_LEN];

    #[test]
    fn test_proof_verifies() {
        let nonce = generate_nonce();
        let proof = compute_proof(&SECRET, &nonce);
        assert!(verify_proof(&SECRET, &nonce, &proof));
    }

    #[test]
    fn test_proof_bound_to_secret_and_nonce() {
        let nonce = generate_nonce();
        let proof = compute_proof(&SECRET, &nonce);

        let other_secret = [8u8; SECRET_LEN];
        assert!(!verify_proof(&other_secret, &nonce, &proof));

        let mut other_nonce = nonce;
        other_nonce[0] ^= 0xFF;
        assert!(!verify_proof(&SECRET, &other_nonce, &proof));
    }

    #[test]
    fn test_nonces_differ() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn test_handshake_lines() {
        let nonce = [0xABu8; NONCE_LEN];
        for line in [
            HandshakeLine::Ready,
            HandshakeLine::Denied,
            HandshakeLine::Challenge(nonce),
            HandshakeLine::Proof([1u8; 32]),
        ] {
            assert_eq!(HandshakeLine::parse(&line.to_line()), Some(line));
        }
    }

    #[test]
    fn test_handshake_rejects_garbage() {
        assert_eq!(HandshakeLine::parse("READY"), None);
        assert_eq!(HandshakeLine::parse("TETHER/1 CHALLENGE abcd"), None);
        assert_eq!(HandshakeLine::parse("TETHER/1 PROOF"), None);
        assert_eq!(HandshakeLine::parse("TETHER/2 READY"), None);
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = certificate_fingerprint(b"test certificate data");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
