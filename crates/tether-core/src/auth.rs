//! Authentication handshake
//!
//! Runs once per connection, right after TLS setup and before any command
//! traffic. The agent first pins the listener certificate (if a fingerprint is
//! configured), then both sides run the shared-secret challenge/response (if
//! the listener requires one). Any failure aborts the connection; the listener
//! admits a session only after [`listener_handshake`] returns `Ok`.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use tether_protocol::auth::{
    certificate_fingerprint, compute_proof, generate_nonce, verify_proof, HandshakeLine,
    SharedSecret,
};
use tether_protocol::{ChannelCodec, Inbound, Outbound};

use crate::error::AuthError;

/// Authentication material for one connection attempt
#[derive(Clone, Default)]
pub struct AuthContext {
    secret: Option<SharedSecret>,
    fingerprint: Option<String>,
}

impl AuthContext {
    /// Create a context; `fingerprint` must already be normalised lowercase hex
    pub fn new(secret: Option<SharedSecret>, fingerprint: Option<String>) -> Self {
        Self {
            secret,
            fingerprint,
        }
    }

    /// Shared secret, if configured
    pub fn secret(&self) -> Option<&SharedSecret> {
        self.secret.as_ref()
    }

    /// Expected listener certificate fingerprint, if configured
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// Check the peer certificate against the pinned fingerprint
    pub fn verify_peer(&self, peer_certificate: Option<&[u8]>) -> Result<(), AuthError> {
        let Some(expected) = self.fingerprint.as_deref() else {
            return Ok(());
        };
        let cert = peer_certificate.ok_or(AuthError::NoPeerCertificate)?;
        let actual = certificate_fingerprint(cert);
        if actual != expected {
            return Err(AuthError::FingerprintMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("secret", &self.secret.map(|_| "<redacted>"))
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

async fn next_line<R>(reader: &mut FramedRead<R, ChannelCodec>) -> Result<HandshakeLine, AuthError>
where
    R: AsyncRead + Unpin,
{
    match reader.next().await {
        Some(Ok(Inbound::Line(line))) => {
            HandshakeLine::parse(&line).ok_or_else(|| AuthError::UnexpectedLine(line))
        }
        Some(Ok(Inbound::Pty(frame))) => Err(AuthError::UnexpectedLine(format!("{:?}", frame.kind()))),
        Some(Err(e)) => Err(AuthError::Transport(e.to_string())),
        None => Err(AuthError::Transport("connection closed".to_string())),
    }
}

async fn send_line<W>(
    writer: &mut FramedWrite<W, ChannelCodec>,
    line: HandshakeLine,
) -> Result<(), AuthError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .send(Outbound::Line(line.to_line()))
        .await
        .map_err(|e| AuthError::Transport(e.to_string()))
}

/// Listener side of the handshake
///
/// With no secret the agent is admitted immediately. Otherwise a fresh nonce
/// is issued and the agent's proof verified in constant time.
pub async fn listener_handshake<R, W>(
    reader: &mut FramedRead<R, ChannelCodec>,
    writer: &mut FramedWrite<W, ChannelCodec>,
    secret: Option<&SharedSecret>,
) -> Result<(), AuthError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(secret) = secret else {
        return send_line(writer, HandshakeLine::Ready).await;
    };

    let nonce = generate_nonce();
    send_line(writer, HandshakeLine::Challenge(nonce)).await?;

    match next_line(reader).await? {
        HandshakeLine::Proof(proof) if verify_proof(secret, &nonce, &proof) => {
            send_line(writer, HandshakeLine::Ready).await
        }
        HandshakeLine::Proof(_) => {
            // Best effort; the connection is dropped either way
            let _ = send_line(writer, HandshakeLine::Denied).await;
            Err(AuthError::InvalidProof)
        }
        other => Err(AuthError::UnexpectedLine(other.to_line())),
    }
}

/// Agent side of the handshake
pub async fn agent_handshake<R, W>(
    reader: &mut FramedRead<R, ChannelCodec>,
    writer: &mut FramedWrite<W, ChannelCodec>,
    auth: &AuthContext,
    peer_certificate: Option<&[u8]>,
) -> Result<(), AuthError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    auth.verify_peer(peer_certificate)?;

    match next_line(reader).await? {
        HandshakeLine::Ready => Ok(()),
        HandshakeLine::Challenge(nonce) => {
            let secret = auth.secret().ok_or(AuthError::SecretRequired)?;
            send_line(writer, HandshakeLine::Proof(compute_proof(secret, &nonce))).await?;

            match next_line(reader).await? {
                HandshakeLine::Ready => Ok(()),
                HandshakeLine::Denied => Err(AuthError::Denied),
                other => Err(AuthError::UnexpectedLine(other.to_line())),
            }
        }
        HandshakeLine::Denied => Err(AuthError::Denied),
        other => Err(AuthError::UnexpectedLine(other.to_line())),
    }
}
