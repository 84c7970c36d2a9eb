//! Per-connection handshake and admission
//!
//! Works on any [`Transport`], so tests can drive it over an in-memory pipe
//! while the server feeds it TLS streams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::codec::{FramedRead, FramedWrite};

use tether_core::config::ListenerConfig;
use tether_core::{listener_handshake, AuthError, BoxedTransport, ConfigError, Transport};
use tether_protocol::auth::SharedSecret;
use tether_protocol::ChannelCodec;

use crate::session::{Session, SessionRegistry};

/// Authenticates new connections and admits them into the registry
pub struct ConnectionHandler {
    /// Registry sessions are admitted into
    registry: Arc<SessionRegistry>,
    /// Shared secret agents must prove, if authentication is enabled
    secret: Option<SharedSecret>,
    /// Bound on the whole handshake
    handshake_timeout: Duration,
    /// Line ceiling for the session codec
    max_line_length: usize,
}

impl ConnectionHandler {
    /// Create a new handler
    pub fn new(
        registry: Arc<SessionRegistry>,
        secret: Option<SharedSecret>,
        handshake_timeout: Duration,
        max_line_length: usize,
    ) -> Self {
        Self {
            registry,
            secret,
            handshake_timeout,
            max_line_length,
        }
    }

    /// Create a handler from validated listener configuration
    pub fn from_config(
        registry: Arc<SessionRegistry>,
        config: &ListenerConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            registry,
            config.shared_secret()?,
            config.command_timeout,
            config.max_line_length,
        ))
    }

    /// Bound applied to the handshake
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Run the handshake on a fresh transport and admit the session
    ///
    /// On failure nothing is registered and the transport is dropped.
    pub async fn handle<T: Transport>(
        &self,
        transport: T,
        peer_addr: SocketAddr,
    ) -> Result<Arc<Session>, AuthError> {
        let transport: BoxedTransport = Box::new(transport);
        let (read_half, write_half) = tokio::io::split(transport);
        let mut reader = FramedRead::new(
            read_half,
            ChannelCodec::with_max_line_length(self.max_line_length),
        );
        let mut writer = FramedWrite::new(
            write_half,
            ChannelCodec::with_max_line_length(self.max_line_length),
        );

        let handshake = listener_handshake(&mut reader, &mut writer, self.secret.as_ref());
        match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(AuthError::Timeout),
        }

        tracing::debug!(
            %peer_addr,
            secret = self.secret.is_some(),
            "Handshake complete"
        );
        Ok(self.registry.admit(peer_addr, reader, writer))
    }
}
