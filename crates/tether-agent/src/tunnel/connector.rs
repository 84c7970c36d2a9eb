//! TLS connector for the listener

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::rustls::ClientConfig;

use tether_core::config::AgentConfig;
use tether_core::{tls, ConfigError, Connected, ConnectionError, Connector};

/// Dials the listener over TLS
///
/// The certificate is not validated against a CA; the agent pins its
/// fingerprint during the handshake instead, so the peer's certificate is
/// handed back with the stream.
pub struct TlsConnector {
    /// Listener address (`host:port`)
    target: String,
    /// Rustls connector
    connector: tokio_rustls::TlsConnector,
    /// Bound on TCP connect plus TLS negotiation
    connect_timeout: Duration,
}

impl TlsConnector {
    /// Create a connector with an explicit client configuration
    pub fn new(
        target: impl Into<String>,
        tls_config: Arc<ClientConfig>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            target: target.into(),
            connector: tokio_rustls::TlsConnector::from(tls_config),
            connect_timeout,
        }
    }

    /// Create a connector from agent configuration
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.target.clone(),
            tls::client_config()?,
            config.connect_timeout,
        ))
    }

    async fn try_connect(&self) -> Result<Connected, ConnectionError> {
        let server_name = tls::server_name(&self.target)
            .ok_or_else(|| ConnectionError::InvalidTarget(self.target.clone()))?;

        tracing::debug!("Connecting to {}", self.target);
        let tcp = TcpStream::connect(&self.target)
            .await
            .map_err(|source| ConnectionError::Connect {
                target: self.target.clone(),
                source,
            })?;
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ConnectionError::Tls(e.to_string()))?;

        let peer_certificate = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|cert| cert.as_ref().to_vec());

        Ok(Connected {
            transport: Box::new(stream),
            peer_certificate,
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    fn target(&self) -> &str {
        &self.target
    }

    async fn connect(&self) -> Result<Connected, ConnectionError> {
        tokio::time::timeout(self.connect_timeout, self.try_connect())
            .await
            .map_err(|_| ConnectionError::Timeout(self.target.clone()))?
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("target", &self.target)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
