//! Connection traits
//!
//! Everything above the transport works on a [`BoxedTransport`], so the same
//! session code drives a TLS socket in production and an in-memory duplex
//! pipe in tests.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ConnectionError;

/// A bidirectional byte stream carrying one session
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport
pub type BoxedTransport = Box<dyn Transport>;

/// Result of a successful connect
pub struct Connected {
    /// The established stream
    pub transport: BoxedTransport,
    /// DER-encoded end-entity certificate presented by the peer, if any
    pub peer_certificate: Option<Vec<u8>>,
}

impl Connected {
    /// Wrap a transport that carries no certificate (plain TCP, test doubles)
    pub fn plain<T: Transport>(transport: T) -> Self {
        Self {
            transport: Box::new(transport),
            peer_certificate: None,
        }
    }
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("peer_certificate", &self.peer_certificate.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

/// Abstraction over dialing the listener
#[async_trait]
pub trait Connector: Send + Sync {
    /// Address being dialed, for logging
    fn target(&self) -> &str;

    /// Establish one connection
    async fn connect(&self) -> Result<Connected, ConnectionError>;
}
