//! TLS listener
//!
//! Accepts incoming connections and spawns a handshake task for each agent.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::server::handler::ConnectionHandler;

/// TLS server that listens for incoming agent connections
pub struct TlsServer {
    /// TLS acceptor built from the listener certificate
    acceptor: TlsAcceptor,
    /// Handshake and admission
    handler: Arc<ConnectionHandler>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl TlsServer {
    /// Create a new TLS server
    pub fn new(
        tls_config: Arc<ServerConfig>,
        handler: Arc<ConnectionHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            acceptor: TlsAcceptor::from(tls_config),
            handler,
            cancel,
        }
    }

    /// Bind and run until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Run on an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Listening for agents on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Listener shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a new incoming connection
    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::debug!("New connection from {}", peer_addr);

        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let acceptor = self.acceptor.clone();
        let handler = Arc::clone(&self.handler);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let admit = async {
                let tls = tokio::time::timeout(handler.handshake_timeout(), acceptor.accept(socket))
                    .await
                    .map_err(|_| "TLS handshake timed out".to_string())?
                    .map_err(|e| format!("TLS handshake failed: {}", e))?;
                handler
                    .handle(tls, peer_addr)
                    .await
                    .map_err(|e| format!("Authentication failed: {}", e))
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Connection setup cancelled for {}", peer_addr);
                    return;
                }
                result = admit => result,
            };

            if let Err(reason) = result {
                tracing::warn!(%peer_addr, "Rejected connection: {}", reason);
            }
        });
    }
}
