//! Shared listener state

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tether_core::config::ListenerConfig;

use crate::session::{ExchangeSettings, SessionRegistry};

/// State shared by the accept loop and the operator console
pub struct ListenerState {
    /// Validated configuration
    pub config: ListenerConfig,
    /// Active sessions
    pub registry: Arc<SessionRegistry>,
    /// Cancelled on shutdown
    pub cancel: CancellationToken,
}

impl ListenerState {
    /// Create state with an empty registry
    pub fn new(config: ListenerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(ExchangeSettings::from(&config)));
        Self {
            config,
            registry,
            cancel: CancellationToken::new(),
        }
    }

    /// Get the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Stop accepting agents and close every session
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(sessions = self.registry.len(), "Shutting down listener");
        }
        self.cancel.cancel();
        self.registry.close_all();
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
