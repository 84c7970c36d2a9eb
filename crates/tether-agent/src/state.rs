//! Agent connection state

use std::fmt;
use std::time::Duration;

use tether_core::AuthContext;

/// Lifecycle of the agent's single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection; sleeping or about to dial
    #[default]
    Disconnected,
    /// Dialing and negotiating TLS
    Connecting,
    /// Running the handshake
    Authenticating,
    /// Waiting for a command
    Ready,
    /// Running a command
    Executing,
    /// Relaying an interactive shell
    PtyActive,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Executing => "executing",
            ConnectionState::PtyActive => "pty",
        };
        f.write_str(name)
    }
}

/// State owned by the agent's reconnect loop
///
/// There is one per process. The retry count and the backoff only grow.
#[derive(Debug)]
pub struct AgentState {
    target: String,
    auth: AuthContext,
    retries: u32,
    backoff: Duration,
    state: ConnectionState,
}

impl AgentState {
    /// Create state for dialing `target`
    pub fn new(target: impl Into<String>, auth: AuthContext, initial_backoff: Duration) -> Self {
        Self {
            target: target.into(),
            auth,
            retries: 0,
            backoff: initial_backoff,
            state: ConnectionState::Disconnected,
        }
    }

    /// Listener address
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Authentication material
    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Failed connections so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay before the next attempt
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::trace!(from = %self.state, to = %next, "Agent state change");
            self.state = next;
        }
    }

    /// Count a failure and remember the delay that follows it
    pub(crate) fn record_failure(&mut self, next_backoff: Duration) {
        self.retries += 1;
        self.backoff = next_backoff;
        self.set_state(ConnectionState::Disconnected);
    }
}
