//! Session registry
//!
//! Maps remote addresses to sessions. Admission happens from the accept loop,
//! removal from the console or from a session's own worker when the
//! connection fails; lookups come from the console. Sessions are handed out
//! as `Arc`s: a caller holding a session that gets removed sees
//! `SessionError::NotFound` on its next exchange instead of using a dead
//! connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use tether_core::SessionError;
use tether_protocol::{AgentReply, Command, Frame, TerminalSize};

use super::{worker, Exchange, ExchangeSettings, PtyBridge, Response, Session, SessionInfo};
use super::{SessionReader, SessionWriter};

/// Registry of active sessions
pub struct SessionRegistry {
    /// Sessions indexed by remote address
    sessions: DashMap<SocketAddr, Arc<Session>>,
    /// Next session id to allocate
    next_id: AtomicU64,
    /// Timeouts for every session
    settings: ExchangeSettings,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new(settings: ExchangeSettings) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            settings,
        }
    }

    /// Exchange timeouts applied to sessions
    pub fn settings(&self) -> ExchangeSettings {
        self.settings
    }

    /// Admit an authenticated connection
    ///
    /// A session already registered under the same address is replaced and
    /// closed: an agent that reconnects after an unclean failure is the
    /// common case. Spawns the session's reader worker.
    pub fn admit(
        self: &Arc<Self>,
        addr: SocketAddr,
        reader: SessionReader,
        writer: SessionWriter,
    ) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (session, inbox) = Session::new(id, addr, writer, self.settings);

        if let Some(previous) = self.sessions.insert(addr, Arc::clone(&session)) {
            tracing::info!(%addr, old = previous.id(), new = id, "Replacing existing session");
            previous.close();
        } else {
            tracing::info!(%addr, id, "Session admitted");
        }

        tokio::spawn(worker::run(
            Arc::downgrade(self),
            Arc::clone(&session),
            reader,
            inbox,
        ));

        session
    }

    /// Sorted snapshot of registered addresses
    pub fn list(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self.sessions.iter().map(|r| *r.key()).collect();
        addrs.sort();
        addrs
    }

    /// Sorted snapshot of session details, in the same order as [`list`](Self::list)
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.iter().map(|r| r.info()).collect();
        infos.sort_by_key(|info| info.addr);
        infos
    }

    /// Resolve a 1-based index into the sorted list
    ///
    /// Non-numeric, zero and out-of-range indices resolve to None.
    pub fn resolve_index(&self, index: &str) -> Option<SocketAddr> {
        let index: usize = index.trim().parse().ok()?;
        let position = index.checked_sub(1)?;
        self.list().get(position).copied()
    }

    /// Look up a session
    pub fn get(&self, addr: &SocketAddr) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(addr)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| SessionError::NotFound(addr.to_string()))
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Unregister and close a session; returns whether it was registered
    pub fn remove(&self, addr: &SocketAddr) -> bool {
        match self.sessions.remove(addr) {
            Some((_, session)) => {
                tracing::info!(%addr, id = session.id(), "Session removed");
                session.close();
                true
            }
            None => false,
        }
    }

    /// Unregister a session whose worker has ended, unless it was already
    /// replaced by a newer one
    pub(super) fn forget(&self, session: &Session) {
        let addr = session.addr();
        if self
            .sessions
            .remove_if(&addr, |_, current| current.id() == session.id())
            .is_some()
        {
            tracing::info!(%addr, id = session.id(), "Session closed");
        }
    }

    /// Close every session
    pub fn close_all(&self) {
        for addr in self.list() {
            self.remove(&addr);
        }
    }

    /// Acquire exclusive use of a session for a sequence of exchanges
    pub async fn exchange(&self, addr: &SocketAddr) -> Result<Exchange, SessionError> {
        Exchange::begin(self.get(addr)?, None).await
    }

    /// Write one command line to a session
    ///
    /// Waiting for the exchange lock and the write share one command timeout.
    /// Running out while another exchange holds the lock is
    /// [`SessionError::Busy`]; running out during the write is a transport
    /// failure.
    pub async fn send_command(&self, addr: &SocketAddr, command: &Command) -> Result<(), SessionError> {
        let deadline = tokio::time::Instant::now() + self.settings.command_timeout;
        let exchange = Exchange::begin(self.get(addr)?, Some(deadline)).await?;
        exchange.send_until(command, deadline).await
    }

    /// Collect the next complete response from a session
    pub async fn get_response(&self, addr: &SocketAddr, timeout: Duration) -> Result<Response, SessionError> {
        self.exchange(addr).await?.receive(timeout).await
    }

    /// Send a command and collect its response under one exchange lock
    pub async fn execute(&self, addr: &SocketAddr, command: &Command) -> Result<Response, SessionError> {
        self.exchange(addr).await?.execute(command).await
    }

    /// Liveness probe; returns the round-trip time
    pub async fn ping(&self, addr: &SocketAddr) -> Result<Duration, SessionError> {
        let exchange = self.exchange(addr).await?;
        let started = Instant::now();
        let response = exchange.execute(&Command::Ping).await?;

        match response.reply() {
            Some(AgentReply::Pong) => Ok(started.elapsed()),
            _ => Err(SessionError::UnexpectedResponse(format!(
                "{:?}",
                response.status_lines()
            ))),
        }
    }

    /// Whether a session is currently relaying terminal bytes
    pub fn is_in_pty_mode(&self, addr: &SocketAddr) -> bool {
        self.sessions
            .get(addr)
            .map(|r| r.mode().is_pty())
            .unwrap_or(false)
    }

    /// Switch a session into PTY mode and return the operator's end of the relay
    pub async fn enter_pty_mode(
        &self,
        addr: &SocketAddr,
        size: TerminalSize,
    ) -> Result<PtyBridge, SessionError> {
        let exchange = self.exchange(addr).await?;
        let session = Arc::clone(exchange.session());
        let output = session.prepare_pty();

        let frames = async {
            exchange.send(&Command::Pty(size)).await?;
            exchange.receive_frames(self.settings.response_timeout).await
        }
        .await;

        match frames {
            Ok(frames) if frames.last() == Some(&Frame::PtyStart) => {
                tracing::info!(%addr, rows = size.rows, cols = size.cols, "PTY session started");
                Ok(PtyBridge::new(exchange, output))
            }
            Ok(frames) => {
                session.cancel_pending_pty();
                let response = Response::from_frames(*addr, frames);
                let reason = match response.reply() {
                    Some(AgentReply::Err(message)) => message,
                    _ => format!("{:?}", response.status_lines()),
                };
                Err(SessionError::UnexpectedResponse(reason))
            }
            Err(e) => {
                session.cancel_pending_pty();
                Err(e)
            }
        }
    }

    /// Ask the agent to end an active PTY session without holding its bridge
    ///
    /// Returns false if the session was not in PTY mode or the exit was
    /// already requested.
    pub async fn exit_pty_mode(&self, addr: &SocketAddr) -> Result<bool, SessionError> {
        self.get(addr)?.send_pty_exit().await
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(ExchangeSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry() {
        let registry = SessionRegistry::default();
        assert!(registry.list().is_empty());
        assert!(registry.sessions().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_bad_indices_resolve_to_none() {
        let registry = SessionRegistry::default();
        assert_eq!(registry.resolve_index("1"), None);
        assert_eq!(registry.resolve_index("0"), None);
        assert_eq!(registry.resolve_index("-1"), None);
        assert_eq!(registry.resolve_index("abc"), None);
        assert_eq!(registry.resolve_index(""), None);
        assert_eq!(registry.resolve_index("99999999999999999999999"), None);
    }

    #[test]
    fn test_unknown_address() {
        let registry = SessionRegistry::default();
        let addr: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        assert!(matches!(registry.get(&addr), Err(SessionError::NotFound(_))));
        assert!(!registry.is_in_pty_mode(&addr));
        // Removing twice is harmless
        assert!(!registry.remove(&addr));
        assert!(!registry.remove(&addr));
    }

    #[tokio::test]
    async fn test_exchange_on_unknown_address() {
        let registry = SessionRegistry::default();
        let addr: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        let result = registry.execute(&addr, &Command::Ping).await;
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }
}
