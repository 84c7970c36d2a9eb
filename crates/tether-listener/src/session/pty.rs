//! Interactive bridge
//!
//! While a [`PtyBridge`] is alive the session is in PTY mode: line framing is
//! suspended in both directions and raw terminal bytes flow through binary
//! frames. The bridge keeps the session's exchange lock, so no command can be
//! issued until the agent and the listener have both exchanged `Exit`.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use tether_core::SessionError;
use tether_protocol::{PtyFrame, TerminalSize};

use super::{Exchange, Session};

/// Largest payload written in one PTY data frame
const WRITE_CHUNK: usize = 32 * 1024;

/// Operator side of an active PTY session
pub struct PtyBridge {
    session: Arc<Session>,
    output: mpsc::Receiver<Bytes>,
    _exchange: Exchange,
    finished: bool,
}

impl PtyBridge {
    pub(super) fn new(exchange: Exchange, output: mpsc::Receiver<Bytes>) -> Self {
        Self {
            session: Arc::clone(exchange.session()),
            output,
            _exchange: exchange,
            finished: false,
        }
    }

    /// Remote address of the bridged session
    pub fn addr(&self) -> SocketAddr {
        self.session.addr()
    }

    /// Whether the session is still relaying terminal bytes
    pub fn is_active(&self) -> bool {
        self.session.mode().is_pty() && !self.session.is_closed()
    }

    /// Relay operator input to the agent's terminal
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        for chunk in data.chunks(WRITE_CHUNK) {
            self.session
                .write_pty(PtyFrame::Data(Bytes::copy_from_slice(chunk)))
                .await?;
        }
        Ok(())
    }

    /// Tell the agent the operator's terminal changed size
    pub async fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        self.session.write_pty(PtyFrame::Resize(size)).await
    }

    /// Next chunk of terminal output
    ///
    /// Returns None once the session has left PTY mode or closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.output.recv().await
    }

    /// End the interactive session and wait for the session to return to
    /// command mode
    ///
    /// Output still in flight is discarded. Returns the shell's exit code if
    /// the agent reported one.
    pub async fn exit(mut self) -> Result<Option<i32>, SessionError> {
        self.session.send_pty_exit().await?;

        let timeout = self.session.settings.response_timeout;
        let drained = tokio::time::timeout(timeout, async {
            while self.output.recv().await.is_some() {}
        })
        .await;
        self.finished = true;

        if drained.is_err() {
            return Err(SessionError::ResponseTimeout(timeout));
        }
        if self.session.is_closed() {
            return Err(SessionError::NotFound(self.addr().to_string()));
        }
        Ok(self.session.last_pty_exit_code())
    }
}

impl Drop for PtyBridge {
    fn drop(&mut self) {
        if self.finished || !self.session.mode().is_pty() {
            return;
        }

        // Abandoned without `exit`: still end the agent's shell
        let session = Arc::clone(&self.session);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = session.send_pty_exit().await {
                    tracing::warn!(addr = %session.addr(), "Failed to end PTY session: {}", e);
                }
            });
        }
    }
}

impl std::fmt::Debug for PtyBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyBridge")
            .field("addr", &self.session.addr())
            .field("finished", &self.finished)
            .finish()
    }
}
