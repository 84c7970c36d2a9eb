//! Agent sessions held by the listener
//!
//! A [`Session`] owns one authenticated agent connection. Its read half lives
//! in a dedicated worker task ([`worker`]) that classifies inbound items and
//! routes them: response frames to the session's inbox, raw terminal bytes to
//! the active [`PtyBridge`]. The write half sits behind an async mutex so that
//! commands, PTY input and PTY control frames never interleave on the wire.
//!
//! Exchanges are serialized by a second lock held for the whole
//! command/response round trip (see [`Exchange`]).

mod exchange;
mod pty;
mod registry;
mod worker;

pub use exchange::{Exchange, Response};
pub use pty::PtyBridge;
pub use registry::SessionRegistry;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use tether_core::config::ListenerConfig;
use tether_core::time::current_time_millis;
use tether_core::{BoxedTransport, SessionError};
use tether_protocol::{ChannelCodec, Frame, Outbound, ProtocolError, PtyFrame, SessionMode};

/// Read half of a session's stream
pub type SessionReader = FramedRead<ReadHalf<BoxedTransport>, ChannelCodec>;

/// Write half of a session's stream
pub type SessionWriter = FramedWrite<WriteHalf<BoxedTransport>, ChannelCodec>;

/// Capacity of the raw terminal output channel
const PTY_CHANNEL_CAPACITY: usize = 256;

/// Timeouts applied to exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeSettings {
    /// Bound on writing one command or frame
    pub command_timeout: Duration,
    /// Bound on collecting one complete response
    pub response_timeout: Duration,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self::from(&ListenerConfig::default())
    }
}

impl From<&ListenerConfig> for ExchangeSettings {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            command_timeout: config.command_timeout,
            response_timeout: config.response_timeout,
        }
    }
}

/// Snapshot of a session for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Registry-assigned id, unique for the process lifetime
    pub id: u64,
    /// Remote address (registry key)
    pub addr: SocketAddr,
    /// Current mode
    pub mode: SessionMode,
    /// Admission time (Unix millis)
    pub admitted_at: u64,
    /// Last inbound frame or outbound command (Unix millis)
    pub last_activity: u64,
}

/// Response frames not yet claimed by an exchange
struct Inbox {
    rx: mpsc::UnboundedReceiver<Frame>,
    /// End markers still owed by exchanges that timed out
    stale_ends: u32,
}

#[derive(Default)]
struct ModeState {
    mode: SessionMode,
    /// Output channel registered by an operator awaiting the PTY marker
    pending_sink: Option<mpsc::Sender<Bytes>>,
    /// Output channel of the active bridge
    sink: Option<mpsc::Sender<Bytes>>,
    /// Our `Exit` frame has been written
    exit_sent: bool,
    last_exit_code: Option<i32>,
}

/// One active agent connection
pub struct Session {
    id: u64,
    addr: SocketAddr,
    settings: ExchangeSettings,
    writer: Mutex<SessionWriter>,
    exchange: Arc<Mutex<()>>,
    inbox: Mutex<Inbox>,
    mode: std::sync::Mutex<ModeState>,
    admitted_at: u64,
    last_activity: AtomicU64,
    closed: CancellationToken,
}

impl Session {
    fn new(
        id: u64,
        addr: SocketAddr,
        writer: SessionWriter,
        settings: ExchangeSettings,
    ) -> (Arc<Self>, mpsc::UnboundedSender<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = current_time_millis();

        let session = Arc::new(Self {
            id,
            addr,
            settings,
            writer: Mutex::new(writer),
            exchange: Arc::new(Mutex::new(())),
            inbox: Mutex::new(Inbox { rx, stale_ends: 0 }),
            mode: std::sync::Mutex::new(ModeState::default()),
            admitted_at: now,
            last_activity: AtomicU64::new(now),
            closed: CancellationToken::new(),
        });
        (session, tx)
    }

    /// Registry-assigned id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current mode
    pub fn mode(&self) -> SessionMode {
        self.mode_state().mode
    }

    /// Exit code reported by the agent when the last PTY session ended
    pub fn last_pty_exit_code(&self) -> Option<i32> {
        self.mode_state().last_exit_code
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Display snapshot
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            addr: self.addr,
            mode: self.mode(),
            admitted_at: self.admitted_at,
            last_activity: self.last_activity.load(Ordering::Relaxed),
        }
    }

    /// Close the session; the worker drops the connection
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    fn touch(&self) {
        self.last_activity
            .store(current_time_millis(), Ordering::Relaxed);
    }

    fn mode_state(&self) -> std::sync::MutexGuard<'_, ModeState> {
        self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mode_conflict(&self, mode: SessionMode) -> SessionError {
        SessionError::ModeConflict {
            addr: self.addr.to_string(),
            mode,
        }
    }

    fn ensure_command_mode(&self) -> Result<(), SessionError> {
        match self.mode() {
            SessionMode::Command => Ok(()),
            mode => Err(self.mode_conflict(mode)),
        }
    }

    /// Deadline for a write started now
    fn write_deadline(&self) -> Instant {
        Instant::now() + self.settings.command_timeout
    }

    fn write_timed_out(&self) -> SessionError {
        SessionError::Transport(format!(
            "write timed out after {:?}",
            self.settings.command_timeout
        ))
    }

    async fn send_with(
        &self,
        writer: &mut SessionWriter,
        item: Outbound,
        deadline: Instant,
    ) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::NotFound(self.addr.to_string()));
        }

        match tokio::time::timeout_at(deadline, writer.send(item)).await {
            Ok(Ok(())) => {
                self.touch();
                Ok(())
            }
            Ok(Err(ProtocolError::EmbeddedNewline)) => Err(SessionError::InvalidCommand(
                "command text must be a single line".to_string(),
            )),
            Ok(Err(e)) => Err(SessionError::Transport(e.to_string())),
            Err(_) => Err(self.write_timed_out()),
        }
    }

    /// Write one command line before `deadline`; only allowed in command mode
    async fn write_line(&self, line: String, deadline: Instant) -> Result<(), SessionError> {
        let mut writer = tokio::time::timeout_at(deadline, self.writer.lock())
            .await
            .map_err(|_| self.write_timed_out())?;
        self.ensure_command_mode()?;
        self.send_with(&mut writer, Outbound::Line(line), deadline).await
    }

    /// Write one PTY frame; only allowed while the bridge is active
    async fn write_pty(&self, frame: PtyFrame) -> Result<(), SessionError> {
        let deadline = self.write_deadline();
        let mut writer = self.writer.lock().await;
        {
            let state = self.mode_state();
            if state.mode != SessionMode::PtyActive || state.exit_sent {
                return Err(self.mode_conflict(state.mode));
            }
        }
        self.send_with(&mut writer, Outbound::Pty(frame), deadline).await
    }

    /// Register the output channel for a PTY request about to be sent
    fn prepare_pty(&self) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(PTY_CHANNEL_CAPACITY);
        self.mode_state().pending_sink = Some(tx);
        rx
    }

    fn cancel_pending_pty(&self) {
        self.mode_state().pending_sink = None;
    }

    /// The agent announced PTY mode; false if nobody asked for it
    fn activate_pty(&self) -> bool {
        let mut state = self.mode_state();
        match state.pending_sink.take() {
            Some(sink) => {
                state.mode = SessionMode::PtyActive;
                state.sink = Some(sink);
                state.exit_sent = false;
                state.last_exit_code = None;
                true
            }
            None => false,
        }
    }

    /// Drop PTY output channels so a waiting bridge sees the end of output
    fn detach_pty(&self) {
        let mut state = self.mode_state();
        state.pending_sink = None;
        state.sink = None;
    }

    fn pty_sink(&self) -> Option<mpsc::Sender<Bytes>> {
        self.mode_state().sink.clone()
    }

    /// Send our `Exit` frame unless it was already sent
    ///
    /// Returns whether a frame was written.
    pub(crate) async fn send_pty_exit(&self) -> Result<bool, SessionError> {
        let deadline = self.write_deadline();
        let mut writer = self.writer.lock().await;
        {
            let mut state = self.mode_state();
            if state.mode != SessionMode::PtyActive || state.exit_sent {
                return Ok(false);
            }
            state.exit_sent = true;
        }
        self.send_with(
            &mut writer,
            Outbound::Pty(PtyFrame::Exit { exit_code: None }),
            deadline,
        )
        .await?;
        Ok(true)
    }

    /// The agent's `Exit` arrived: answer it if needed, then leave PTY mode
    async fn finish_pty(&self, exit_code: Option<i32>) -> Result<(), SessionError> {
        self.send_pty_exit().await?;

        let mut state = self.mode_state();
        state.mode = SessionMode::Command;
        state.sink = None;
        state.exit_sent = false;
        state.last_exit_code = exit_code;
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("mode", &self.mode())
            .field("closed", &self.is_closed())
            .finish()
    }
}
