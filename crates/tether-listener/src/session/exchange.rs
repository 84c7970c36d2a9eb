//! Command/response exchange
//!
//! One command is in flight per session. An [`Exchange`] holds the session's
//! exchange lock for as long as it lives, so a transfer can run a whole
//! sequence of commands without another caller slipping in between.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

use tether_core::config::MAX_DURATION;
use tether_core::SessionError;
use tether_protocol::{AgentReply, Command, Frame};

use super::Session;

/// Exclusive right to run exchanges on one session
pub struct Exchange {
    session: Arc<Session>,
    _guard: OwnedMutexGuard<()>,
}

impl Exchange {
    /// Wait for the session's exchange lock
    ///
    /// Without a deadline this waits as long as the current holder needs;
    /// every step a holder takes is itself bounded by a timeout.
    pub(crate) async fn begin(
        session: Arc<Session>,
        deadline: Option<Instant>,
    ) -> Result<Self, SessionError> {
        session.ensure_command_mode()?;
        let lock = Arc::clone(&session.exchange).lock_owned();
        let guard = match deadline {
            Some(deadline) => {
                let started = Instant::now();
                tokio::time::timeout_at(deadline, lock)
                    .await
                    .map_err(|_| SessionError::Busy {
                        addr: session.addr().to_string(),
                        waited: started.elapsed(),
                    })?
            }
            None => lock.await,
        };

        // The mode or the connection may have changed while we waited
        session.ensure_command_mode()?;
        if session.is_closed() {
            return Err(SessionError::NotFound(session.addr().to_string()));
        }

        Ok(Self {
            session,
            _guard: guard,
        })
    }

    /// The session this exchange runs on
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Send one command line
    ///
    /// Leftovers from an earlier exchange that timed out are discarded first,
    /// so they cannot be mistaken for this command's response.
    pub async fn send(&self, command: &Command) -> Result<(), SessionError> {
        self.send_until(command, self.session.write_deadline()).await
    }

    /// Send one command line, giving up on the write at `deadline`
    pub(crate) async fn send_until(
        &self,
        command: &Command,
        deadline: Instant,
    ) -> Result<(), SessionError> {
        self.drain_stale().await;
        self.session.write_line(command.to_line(), deadline).await
    }

    /// Collect and assemble one response
    pub async fn receive(&self, timeout: Duration) -> Result<Response, SessionError> {
        let frames = self.receive_frames(timeout).await?;
        Ok(Response::from_frames(self.session.addr(), frames))
    }

    /// Send a command and collect its response with the configured timeout
    pub async fn execute(&self, command: &Command) -> Result<Response, SessionError> {
        self.send(command).await?;
        self.receive(self.session.settings.response_timeout).await
    }

    /// Collect raw frames up to the end marker (exclusive) or the PTY marker
    /// (inclusive)
    pub(crate) async fn receive_frames(&self, timeout: Duration) -> Result<Vec<Frame>, SessionError> {
        let addr = self.session.addr();
        let mut inbox = self.session.inbox.lock().await;
        let deadline = Instant::now() + timeout.min(MAX_DURATION);
        let mut frames = Vec::new();

        loop {
            let frame = match tokio::time::timeout_at(deadline, inbox.rx.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(SessionError::NotFound(addr.to_string())),
                Err(_) => {
                    // This response's end marker may still arrive
                    inbox.stale_ends += 1;
                    tracing::debug!(%addr, received = frames.len(), "Response timed out");
                    return Err(SessionError::ResponseTimeout(timeout));
                }
            };

            match frame {
                Frame::End if inbox.stale_ends > 0 => {
                    inbox.stale_ends -= 1;
                    tracing::debug!(%addr, discarded = frames.len(), "Discarded late response");
                    frames.clear();
                }
                Frame::End => return Ok(frames),
                Frame::PtyStart => {
                    frames.push(Frame::PtyStart);
                    return Ok(frames);
                }
                frame => frames.push(frame),
            }
        }
    }

    async fn drain_stale(&self) {
        let addr = self.session.addr();
        let mut inbox = self.session.inbox.lock().await;
        let mut discarded = 0usize;

        loop {
            match inbox.rx.try_recv() {
                Ok(Frame::End) if inbox.stale_ends > 0 => inbox.stale_ends -= 1,
                Ok(_) => discarded += 1,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        if discarded > 0 {
            tracing::debug!(%addr, discarded, "Discarded stale frames");
        }
    }
}

/// An assembled response
///
/// All command output travels in `Data` frames. Plain lines are the agent's
/// status words (`OK`, `ACK n`, `DONE n`, `ERR ...`, `PONG`) and are kept
/// apart from the output; they never appear in [`output`](Self::output).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    output: Vec<u8>,
    status: Vec<String>,
    corrupt_frames: usize,
}

impl Response {
    /// Assemble frames: `Data` payloads are decoded and concatenated into the
    /// output, plain lines go to the status lines only
    ///
    /// A `Data` frame that fails to decode is logged and skipped; the rest of
    /// the response is kept.
    pub fn from_frames(addr: SocketAddr, frames: Vec<Frame>) -> Self {
        let mut response = Self::default();

        for frame in frames {
            match frame {
                Frame::Data(encoded) => match tether_protocol::wire::decode(&encoded) {
                    Ok(payload) => response.output.extend_from_slice(&payload),
                    Err(e) => {
                        tracing::warn!(%addr, "Skipping corrupt data frame: {}", e);
                        response.corrupt_frames += 1;
                    }
                },
                Frame::Plain(line) => response.status.push(line),
                Frame::End | Frame::PtyStart => {}
            }
        }

        response
    }

    /// Concatenated output bytes
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Output as text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// Consume the response, keeping the output
    pub fn into_output(self) -> Vec<u8> {
        self.output
    }

    /// Plain status lines in arrival order
    pub fn status_lines(&self) -> &[String] {
        &self.status
    }

    /// The last status line, parsed
    pub fn reply(&self) -> Option<AgentReply> {
        self.status.last().and_then(|line| AgentReply::parse(line))
    }

    /// Number of `Data` frames that failed to decode
    pub fn corrupt_frames(&self) -> usize {
        self.corrupt_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_data_frames_concatenate() {
        let response = Response::from_frames(
            addr(),
            vec![Frame::data(b"uid=0(root) "), Frame::data(b"gid=0(root)\n")],
        );
        assert_eq!(response.text(), "uid=0(root) gid=0(root)\n");
        assert!(response.status_lines().is_empty());
        assert_eq!(response.reply(), None);
    }

    #[test]
    fn test_corrupt_frame_is_skipped() {
        let response = Response::from_frames(
            addr(),
            vec![
                Frame::data(b"first "),
                Frame::Data("zz-not-hex".to_string()),
                Frame::data(b"third"),
            ],
        );
        assert_eq!(response.text(), "first third");
        assert_eq!(response.corrupt_frames(), 1);
    }

    #[test]
    fn test_status_lines() {
        let response = Response::from_frames(
            addr(),
            vec![
                Frame::Plain("ERR no such file".to_string()),
                Frame::End,
            ],
        );
        assert!(response.output().is_empty());
        assert_eq!(
            response.reply(),
            Some(AgentReply::Err("no such file".to_string()))
        );
    }

    #[test]
    fn test_plain_lines_stay_out_of_output() {
        let response = Response::from_frames(
            addr(),
            vec![
                Frame::Plain("OK".to_string()),
                Frame::data(b"total 0\n"),
                Frame::Plain("ACK 3".to_string()),
            ],
        );
        assert_eq!(response.text(), "total 0\n");
        assert_eq!(response.status_lines(), ["OK".to_string(), "ACK 3".to_string()]);
        assert_eq!(response.reply(), Some(AgentReply::Ack(3)));
    }
}
