//! Per-session reader task

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use tether_protocol::{ChannelMode, Frame, Inbound, PtyFrame};

use super::{Session, SessionReader, SessionRegistry};

/// Bound on the TLS close when the worker exits
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Own the read half until the connection ends or the session is closed
pub(super) async fn run(
    registry: Weak<SessionRegistry>,
    session: Arc<Session>,
    mut reader: SessionReader,
    inbox: mpsc::UnboundedSender<Frame>,
) {
    let addr = session.addr();

    loop {
        let item = tokio::select! {
            _ = session.closed.cancelled() => {
                tracing::debug!(%addr, id = session.id(), "Session closed locally");
                break;
            }
            item = reader.next() => item,
        };

        let item = match item {
            Some(Ok(item)) => item,
            Some(Err(e)) => {
                tracing::warn!(%addr, id = session.id(), "Session read failed: {}", e);
                break;
            }
            None => {
                tracing::info!(%addr, id = session.id(), "Agent closed the connection");
                break;
            }
        };
        session.touch();

        match item {
            Inbound::Line(line) => {
                let frame = Frame::parse(&line);
                if frame == Frame::PtyStart {
                    if !session.activate_pty() {
                        tracing::warn!(%addr, "Agent entered PTY mode unprompted, dropping session");
                        break;
                    }
                    reader.decoder_mut().set_mode(ChannelMode::Pty);
                    tracing::debug!(%addr, "Session entered PTY mode");
                }
                // The receiver lives as long as the session
                let _ = inbox.send(frame);
            }
            Inbound::Pty(PtyFrame::Data(bytes)) => {
                let Some(sink) = session.pty_sink() else {
                    continue;
                };
                tokio::select! {
                    _ = session.closed.cancelled() => break,
                    // Bridge dropped: output is discarded until the exit completes
                    _ = sink.send(bytes) => {}
                }
            }
            Inbound::Pty(PtyFrame::Resize(size)) => {
                tracing::debug!(%addr, ?size, "Ignoring resize from agent");
            }
            Inbound::Pty(PtyFrame::Exit { exit_code }) => {
                if let Err(e) = session.finish_pty(exit_code).await {
                    tracing::warn!(%addr, "Failed to complete PTY exit: {}", e);
                    break;
                }
                reader.decoder_mut().set_mode(ChannelMode::Lines);
                tracing::debug!(%addr, ?exit_code, "Session left PTY mode");
            }
        }
    }

    session.close();
    session.detach_pty();
    if let Some(registry) = registry.upgrade() {
        registry.forget(&session);
    }

    // Dropping `inbox` wakes any exchange waiting on this session
    drop(inbox);
    drop(reader);

    let mut writer = session.writer.lock().await;
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.get_mut().shutdown()).await;
}
