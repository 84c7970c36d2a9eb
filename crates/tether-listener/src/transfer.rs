//! File transfer over the command/response exchange
//!
//! Uploads are chunked: every chunk is its own `CHUNK` command and must be
//! acknowledged before the next one is read from disk. Downloads are a
//! single `DOWNLOAD` command answered by exactly one `Data` frame.

use std::net::SocketAddr;
use std::path::Path;

use tokio::io::AsyncReadExt;

use tether_core::{SessionError, TransferError};
use tether_protocol::{AgentReply, Command, Frame};

use crate::session::{Exchange, Response, SessionRegistry};

fn local_io(path: &Path) -> impl FnOnce(std::io::Error) -> TransferError + '_ {
    move |source| TransferError::LocalIo {
        path: path.to_path_buf(),
        source,
    }
}

fn expect_reply(
    response: &Response,
    expected: impl FnOnce(&AgentReply) -> bool,
    what: u64,
) -> Result<(), TransferError> {
    match response.reply() {
        Some(reply) if expected(&reply) => Ok(()),
        Some(AgentReply::Err(message)) => Err(TransferError::Remote(message)),
        _ => Err(TransferError::Acknowledgement {
            expected: what,
            got: response.status_lines().join(" | "),
        }),
    }
}

/// Run one step of an upload
///
/// A step that gets no answer at all is a transport failure.
async fn acknowledged(exchange: &Exchange, command: &Command) -> Result<Response, SessionError> {
    exchange.execute(command).await.map_err(no_response("upload"))
}

fn no_response(what: &'static str) -> impl FnOnce(SessionError) -> SessionError {
    move |e| match e {
        SessionError::ResponseTimeout(t) => {
            SessionError::Transport(format!("no response to {} within {:?}", what, t))
        }
        other => other,
    }
}

/// Read until `buf` is full or the file ends
async fn fill(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Upload a local file to `remote` on the agent
///
/// The local file is opened before any network activity; if that fails the
/// session is not touched. A step the agent never answers is session-fatal;
/// any other failure after `UPLOAD` was accepted sends `UPLOAD_ABORT`.
/// Returns the number of bytes the agent wrote.
pub async fn upload(
    registry: &SessionRegistry,
    addr: &SocketAddr,
    local: &Path,
    remote: &str,
    chunk_size: usize,
) -> Result<u64, TransferError> {
    let mut file = tokio::fs::File::open(local).await.map_err(local_io(local))?;
    let size = file.metadata().await.map_err(local_io(local))?.len();
    let chunk_size = chunk_size.max(1);

    let exchange = registry.exchange(addr).await?;
    tracing::info!(%addr, local = %local.display(), remote, size, "Starting upload");

    let response = acknowledged(
        &exchange,
        &Command::Upload {
            path: remote.to_string(),
        },
    )
    .await?;
    expect_reply(&response, |r| *r == AgentReply::Ok, 0)?;

    match send_chunks(&exchange, &mut file, local, chunk_size).await {
        Ok(chunks) => {
            let response = acknowledged(&exchange, &Command::UploadEnd).await?;
            match response.reply() {
                Some(AgentReply::Done(written)) => {
                    tracing::info!(%addr, remote, written, chunks, "Upload complete");
                    Ok(written)
                }
                Some(AgentReply::Err(message)) => Err(TransferError::Remote(message)),
                _ => Err(TransferError::Session(SessionError::UnexpectedResponse(
                    response.status_lines().join(" | "),
                ))),
            }
        }
        Err(e) => {
            if !e.is_session_fatal() {
                abort_upload(&exchange).await;
            }
            Err(e)
        }
    }
}

async fn send_chunks(
    exchange: &Exchange,
    file: &mut tokio::fs::File,
    local: &Path,
    chunk_size: usize,
) -> Result<u64, TransferError> {
    let mut buf = vec![0u8; chunk_size];
    let mut index = 0u64;

    loop {
        let n = fill(file, &mut buf).await.map_err(local_io(local))?;
        if n == 0 {
            return Ok(index);
        }

        let response = acknowledged(exchange, &Command::chunk(index, &buf[..n])).await?;
        expect_reply(&response, |r| *r == AgentReply::Ack(index), index)?;
        tracing::debug!(index, bytes = n, "Chunk acknowledged");

        index += 1;
        if n < chunk_size {
            return Ok(index);
        }
    }
}

async fn abort_upload(exchange: &Exchange) {
    if let Err(e) = exchange.execute(&Command::UploadAbort).await {
        tracing::debug!("Upload abort not acknowledged: {}", e);
    }
}

/// Download `remote` from the agent into a local file
///
/// Only a failure to send the request or to get any response back is
/// session-fatal. Agent-side errors, corrupt payloads and local write
/// failures leave the session usable.
pub async fn download(
    registry: &SessionRegistry,
    addr: &SocketAddr,
    remote: &str,
    local: &Path,
) -> Result<u64, TransferError> {
    let exchange = registry.exchange(addr).await?;
    let timeout = registry.settings().response_timeout;

    exchange
        .send(&Command::Download {
            path: remote.to_string(),
        })
        .await?;

    let frames = exchange
        .receive_frames(timeout)
        .await
        .map_err(no_response("download"))?;

    let mut payloads = Vec::new();
    let mut status = Vec::new();
    for frame in frames {
        match frame {
            Frame::Data(encoded) => payloads.push(encoded),
            Frame::Plain(line) => status.push(line),
            Frame::End | Frame::PtyStart => {}
        }
    }

    if let Some(AgentReply::Err(message)) = status.last().and_then(|l| AgentReply::parse(l)) {
        return Err(TransferError::Remote(message));
    }
    if payloads.len() != 1 {
        return Err(TransferError::Session(SessionError::UnexpectedResponse(
            format!("expected one data frame, got {}", payloads.len()),
        )));
    }

    let data = tether_protocol::wire::decode(&payloads[0])?;
    tokio::fs::write(local, &data).await.map_err(local_io(local))?;

    tracing::info!(%addr, remote, local = %local.display(), bytes = data.len(), "Download complete");
    Ok(data.len() as u64)
}
