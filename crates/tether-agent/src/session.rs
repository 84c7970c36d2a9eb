//! Agent side of a session
//!
//! After the handshake the agent reads one command line at a time, runs it to
//! completion and answers with zero or more frames followed by the end
//! marker. `PTY` is the exception: it is answered with the PTY marker, after
//! which both directions carry binary frames until each side has sent and
//! received `Exit`.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use tether_core::config::AgentConfig;
use tether_core::{agent_handshake, AuthError, BoxedTransport, Connected};
use tether_protocol::{
    AgentReply, ChannelCodec, ChannelMode, Command, Frame, Inbound, Outbound, ProtocolError,
    PtyFrame, TerminalSize, DATA_PREFIX,
};

use crate::error::AgentError;
use crate::pty::{spawn_reader, PtyProcess};
use crate::state::{AgentState, ConnectionState};

/// Read half of the agent's stream
pub type AgentReader = FramedRead<ReadHalf<BoxedTransport>, ChannelCodec>;

/// Write half of the agent's stream
pub type AgentWriter = FramedWrite<WriteHalf<BoxedTransport>, ChannelCodec>;

/// Largest slice of command output carried by one `Data` frame
const OUTPUT_FRAME_SIZE: usize = 256 * 1024;

/// Capacity of the terminal output channel
const PTY_CHANNEL_CAPACITY: usize = 256;

/// Settings the command loop needs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on the handshake
    pub handshake_timeout: Duration,
    /// Kill `EXEC` children after this long
    pub exec_timeout: Option<Duration>,
    /// Shell for `PTY`
    pub shell: String,
    /// Ceiling for a single protocol line
    pub max_line_length: usize,
    /// Largest file `DOWNLOAD` will send
    pub max_download_size: u64,
}

impl From<&AgentConfig> for SessionConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            handshake_timeout: config.connect_timeout,
            exec_timeout: config.exec_timeout,
            shell: config.pty_shell(),
            max_line_length: config.max_line_length,
            max_download_size: config.max_download_size,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

/// Authenticate on a fresh connection and serve commands until it ends
///
/// Returns `Ok` when the listener closes the connection cleanly.
pub async fn serve(
    connected: Connected,
    config: &SessionConfig,
    state: &mut AgentState,
) -> Result<(), AgentError> {
    state.set_state(ConnectionState::Authenticating);

    let Connected {
        transport,
        peer_certificate,
    } = connected;
    let (read_half, write_half) = tokio::io::split(transport);
    let mut reader = FramedRead::new(
        read_half,
        ChannelCodec::with_max_line_length(config.max_line_length),
    );
    let mut writer = FramedWrite::new(
        write_half,
        ChannelCodec::with_max_line_length(config.max_line_length),
    );

    let handshake = agent_handshake(
        &mut reader,
        &mut writer,
        state.auth(),
        peer_certificate.as_deref(),
    );
    tokio::time::timeout(config.handshake_timeout, handshake)
        .await
        .map_err(|_| AuthError::Timeout)??;
    tracing::info!(listener = state.target(), "Authenticated to listener");

    CommandLoop::new(reader, writer, config.clone())
        .run(state)
        .await
}

/// Upload in progress
struct Upload {
    path: PathBuf,
    file: tokio::fs::File,
    next_index: u64,
    written: u64,
}

enum PtyEvent {
    Inbound(Option<Result<Inbound, ProtocolError>>),
    Output(Option<Bytes>),
}

fn reply(reply: AgentReply) -> Vec<Frame> {
    vec![reply.into_frame()]
}

fn failure(message: impl fmt::Display) -> Vec<Frame> {
    reply(AgentReply::Err(message.to_string()))
}

/// Split output into `Data` frames; empty output yields none
fn data_frames(output: &[u8]) -> Vec<Frame> {
    output.chunks(OUTPUT_FRAME_SIZE).map(Frame::data).collect()
}

/// Target of a bare `cd`, which must change the agent's own directory
fn parse_cd(text: &str) -> Option<&str> {
    let rest = text.trim().strip_prefix("cd")?;
    if !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
        return None;
    }
    let rest = rest.trim();
    // Anything compound is left to the shell
    if rest.contains([';', '&', '|', '<', '>', '`', '$', '(', ')']) {
        return None;
    }
    Some(rest.trim_matches(|c| c == '"' || c == '\''))
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

#[cfg(unix)]
fn shell_command(text: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("/bin/sh");
    cmd.arg("-c").arg(text);
    cmd
}

#[cfg(windows)]
fn shell_command(text: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd.exe");
    cmd.arg("/C").arg(text);
    cmd
}

/// Sequential command executor for one connection
pub struct CommandLoop {
    reader: AgentReader,
    writer: AgentWriter,
    config: SessionConfig,
    cwd: PathBuf,
    upload: Option<Upload>,
}

impl CommandLoop {
    /// Create a loop over an authenticated stream
    pub fn new(reader: AgentReader, writer: AgentWriter, config: SessionConfig) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            reader,
            writer,
            config,
            cwd,
            upload: None,
        }
    }

    /// Start in a specific directory instead of the process's
    pub fn with_working_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Serve commands until the connection ends
    pub async fn run(mut self, state: &mut AgentState) -> Result<(), AgentError> {
        let result = self.serve(state).await;
        self.discard_upload().await;
        result
    }

    async fn serve(&mut self, state: &mut AgentState) -> Result<(), AgentError> {
        loop {
            state.set_state(ConnectionState::Ready);

            let line = match self.reader.next().await {
                Some(Ok(Inbound::Line(line))) => line,
                Some(Ok(Inbound::Pty(frame))) => {
                    tracing::warn!(kind = ?frame.kind(), "Ignoring PTY frame outside PTY mode");
                    continue;
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    tracing::info!("Listener closed the connection");
                    return Ok(());
                }
            };

            let command = match Command::parse(&line) {
                Ok(command) => command,
                Err(e) => {
                    tracing::warn!("Rejecting command: {}", e);
                    self.respond(failure(e)).await?;
                    continue;
                }
            };

            state.set_state(ConnectionState::Executing);
            match command {
                Command::Pty(size) => self.run_pty(size, state).await?,
                command => {
                    let frames = self.handle(command).await;
                    self.respond(frames).await?;
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) -> Vec<Frame> {
        match command {
            Command::Exec(text) => {
                tracing::debug!(command = %text, "Executing");
                data_frames(&self.exec(&text).await)
            }
            Command::Upload { path } => self.begin_upload(&path).await,
            Command::Chunk { index, payload } => self.write_chunk(index, &payload).await,
            Command::UploadEnd => self.finish_upload().await,
            Command::UploadAbort => {
                self.discard_upload().await;
                reply(AgentReply::Ok)
            }
            Command::Download { path } => self.download(&path).await,
            Command::Ping => reply(AgentReply::Pong),
            Command::Pty(_) => failure("PTY cannot be nested"),
        }
    }

    /// Write a complete response
    async fn respond(&mut self, frames: Vec<Frame>) -> Result<(), AgentError> {
        for frame in frames {
            self.writer.feed(Outbound::Line(frame.to_line())).await?;
        }
        self.writer.feed(Outbound::Line(Frame::End.to_line())).await?;
        self.writer.flush().await?;
        Ok(())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.cwd.join(path)
    }

    async fn exec(&mut self, text: &str) -> Vec<u8> {
        if let Some(dir) = parse_cd(text) {
            return self.change_dir(dir).await;
        }

        let mut cmd = shell_command(text);
        cmd.current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return format!("failed to run command: {}\n", e).into_bytes(),
        };

        // Dropping the wait on timeout kills the child
        let output = child.wait_with_output();
        let output = match self.config.exec_timeout {
            Some(limit) => match tokio::time::timeout(limit, output).await {
                Ok(output) => output,
                Err(_) => {
                    tracing::warn!(command = %text, "Command timed out");
                    return format!("command timed out after {:?}\n", limit).into_bytes();
                }
            },
            None => output.await,
        };

        match output {
            Ok(output) => {
                let mut bytes = output.stdout;
                bytes.extend_from_slice(&output.stderr);
                if bytes.is_empty() && !output.status.success() {
                    bytes = format!("command exited with {}\n", output.status).into_bytes();
                }
                bytes
            }
            Err(e) => format!("failed to collect output: {}\n", e).into_bytes(),
        }
    }

    async fn change_dir(&mut self, dir: &str) -> Vec<u8> {
        let target = match dir {
            "" | "~" => match home_dir() {
                Some(home) => home,
                None => return b"cd: HOME not set\n".to_vec(),
            },
            _ => match (dir.strip_prefix("~/"), home_dir()) {
                (Some(rest), Some(home)) => home.join(rest),
                _ => self.resolve(dir),
            },
        };

        let path = match tokio::fs::canonicalize(&target).await {
            Ok(path) => path,
            Err(e) => return format!("cd: {}: {}\n", dir, e).into_bytes(),
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                tracing::debug!(cwd = %path.display(), "Changed directory");
                self.cwd = path;
                Vec::new()
            }
            Ok(_) => format!("cd: {}: Not a directory\n", dir).into_bytes(),
            Err(e) => format!("cd: {}: {}\n", dir, e).into_bytes(),
        }
    }

    async fn begin_upload(&mut self, path: &str) -> Vec<Frame> {
        self.discard_upload().await;

        let path = self.resolve(path);
        match tokio::fs::File::create(&path).await {
            Ok(file) => {
                tracing::info!(path = %path.display(), "Receiving upload");
                self.upload = Some(Upload {
                    path,
                    file,
                    next_index: 0,
                    written: 0,
                });
                reply(AgentReply::Ok)
            }
            Err(e) => failure(format!("cannot create {}: {}", path.display(), e)),
        }
    }

    async fn write_chunk(&mut self, index: u64, payload: &str) -> Vec<Frame> {
        let Some(upload) = self.upload.as_mut() else {
            return failure("no upload in progress");
        };
        if index != upload.next_index {
            return failure(format!(
                "expected chunk {}, got {}",
                upload.next_index, index
            ));
        }

        let data = match tether_protocol::wire::decode(payload) {
            Ok(data) => data,
            Err(e) => return failure(format!("chunk {}: {}", index, e)),
        };
        if let Err(e) = upload.file.write_all(&data).await {
            return failure(format!("write to {} failed: {}", upload.path.display(), e));
        }

        upload.next_index += 1;
        upload.written += data.len() as u64;
        reply(AgentReply::Ack(index))
    }

    async fn finish_upload(&mut self) -> Vec<Frame> {
        let Some(mut upload) = self.upload.take() else {
            return failure("no upload in progress");
        };

        if let Err(e) = upload.file.flush().await {
            let message = format!("write to {} failed: {}", upload.path.display(), e);
            drop(upload.file);
            let _ = tokio::fs::remove_file(&upload.path).await;
            return failure(message);
        }

        tracing::info!(
            path = %upload.path.display(),
            bytes = upload.written,
            chunks = upload.next_index,
            "Upload complete"
        );
        reply(AgentReply::Done(upload.written))
    }

    /// Drop a partial upload and its file
    async fn discard_upload(&mut self) {
        if let Some(upload) = self.upload.take() {
            drop(upload.file);
            if let Err(e) = tokio::fs::remove_file(&upload.path).await {
                tracing::debug!("Failed to remove partial upload {}: {}", upload.path.display(), e);
            }
            tracing::info!(path = %upload.path.display(), "Upload discarded");
        }
    }

    async fn download(&mut self, path: &str) -> Vec<Frame> {
        let path = self.resolve(path);

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => return failure(format!("cannot read {}: {}", path.display(), e)),
        };
        if !meta.is_file() {
            return failure(format!("{} is not a regular file", path.display()));
        }
        if meta.len() > self.config.max_download_size {
            return failure(format!(
                "{} is {} bytes; the limit is {}",
                path.display(),
                meta.len(),
                self.config.max_download_size
            ));
        }

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => return failure(format!("cannot read {}: {}", path.display(), e)),
        };

        let frame = Frame::data(&data);
        if let Frame::Data(encoded) = &frame {
            if DATA_PREFIX.len() + encoded.len() >= self.config.max_line_length {
                return failure(format!(
                    "{} does not fit in one protocol line",
                    path.display()
                ));
            }
        }

        tracing::info!(path = %path.display(), bytes = data.len(), "Sending download");
        vec![frame]
    }

    async fn run_pty(
        &mut self,
        size: TerminalSize,
        state: &mut AgentState,
    ) -> Result<(), AgentError> {
        let spawned = PtyProcess::spawn(&self.config.shell, &self.cwd, size)
            .and_then(|pty| pty.take_reader().map(|reader| (pty, reader)));
        let (pty, reader) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!("Failed to start PTY: {:#}", e);
                return self.respond(failure(format!("{:#}", e))).await;
            }
        };

        self.writer
            .send(Outbound::Line(Frame::PtyStart.to_line()))
            .await?;
        self.reader.decoder_mut().set_mode(ChannelMode::Pty);
        state.set_state(ConnectionState::PtyActive);
        tracing::info!(pid = ?pty.pid(), rows = size.rows, cols = size.cols, "PTY session started");

        let (tx, mut output) = mpsc::channel(PTY_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        // Not awaited: a background job holding the terminal open would block it
        let _reader_task = spawn_reader(reader, tx, cancel.clone());

        let mut pty = Some(pty);
        let result = self.relay_pty(&mut pty, &mut output).await;

        cancel.cancel();
        drop(output);
        if let Some(pty) = pty.take() {
            pty.close();
        }

        self.reader.decoder_mut().set_mode(ChannelMode::Lines);
        tracing::info!("PTY session ended");
        result
    }

    /// Relay until this side has both sent and received `Exit`
    async fn relay_pty(
        &mut self,
        pty: &mut Option<PtyProcess>,
        output: &mut mpsc::Receiver<Bytes>,
    ) -> Result<(), AgentError> {
        let mut sent_exit = false;

        loop {
            let event = tokio::select! {
                inbound = self.reader.next() => PtyEvent::Inbound(inbound),
                chunk = output.recv(), if !sent_exit => PtyEvent::Output(chunk),
            };

            match event {
                PtyEvent::Inbound(Some(Ok(Inbound::Pty(PtyFrame::Data(data))))) => {
                    if let Some(pty) = pty.as_mut() {
                        if let Err(e) = pty.write(&data) {
                            tracing::debug!("Dropping terminal input: {:#}", e);
                        }
                    }
                }
                PtyEvent::Inbound(Some(Ok(Inbound::Pty(PtyFrame::Resize(size))))) => {
                    if let Some(pty) = pty.as_ref() {
                        if let Err(e) = pty.resize(size) {
                            tracing::debug!("{:#}", e);
                        }
                    }
                }
                PtyEvent::Inbound(Some(Ok(Inbound::Pty(PtyFrame::Exit { .. })))) => {
                    if !sent_exit {
                        let exit_code = pty.take().and_then(PtyProcess::close);
                        self.writer
                            .send(Outbound::Pty(PtyFrame::Exit { exit_code }))
                            .await?;
                    }
                    return Ok(());
                }
                PtyEvent::Inbound(Some(Ok(Inbound::Line(line)))) => {
                    tracing::warn!(len = line.len(), "Ignoring line in PTY mode");
                }
                PtyEvent::Inbound(Some(Err(e))) => return Err(e.into()),
                PtyEvent::Inbound(None) => {
                    return Err(AgentError::Transport(
                        "connection closed during PTY session".to_string(),
                    ))
                }
                PtyEvent::Output(Some(data)) => {
                    self.writer.send(Outbound::Pty(PtyFrame::Data(data))).await?;
                }
                PtyEvent::Output(None) => {
                    // Shell exited; wait for the listener's Exit
                    let exit_code = pty.take().and_then(PtyProcess::close);
                    tracing::debug!(?exit_code, "Shell exited");
                    self.writer
                        .send(Outbound::Pty(PtyFrame::Exit { exit_code }))
                        .await?;
                    sent_exit = true;
                }
            }
        }
    }
}

impl fmt::Debug for CommandLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandLoop")
            .field("cwd", &self.cwd)
            .field("uploading", &self.upload.as_ref().map(|u| u.path.as_path()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_bare_cd_is_recognised() {
        assert_eq!(parse_cd("cd /tmp"), Some("/tmp"));
        assert_eq!(parse_cd("  cd   src  "), Some("src"));
        assert_eq!(parse_cd("cd"), Some(""));
        assert_eq!(parse_cd("cd \"My Documents\""), Some("My Documents"));
    }

    #[test]
    fn test_compound_cd_goes_to_shell() {
        assert_eq!(parse_cd("cd /tmp && ls"), None);
        assert_eq!(parse_cd("cd $HOME"), None);
        assert_eq!(parse_cd("cdrecord -v"), None);
        assert_eq!(parse_cd("echo cd"), None);
    }

    #[test]
    fn test_output_is_split_into_frames() {
        assert!(data_frames(b"").is_empty());

        let output = vec![b'x'; OUTPUT_FRAME_SIZE + 1];
        let frames = data_frames(&output);
        assert_eq!(frames.len(), 2);

        let mut joined = Vec::new();
        for frame in &frames {
            joined.extend(frame.decode_payload().unwrap().unwrap());
        }
        assert_eq!(joined, output);
    }

    type ListenerReader = FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, ChannelCodec>;
    type ListenerWriter = FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, ChannelCodec>;

    /// Fake listener end of an authenticated session
    struct Peer {
        reader: ListenerReader,
        writer: ListenerWriter,
        task: tokio::task::JoinHandle<Result<(), AgentError>>,
    }

    impl Peer {
        async fn start(cwd: &Path) -> Self {
            let (ours, theirs) = tokio::io::duplex(1 << 20);
            let (r, w) = tokio::io::split(ours);
            let reader = FramedRead::new(r, ChannelCodec::new());
            let writer = FramedWrite::new(w, ChannelCodec::new());

            let (ar, aw) = tokio::io::split(Box::new(theirs) as BoxedTransport);
            let agent = CommandLoop::new(
                FramedRead::new(ar, ChannelCodec::new()),
                FramedWrite::new(aw, ChannelCodec::new()),
                SessionConfig::default(),
            )
            .with_working_dir(cwd);
            let task = tokio::spawn(async move {
                let mut state = AgentState::new("test", Default::default(), Duration::from_secs(5));
                agent.run(&mut state).await
            });

            Self { reader, writer, task }
        }

        async fn call(&mut self, command: Command) -> Vec<Frame> {
            self.writer
                .send(Outbound::Line(command.to_line()))
                .await
                .unwrap();
            let mut frames = Vec::new();
            loop {
                match self.reader.next().await {
                    Some(Ok(Inbound::Line(line))) => match Frame::parse(&line) {
                        Frame::End => return frames,
                        frame => frames.push(frame),
                    },
                    other => panic!("unexpected item: {:?}", other),
                }
            }
        }

        async fn reply(&mut self, command: Command) -> AgentReply {
            let frames = self.call(command).await;
            match frames.as_slice() {
                [Frame::Plain(line)] => AgentReply::parse(line).unwrap(),
                other => panic!("expected one status line, got {:?}", other),
            }
        }
    }

    fn output(frames: &[Frame]) -> String {
        let mut bytes = Vec::new();
        for frame in frames {
            bytes.extend(frame.decode_payload().unwrap().unwrap());
        }
        String::from_utf8(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let dir = tempfile::tempdir().unwrap();
        let mut peer = Peer::start(dir.path()).await;
        assert_eq!(peer.reply(Command::Ping).await, AgentReply::Pong);
    }

    #[tokio::test]
    async fn test_clean_close_ends_loop() {
        let dir = tempfile::tempdir().unwrap();
        let peer = Peer::start(dir.path()).await;
        drop(peer.writer);
        drop(peer.reader);
        assert!(peer.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_upload_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut peer = Peer::start(dir.path()).await;

        let upload = Command::Upload {
            path: "copy.bin".to_string(),
        };
        assert_eq!(peer.reply(upload).await, AgentReply::Ok);
        assert_eq!(peer.reply(Command::chunk(0, b"hello ")).await, AgentReply::Ack(0));
        assert_eq!(peer.reply(Command::chunk(1, b"world")).await, AgentReply::Ack(1));
        assert_eq!(peer.reply(Command::UploadEnd).await, AgentReply::Done(11));

        let written = std::fs::read(dir.path().join("copy.bin")).unwrap();
        assert_eq!(written, b"hello world");
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut peer = Peer::start(dir.path()).await;

        let upload = Command::Upload {
            path: "partial.bin".to_string(),
        };
        assert_eq!(peer.reply(upload).await, AgentReply::Ok);
        assert!(matches!(
            peer.reply(Command::chunk(1, b"skipped")).await,
            AgentReply::Err(_)
        ));

        // The upload is still open at the expected index
        assert_eq!(peer.reply(Command::chunk(0, b"data")).await, AgentReply::Ack(0));
        assert_eq!(peer.reply(Command::UploadAbort).await, AgentReply::Ok);
        assert!(!dir.path().join("partial.bin").exists());
    }

    #[tokio::test]
    async fn test_chunk_without_upload() {
        let dir = tempfile::tempdir().unwrap();
        let mut peer = Peer::start(dir.path()).await;
        assert!(matches!(
            peer.reply(Command::chunk(0, b"x")).await,
            AgentReply::Err(_)
        ));
        assert!(matches!(peer.reply(Command::UploadEnd).await, AgentReply::Err(_)));
    }

    #[tokio::test]
    async fn test_dropped_connection_removes_partial_upload() {
        let dir = tempfile::tempdir().unwrap();
        let mut peer = Peer::start(dir.path()).await;

        let upload = Command::Upload {
            path: "orphan.bin".to_string(),
        };
        assert_eq!(peer.reply(upload).await, AgentReply::Ok);
        assert!(dir.path().join("orphan.bin").exists());

        drop(peer.writer);
        drop(peer.reader);
        peer.task.await.unwrap().unwrap();
        assert!(!dir.path().join("orphan.bin").exists());
    }

    #[tokio::test]
    async fn test_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"remote notes\n").unwrap();
        let mut peer = Peer::start(dir.path()).await;

        let frames = peer
            .call(Command::Download {
                path: "notes.txt".to_string(),
            })
            .await;
        assert_eq!(frames.len(), 1);
        assert_eq!(output(&frames), "remote notes\n");

        let missing = Command::Download {
            path: "missing.txt".to_string(),
        };
        assert!(matches!(peer.reply(missing).await, AgentReply::Err(_)));

        let directory = Command::Download {
            path: ".".to_string(),
        };
        assert!(matches!(peer.reply(directory).await, AgentReply::Err(_)));
    }

    #[tokio::test]
    async fn test_unknown_command_gets_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut peer = Peer::start(dir.path()).await;

        peer.writer
            .send(Outbound::Line("CHUNK not-a-number abc".to_string()))
            .await
            .unwrap();
        let mut saw_error = false;
        loop {
            match peer.reader.next().await {
                Some(Ok(Inbound::Line(line))) => match Frame::parse(&line) {
                    Frame::End => break,
                    Frame::Plain(line) => {
                        saw_error = matches!(AgentReply::parse(&line), Some(AgentReply::Err(_)))
                    }
                    other => panic!("unexpected frame {:?}", other),
                },
                other => panic!("unexpected item: {:?}", other),
            }
        }
        assert!(saw_error);

        // Still serving
        assert_eq!(peer.reply(Command::Ping).await, AgentReply::Pong);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_and_cd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("inner")).unwrap();
        std::fs::write(dir.path().join("inner/marker"), b"").unwrap();
        let mut peer = Peer::start(dir.path()).await;

        let frames = peer.call(Command::Exec("echo tether".to_string())).await;
        assert_eq!(output(&frames), "tether\n");

        // Silent commands produce no frames at all
        assert!(peer.call(Command::Exec("true".to_string())).await.is_empty());

        assert!(peer.call(Command::Exec("cd inner".to_string())).await.is_empty());
        let frames = peer.call(Command::Exec("ls".to_string())).await;
        assert_eq!(output(&frames), "marker\n");

        let frames = peer.call(Command::Exec("cd nowhere".to_string())).await;
        assert!(output(&frames).starts_with("cd: nowhere"));

        let frames = peer.call(Command::Exec("echo oops >&2".to_string())).await;
        assert_eq!(output(&frames), "oops\n");
    }
}
