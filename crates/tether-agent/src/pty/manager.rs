//! PTY process management
//!
//! Spawns the interactive shell on a pseudo-terminal using the portable-pty
//! crate. The agent runs at most one at a time.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_protocol::TerminalSize;

/// Allowed shell paths (prevents arbitrary command execution)
const ALLOWED_SHELLS_UNIX: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/fish",
    "/bin/dash",
    "/bin/ksh",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/bin/dash",
    "/usr/bin/ksh",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/bash",
    "/opt/homebrew/bin/zsh",
];

const ALLOWED_SHELLS_WINDOWS: &[&str] = &[
    "cmd.exe",
    "powershell.exe",
    "pwsh.exe",
    "C:\\Windows\\System32\\cmd.exe",
    "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe",
];

/// Read buffer for terminal output
const READ_BUFFER_SIZE: usize = 8192;

/// Validate that a shell path is allowed and exists
fn validate_shell_path(shell: &str) -> Result<String> {
    let allowed = if cfg!(windows) {
        ALLOWED_SHELLS_WINDOWS
    } else {
        ALLOWED_SHELLS_UNIX
    };

    let is_allowed = allowed.iter().any(|s| s.eq_ignore_ascii_case(shell));

    if !is_allowed {
        // Anything listed in /etc/shells is acceptable too
        #[cfg(unix)]
        if let Ok(shells) = std::fs::read_to_string("/etc/shells") {
            let listed = shells
                .lines()
                .map(str::trim)
                .any(|line| !line.starts_with('#') && line == shell);
            if listed && Path::new(shell).exists() {
                return Ok(shell.to_string());
            }
        }

        anyhow::bail!("Shell '{}' is not an allowed login shell", shell);
    }

    if !cfg!(windows) && !Path::new(shell).exists() {
        anyhow::bail!("Shell '{}' does not exist", shell);
    }

    Ok(shell.to_string())
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A shell running on a pseudo-terminal
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawn `shell` in `cwd` on a new terminal of the given size
    pub fn spawn(shell: &str, cwd: &Path, size: TerminalSize) -> Result<Self> {
        tracing::info!("Spawning PTY shell {} ({}x{})", shell, size.cols, size.rows);

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .context("Failed to open PTY")?;

        let shell_path =
            validate_shell_path(shell).with_context(|| format!("Invalid shell: {}", shell))?;

        let mut cmd = CommandBuilder::new(&shell_path);
        cmd.env("TERM", "xterm-256color");
        cmd.cwd(cwd);

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn shell: {}", shell_path))?;
        // The child holds its own handle to the slave side
        drop(pair.slave);

        let pid = child.process_id();
        tracing::debug!("Spawned shell process with PID: {:?}", pid);

        let writer = pair.master.take_writer().context("Failed to take PTY writer")?;

        Ok(Self {
            master: pair.master,
            child,
            writer,
            pid,
        })
    }

    /// Process id of the shell, if the platform reports one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Reader for terminal output
    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>> {
        self.master
            .try_clone_reader()
            .context("Failed to clone PTY reader")
    }

    /// Write operator input to the terminal
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).context("Failed to write to PTY")?;
        self.writer.flush().context("Failed to flush PTY")?;
        Ok(())
    }

    /// Resize the terminal
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        tracing::debug!("Resizing PTY to {}x{}", size.cols, size.rows);
        self.master
            .resize(pty_size(size))
            .context("Failed to resize PTY")
    }

    /// Exit code if the shell has already exited
    pub fn try_wait(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code() as i32),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to check shell status: {}", e);
                None
            }
        }
    }

    /// Kill the shell if it is still running and collect its exit code
    pub fn close(mut self) -> Option<i32> {
        if let Some(code) = self.try_wait() {
            return Some(code);
        }

        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(_) => None,
        }
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess").field("pid", &self.pid).finish()
    }
}

/// Spawn a blocking task that forwards terminal output to `tx`
///
/// The task ends at EOF (the shell exited), when `tx` is closed, or when the
/// token is cancelled; the token is checked between reads.
pub fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("PTY reader EOF");
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // EIO is how Linux reports the shell going away
                    if cancel.is_cancelled()
                        || e.kind() == std::io::ErrorKind::Other
                        || e.kind() == std::io::ErrorKind::BrokenPipe
                    {
                        tracing::debug!("PTY reader closed: {}", e);
                    } else {
                        tracing::error!("PTY read error: {}", e);
                    }
                    break;
                }
            }
        }
    })
}
