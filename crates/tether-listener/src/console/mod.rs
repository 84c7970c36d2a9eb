//! Operator console
//!
//! Reads commands from stdin and dispatches them to the registry, the
//! transfer engine or the interactive shell. At most one session is attached
//! at a time; input that is not a console command is run on it.

mod command;
mod output;
mod shell;

pub use command::{help_text, ConsoleCommand};
pub use output::{format_sessions, print_error, print_info, print_success, print_warning};

use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use tether_core::{SessionError, TransferError};
use tether_protocol::{AgentReply, Command};

use crate::state::ListenerState;
use crate::transfer;

/// Line source for the console
///
/// A plain thread reads stdin one line per request. Nothing is read while the
/// console is not waiting for input, so keystrokes typed during `shell` reach
/// the raw terminal instead of being consumed here.
struct LineReader {
    requests: std::sync::mpsc::Sender<()>,
    lines: mpsc::Receiver<std::io::Result<Option<String>>>,
    pending: bool,
}

impl LineReader {
    fn spawn() -> std::io::Result<Self> {
        let (requests, request_rx) = std::sync::mpsc::channel::<()>();
        let (line_tx, lines) = mpsc::channel(1);

        std::thread::Builder::new()
            .name("console-stdin".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for () in request_rx {
                    let mut line = String::new();
                    let result = match stdin.lock().read_line(&mut line) {
                        Ok(0) => Ok(None),
                        Ok(_) => Ok(Some(line)),
                        Err(e) => Err(e),
                    };
                    if line_tx.blocking_send(result).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            requests,
            lines,
            pending: false,
        })
    }

    /// Next input line, or None at end of input
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        if !self.pending {
            if self.requests.send(()).is_err() {
                return Ok(None);
            }
            self.pending = true;
        }
        let line = self.lines.recv().await.unwrap_or(Ok(None));
        self.pending = false;
        line
    }
}

/// Interactive operator console
pub struct Console {
    state: Arc<ListenerState>,
    attached: Option<SocketAddr>,
}

impl Console {
    /// Create a console over shared listener state
    pub fn new(state: Arc<ListenerState>) -> Self {
        Self {
            state,
            attached: None,
        }
    }

    /// Currently attached session
    pub fn attached(&self) -> Option<SocketAddr> {
        self.attached
    }

    /// Read and dispatch commands until `exit`, end of input or shutdown
    pub async fn run(mut self) -> Result<()> {
        let mut input = LineReader::spawn().context("Failed to start console input")?;
        print_info("Type 'help' for commands");

        loop {
            self.check_attached();
            self.prompt();

            let line = tokio::select! {
                _ = self.state.cancel.cancelled() => break,
                line = input.next_line() => line.context("Failed to read console input")?,
            };
            let Some(line) = line else {
                tracing::debug!("Console input closed");
                break;
            };

            match ConsoleCommand::parse(&line, self.attached.is_some()) {
                Ok(Some(ConsoleCommand::Exit)) => break,
                Ok(Some(command)) => self.dispatch(command).await,
                Ok(None) => {}
                Err(usage) => print_error(&usage),
            }
        }

        self.state.shutdown();
        Ok(())
    }

    fn prompt(&self) {
        let mut stdout = std::io::stdout();
        let _ = match self.attached {
            Some(addr) => write!(stdout, "tether({})> ", addr),
            None => write!(stdout, "tether> "),
        };
        let _ = stdout.flush();
    }

    /// Detach if the attached session went away underneath us
    fn check_attached(&mut self) {
        if let Some(addr) = self.attached {
            if self.state.registry.get(&addr).is_err() {
                print_warning(&format!("Session {} closed", addr));
                self.attached = None;
            }
        }
    }

    /// Handle one parsed command (except `exit`, which ends the loop)
    pub async fn dispatch(&mut self, command: ConsoleCommand) {
        let registry = Arc::clone(&self.state.registry);

        match command {
            ConsoleCommand::List => println!("{}", format_sessions(&registry.sessions())),
            ConsoleCommand::Use(index) => match registry.resolve_index(&index) {
                Some(addr) => {
                    self.attached = Some(addr);
                    print_success(&format!("Attached to {}", addr));
                }
                None => print_error(&format!("No session at index {}", index)),
            },
            ConsoleCommand::Background => match self.attached.take() {
                Some(addr) => print_info(&format!("Backgrounded {}", addr)),
                None => print_warning("Not attached to a session"),
            },
            ConsoleCommand::Kill(index) => match registry.resolve_index(&index) {
                Some(addr) => {
                    registry.remove(&addr);
                    if self.attached == Some(addr) {
                        self.attached = None;
                    }
                    print_success(&format!("Closed {}", addr));
                }
                None => print_error(&format!("No session at index {}", index)),
            },
            ConsoleCommand::Help => println!("{}", help_text(self.attached.is_some())),
            ConsoleCommand::Exit => self.state.shutdown(),
            command => {
                let Some(addr) = self.attached else {
                    print_warning("Not attached to a session");
                    return;
                };
                self.run_attached(addr, command).await;
            }
        }
    }

    async fn run_attached(&mut self, addr: SocketAddr, command: ConsoleCommand) {
        let registry = Arc::clone(&self.state.registry);

        match command {
            ConsoleCommand::Exec(text) => match registry.execute(&addr, &Command::Exec(text)).await {
                Ok(response) => {
                    let mut stdout = std::io::stdout();
                    let output = response.output();
                    let _ = stdout.write_all(output);
                    if !output.is_empty() && !output.ends_with(b"\n") {
                        let _ = stdout.write_all(b"\n");
                    }
                    let _ = stdout.flush();

                    if let Some(AgentReply::Err(message)) = response.reply() {
                        print_error(&message);
                    }
                    if response.corrupt_frames() > 0 {
                        print_warning(&format!(
                            "{} corrupt output chunk(s) skipped",
                            response.corrupt_frames()
                        ));
                    }
                }
                Err(e) => self.session_failed(addr, e),
            },
            ConsoleCommand::Upload { local, remote } => {
                let chunk_size = self.state.config.transfer_chunk_size;
                match transfer::upload(&registry, &addr, &local, &remote, chunk_size).await {
                    Ok(bytes) => print_success(&format!("Uploaded {} bytes to {}", bytes, remote)),
                    Err(e) => self.transfer_failed(addr, e),
                }
            }
            ConsoleCommand::Download { remote, local } => {
                match transfer::download(&registry, &addr, &remote, &local).await {
                    Ok(bytes) => print_success(&format!(
                        "Downloaded {} bytes to {}",
                        bytes,
                        local.display()
                    )),
                    Err(e) => self.transfer_failed(addr, e),
                }
            }
            ConsoleCommand::Shell => match shell::run(&registry, addr).await {
                Ok(Some(code)) => print_info(&format!("Shell exited with status {}", code)),
                Ok(None) => print_info("Left interactive shell"),
                Err(e) => match e.downcast::<SessionError>() {
                    Ok(e) => self.session_failed(addr, e),
                    Err(e) => print_error(&format!("Shell failed: {:#}", e)),
                },
            },
            ConsoleCommand::Ping => match registry.ping(&addr).await {
                Ok(rtt) => print_success(&format!("Reply from {} in {:?}", addr, rtt)),
                Err(e) => self.session_failed(addr, e),
            },
            _ => {}
        }
    }

    fn session_failed(&mut self, addr: SocketAddr, error: SessionError) {
        print_error(&error.to_string());
        if error.is_fatal() {
            self.drop_session(addr);
        } else if matches!(error, SessionError::NotFound(_)) {
            self.attached = None;
        }
    }

    fn transfer_failed(&mut self, addr: SocketAddr, error: TransferError) {
        print_error(&error.to_string());
        if error.is_session_fatal() {
            self.drop_session(addr);
        }
    }

    fn drop_session(&mut self, addr: SocketAddr) {
        tracing::warn!(%addr, "Dropping session after transport failure");
        self.state.registry.remove(&addr);
        if self.attached == Some(addr) {
            self.attached = None;
        }
        print_warning(&format!("Session {} dropped", addr));
    }
}
