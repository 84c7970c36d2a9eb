//! Operator input parsing

use std::path::PathBuf;

/// One line of operator input, classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `ls`: show the session table
    List,
    /// `use <index>`: attach to a session (1-based index, unresolved)
    Use(String),
    /// `bg` / `background`: detach without closing
    Background,
    /// `kill <index>`: close a session
    Kill(String),
    /// `help`
    Help,
    /// `exit`: stop the listener
    Exit,
    /// `upload <local> <remote>` (attached only)
    Upload { local: PathBuf, remote: String },
    /// `download <remote> <local>` (attached only)
    Download { remote: String, local: PathBuf },
    /// `shell` (attached only)
    Shell,
    /// `ping` (attached only)
    Ping,
    /// Anything else while attached is run on the agent
    Exec(String),
}

impl ConsoleCommand {
    /// Parse one input line
    ///
    /// Returns `Ok(None)` for blank input and `Err` with a usage message for
    /// input that cannot be acted on.
    pub fn parse(line: &str, attached: bool) -> Result<Option<Self>, String> {
        let line = line.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let mut words = trimmed.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        let command = match (verb, args.as_slice()) {
            ("ls", []) => ConsoleCommand::List,
            ("use", [index]) => ConsoleCommand::Use(index.to_string()),
            ("use", _) => return Err("usage: use <index>".into()),
            ("bg" | "background", []) => ConsoleCommand::Background,
            ("kill", [index]) => ConsoleCommand::Kill(index.to_string()),
            ("kill", _) => return Err("usage: kill <index>".into()),
            ("help", []) => ConsoleCommand::Help,
            ("exit", []) => ConsoleCommand::Exit,
            _ if !attached => {
                return Err(format!(
                    "Unknown command '{}' (not attached; type 'help')",
                    verb
                ))
            }
            ("upload", [local, remote]) => ConsoleCommand::Upload {
                local: PathBuf::from(local),
                remote: remote.to_string(),
            },
            ("upload", _) => return Err("usage: upload <local> <remote>".into()),
            ("download", [remote, local]) => ConsoleCommand::Download {
                remote: remote.to_string(),
                local: PathBuf::from(local),
            },
            ("download", _) => return Err("usage: download <remote> <local>".into()),
            ("shell", []) => ConsoleCommand::Shell,
            ("ping", []) => ConsoleCommand::Ping,
            // Forwarded as typed, apart from surrounding whitespace
            _ => ConsoleCommand::Exec(trimmed.to_string()),
        };

        Ok(Some(command))
    }
}

/// Help text for the current console state
pub fn help_text(attached: bool) -> &'static str {
    if attached {
        "\
  ls                         list sessions
  use <index>                attach to another session
  bg | background            detach, leaving the session open
  kill <index>               close a session
  upload <local> <remote>    copy a local file to the agent
  download <remote> <local>  copy a file from the agent
  shell                      interactive shell (Ctrl-] to leave)
  ping                       round-trip time to the agent
  exit                       stop the listener
  <anything else>            run on the agent"
    } else {
        "\
  ls                         list sessions
  use <index>                attach to a session
  kill <index>               close a session
  exit                       stop the listener"
    }
}
