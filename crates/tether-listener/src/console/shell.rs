//! Raw terminal bridge for `shell`

use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use tokio::sync::mpsc;

use tether_protocol::TerminalSize;

use crate::session::SessionRegistry;

/// How long the event thread waits before rechecking its stop flag
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Leaves raw mode when dropped, including on early return
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> std::io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

enum Step {
    Terminal(Event),
    Output(Option<Bytes>),
}

fn terminal_size() -> TerminalSize {
    match size() {
        Ok((cols, rows)) => TerminalSize::new(rows, cols),
        Err(_) => TerminalSize::default(),
    }
}

/// Run an interactive shell on the session until Ctrl-] or the remote shell
/// exits. Returns the remote shell's exit code if one was reported.
pub async fn run(registry: &SessionRegistry, addr: SocketAddr) -> Result<Option<i32>> {
    let mut bridge = registry.enter_pty_mode(&addr, terminal_size()).await?;
    let raw = RawModeGuard::enable()?;

    let stop = Arc::new(AtomicBool::new(false));
    let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);
    let stop_flag = Arc::clone(&stop);
    let events = tokio::task::spawn_blocking(move || {
        while !stop_flag.load(Ordering::Relaxed) {
            if event::poll(EVENT_POLL_INTERVAL).unwrap_or(false) {
                if let Ok(evt) = event::read() {
                    if event_tx.blocking_send(evt).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut stdout = std::io::stdout();
    let outcome: Result<()> = async {
        loop {
            let step = tokio::select! {
                Some(evt) = event_rx.recv() => Step::Terminal(evt),
                output = bridge.recv() => Step::Output(output),
            };

            match step {
                Step::Terminal(Event::Key(KeyEvent {
                    code,
                    modifiers,
                    kind: KeyEventKind::Press | KeyEventKind::Repeat,
                    ..
                })) => {
                    // Ctrl+] to detach
                    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char(']') {
                        break;
                    }
                    let data = key_to_bytes(code, modifiers);
                    if !data.is_empty() {
                        bridge.write(&data).await?;
                    }
                }
                Step::Terminal(Event::Paste(text)) => bridge.write(text.as_bytes()).await?,
                Step::Terminal(Event::Resize(cols, rows)) => {
                    bridge.resize(TerminalSize::new(rows, cols)).await?
                }
                Step::Terminal(_) => {}
                Step::Output(Some(data)) => {
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                // Remote shell ended
                Step::Output(None) => break,
            }
        }
        Ok(())
    }
    .await;

    stop.store(true, Ordering::Relaxed);
    drop(event_rx);
    let _ = events.await;
    drop(raw);

    let exit_code = bridge.exit().await?;
    outcome?;
    Ok(exit_code)
}

/// Translate a key press into the bytes a terminal would send
fn key_to_bytes(code: KeyCode, modifiers: KeyModifiers) -> Vec<u8> {
    use KeyCode::*;

    match code {
        Char(c) => {
            if modifiers.contains(KeyModifiers::CONTROL) && c.is_ascii_alphabetic() {
                // Ctrl+A = 0x01, Ctrl+B = 0x02, etc.
                vec![(c.to_ascii_lowercase() as u8) - b'a' + 1]
            } else if modifiers.contains(KeyModifiers::ALT) {
                // Alt+key sends ESC followed by the key
                let mut bytes = vec![0x1b];
                bytes.extend_from_slice(c.to_string().as_bytes());
                bytes
            } else {
                c.to_string().into_bytes()
            }
        }
        Enter => vec![b'\r'],
        Tab => vec![b'\t'],
        BackTab => vec![0x1b, b'[', b'Z'],
        Backspace => vec![0x7f],
        Esc => vec![0x1b],
        Up => vec![0x1b, b'[', b'A'],
        Down => vec![0x1b, b'[', b'B'],
        Right => vec![0x1b, b'[', b'C'],
        Left => vec![0x1b, b'[', b'D'],
        Home => vec![0x1b, b'[', b'H'],
        End => vec![0x1b, b'[', b'F'],
        PageUp => vec![0x1b, b'[', b'5', b'~'],
        PageDown => vec![0x1b, b'[', b'6', b'~'],
        Delete => vec![0x1b, b'[', b'3', b'~'],
        Insert => vec![0x1b, b'[', b'2', b'~'],
        F(n) => match n {
            1 => vec![0x1b, b'O', b'P'],
            2 => vec![0x1b, b'O', b'Q'],
            3 => vec![0x1b, b'O', b'R'],
            4 => vec![0x1b, b'O', b'S'],
            5 => b"\x1b[15~".to_vec(),
            6 => b"\x1b[17~".to_vec(),
            7 => b"\x1b[18~".to_vec(),
            8 => b"\x1b[19~".to_vec(),
            9 => b"\x1b[20~".to_vec(),
            10 => b"\x1b[21~".to_vec(),
            11 => b"\x1b[23~".to_vec(),
            12 => b"\x1b[24~".to_vec(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_keys() {
        assert_eq!(key_to_bytes(KeyCode::Char('c'), KeyModifiers::CONTROL), vec![0x03]);
        assert_eq!(key_to_bytes(KeyCode::Char('D'), KeyModifiers::CONTROL), vec![0x04]);
    }

    #[test]
    fn test_plain_and_alt_keys() {
        assert_eq!(key_to_bytes(KeyCode::Char('x'), KeyModifiers::NONE), b"x".to_vec());
        assert_eq!(key_to_bytes(KeyCode::Char('é'), KeyModifiers::NONE), "é".as_bytes().to_vec());
        assert_eq!(key_to_bytes(KeyCode::Char('b'), KeyModifiers::ALT), vec![0x1b, b'b']);
    }

    #[test]
    fn test_navigation_keys() {
        assert_eq!(key_to_bytes(KeyCode::Enter, KeyModifiers::NONE), vec![b'\r']);
        assert_eq!(key_to_bytes(KeyCode::Up, KeyModifiers::NONE), b"\x1b[A".to_vec());
        assert_eq!(key_to_bytes(KeyCode::F(5), KeyModifiers::NONE), b"\x1b[15~".to_vec());
        assert!(key_to_bytes(KeyCode::F(20), KeyModifiers::NONE).is_empty());
    }
}
