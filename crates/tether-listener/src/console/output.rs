//! Console output formatting

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use tabled::{settings::Style, Table, Tabled};

use tether_core::time::{elapsed_since, format_age};

use crate::session::SessionInfo;

/// Format sessions as a table
///
/// The `#` column is the index `use` and `kill` take; `sessions` must already
/// be in registry order.
pub fn format_sessions(sessions: &[SessionInfo]) -> String {
    if sessions.is_empty() {
        return "No active sessions".to_string();
    }

    #[derive(Tabled)]
    struct SessionRow {
        #[tabled(rename = "#")]
        index: usize,
        #[tabled(rename = "ID")]
        id: u64,
        #[tabled(rename = "ADDRESS")]
        addr: String,
        #[tabled(rename = "MODE")]
        mode: String,
        #[tabled(rename = "ADMITTED")]
        admitted: String,
        #[tabled(rename = "LAST ACTIVE")]
        last_active: String,
    }

    let rows: Vec<SessionRow> = sessions
        .iter()
        .enumerate()
        .map(|(i, s)| SessionRow {
            index: i + 1,
            id: s.id,
            addr: s.addr.to_string(),
            mode: s.mode.to_string(),
            admitted: format!("{} ago", format_age(elapsed_since(s.admitted_at))),
            last_active: format!("{} ago", format_age(elapsed_since(s.last_activity))),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

fn print_colored(mut out: impl std::io::Write, color: Color, symbol: &str, msg: &str) {
    let _ = crossterm::execute!(
        out,
        SetForegroundColor(color),
        Print(symbol),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a success message in green
pub fn print_success(msg: &str) {
    print_colored(std::io::stdout(), Color::Green, "✓ ", msg);
}

/// Print an error message in red to stderr
pub fn print_error(msg: &str) {
    print_colored(std::io::stderr(), Color::Red, "✗ ", msg);
}

/// Print a warning in yellow to stderr
pub fn print_warning(msg: &str) {
    print_colored(std::io::stderr(), Color::Yellow, "⚠ ", msg);
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    print_colored(std::io::stdout(), Color::Cyan, "ℹ ", msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::time::current_time_millis;
    use tether_protocol::SessionMode;

    #[test]
    fn test_empty_table() {
        assert_eq!(format_sessions(&[]), "No active sessions");
    }

    #[test]
    fn test_rows_are_numbered_from_one() {
        let now = current_time_millis();
        let sessions = vec![
            SessionInfo {
                id: 7,
                addr: "10.0.0.1:40000".parse().unwrap(),
                mode: SessionMode::Command,
                admitted_at: now,
                last_activity: now,
            },
            SessionInfo {
                id: 9,
                addr: "10.0.0.2:40000".parse().unwrap(),
                mode: SessionMode::PtyActive,
                admitted_at: now,
                last_activity: now,
            },
        ];

        let table = format_sessions(&sessions);
        assert!(table.contains("ADDRESS"));
        assert!(table.contains("10.0.0.1:40000"));
        assert!(table.contains("pty"));

        let first = table.lines().find(|l| l.contains("10.0.0.1")).unwrap();
        assert!(first.contains(" 1 "));
        let second = table.lines().find(|l| l.contains("10.0.0.2")).unwrap();
        assert!(second.contains(" 2 "));
    }
}
