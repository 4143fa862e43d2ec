//! Shared styling utilities for CLI output.

use comfy_table::{Cell, Color};
use console::Style;

use mirrorsync_core::models::{PairStatus, RunStatus};

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold, white).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Table cell for a pair status.
pub fn pair_status_cell(status: PairStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        PairStatus::Succeeded => cell.fg(Color::Green),
        PairStatus::Degraded | PairStatus::Stale => cell.fg(Color::Yellow),
        PairStatus::Failed => cell.fg(Color::Red),
        PairStatus::Cancelled => cell,
    }
}

/// Table cell for a run status.
pub fn run_status_cell(status: RunStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        RunStatus::Succeeded => cell.fg(Color::Green),
        RunStatus::Failed => cell.fg(Color::Red),
        RunStatus::Running | RunStatus::Cancelled => cell.fg(Color::Yellow),
    }
}
