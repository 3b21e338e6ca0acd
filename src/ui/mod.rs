//! Terminal dashboard for a running simulation
//!
//! Shows the coding tree of the first simulated file, run statistics and
//! an activity log, and lets the user pause, change speed and kill hosts.

pub mod terminal;

pub use terminal::TerminalUI;

use crate::storage::Status;
use crossterm::event::{KeyCode, KeyEvent};

/// Dashboard commands decoded from key presses
#[derive(Debug, Clone, PartialEq)]
pub enum UIEvent {
    Quit,
    TogglePause,
    /// Take a random chunk-holding host offline
    KillRandomHost,
    /// Archive one more file
    AddFile,
    IncreaseSpeed,
    DecreaseSpeed,
    ShowHelp,
    Unknown(KeyCode),
}

impl From<KeyEvent> for UIEvent {
    fn from(key_event: KeyEvent) -> Self {
        match key_event.code {
            KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => UIEvent::Quit,
            KeyCode::Char(' ') => UIEvent::TogglePause,
            KeyCode::Char('k') | KeyCode::Char('K') => UIEvent::KillRandomHost,
            KeyCode::Char('a') | KeyCode::Char('A') => UIEvent::AddFile,
            KeyCode::Char('+') | KeyCode::Char('=') => UIEvent::IncreaseSpeed,
            KeyCode::Char('-') | KeyCode::Char('_') => UIEvent::DecreaseSpeed,
            KeyCode::Char('h') | KeyCode::Char('H') | KeyCode::F(1) => UIEvent::ShowHelp,
            other => UIEvent::Unknown(other),
        }
    }
}

/// Palette for unit states and log levels
#[derive(Debug, Clone, Copy)]
pub struct ColorScheme {
    pub present: ratatui::style::Color,
    pub recoverable: ratatui::style::Color,
    pub unrecoverable: ratatui::style::Color,
    pub text: ratatui::style::Color,
    pub highlight: ratatui::style::Color,
    pub success: ratatui::style::Color,
    pub warning: ratatui::style::Color,
    pub error: ratatui::style::Color,
}

impl Default for ColorScheme {
    fn default() -> Self {
        use ratatui::style::Color;
        Self {
            present: Color::Cyan,
            recoverable: Color::Green,
            unrecoverable: Color::Red,
            text: Color::White,
            highlight: Color::Cyan,
            success: Color::Green,
            warning: Color::Yellow,
            error: Color::Red,
        }
    }
}

impl ColorScheme {
    /// Color of a unit in the tree view
    pub fn for_status(&self, status: Status) -> ratatui::style::Color {
        match status {
            Status::Present => self.present,
            Status::Recoverable => self.recoverable,
            Status::Unrecoverable => self.unrecoverable,
        }
    }
}

/// Dashboard timing and retention
#[derive(Debug, Clone)]
pub struct UIConfig {
    pub colors: ColorScheme,
    /// Redraw period in milliseconds
    pub update_interval_ms: u64,
    /// Simulated seconds per redraw at speed 1
    pub sim_seconds_per_tick: f64,
    pub max_log_entries: usize,
}

impl Default for UIConfig {
    fn default() -> Self {
        Self {
            colors: ColorScheme::default(),
            update_interval_ms: 100,
            sim_seconds_per_tick: 3600.0,
            max_log_entries: 100,
        }
    }
}

/// Which screen is showing
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UIState {
    Running,
    Paused,
    Help,
    Shutdown,
}

/// A line in the activity log
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Simulated seconds when it happened
    pub sim_time: f64,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(sim_time: f64, level: LogLevel, message: String) -> Self {
        Self {
            sim_time,
            level,
            message,
        }
    }

    pub fn format(&self) -> String {
        format!(
            "[{:7.2}d] [{}] {}",
            self.sim_time / 86400.0,
            self.level.tag(),
            self.message
        )
    }
}

/// Severity of an activity-log line
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl LogLevel {
    fn tag(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "OK",
        }
    }

    pub fn color(&self, colors: &ColorScheme) -> ratatui::style::Color {
        match self {
            LogLevel::Info => colors.text,
            LogLevel::Warning => colors.warning,
            LogLevel::Error => colors.error,
            LogLevel::Success => colors.success,
        }
    }
}

/// Body of the help popup
pub const HELP_TEXT: &str = r#"
VDA Simulator - Controls

  Q, Esc    - Quit
  H, F1     - Toggle this help
  Space     - Pause/resume simulated time
  K         - Kill a random host holding chunks
  A         - Archive another file
  +, =      - Faster
  -, _      - Slower

Tree view (children of the root):
  ● cyan    - on the server
  ◐ green   - recoverable from host replicas
  ○ red     - lost

Press H again to return.
"#;

/// Layout helpers
pub mod utils {
    use ratatui::layout::{Constraint, Direction, Layout, Rect};

    /// Side-by-side columns sized by `weights`
    pub fn horizontal_split(area: Rect, weights: &[u16]) -> Vec<Rect> {
        weighted(area, weights, Direction::Horizontal)
    }

    /// Stacked rows sized by `weights`
    pub fn vertical_split(area: Rect, weights: &[u16]) -> Vec<Rect> {
        weighted(area, weights, Direction::Vertical)
    }

    fn weighted(area: Rect, weights: &[u16], direction: Direction) -> Vec<Rect> {
        let sum = weights.iter().map(|&w| u32::from(w)).sum::<u32>().max(1);
        Layout::default()
            .direction(direction)
            .constraints(
                weights
                    .iter()
                    .map(|&w| Constraint::Ratio(u32::from(w), sum))
                    .collect::<Vec<_>>(),
            )
            .split(area)
            .to_vec()
    }

    /// A `width` x `height` popup in the middle of `area`, clipped to it
    pub fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
        let width = width.min(area.width);
        let height = height.min(area.height);
        Rect {
            x: area.x + (area.width - width) / 2,
            y: area.y + (area.height - height) / 2,
            width,
            height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyModifiers;
    use ratatui::layout::Rect;

    fn key(code: KeyCode) -> UIEvent {
        UIEvent::from(KeyEvent::new(code, KeyModifiers::NONE))
    }

    #[test]
    fn test_key_mapping() {
        assert_eq!(key(KeyCode::Char('q')), UIEvent::Quit);
        assert_eq!(key(KeyCode::Esc), UIEvent::Quit);
        assert_eq!(key(KeyCode::Char('K')), UIEvent::KillRandomHost);
        assert_eq!(key(KeyCode::Char(' ')), UIEvent::TogglePause);
        assert_eq!(key(KeyCode::F(1)), UIEvent::ShowHelp);
        assert_eq!(key(KeyCode::Char('z')), UIEvent::Unknown(KeyCode::Char('z')));
    }

    #[test]
    fn test_log_format_uses_sim_days() {
        let entry = LogEntry::new(2.5 * 86400.0, LogLevel::Warning, "host 7 left".into());
        assert_eq!(entry.format(), "[   2.50d] [WARN] host 7 left");
    }

    #[test]
    fn test_layout_helpers() {
        let area = Rect::new(0, 0, 100, 40);
        let popup = utils::centered_rect(60, 30, area);
        assert_eq!((popup.x, popup.y, popup.width, popup.height), (20, 5, 60, 30));
        let clipped = utils::centered_rect(200, 10, area);
        assert_eq!((clipped.x, clipped.width), (0, 100));

        let cols = utils::horizontal_split(area, &[2, 1]);
        assert_eq!(cols.len(), 2);
        assert!(cols[0].width > cols[1].width);
    }

    #[test]
    fn test_status_colors_distinct() {
        let colors = ColorScheme::default();
        assert_ne!(
            colors.for_status(Status::Present),
            colors.for_status(Status::Unrecoverable)
        );
    }
}
