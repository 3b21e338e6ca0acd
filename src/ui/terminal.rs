//! Live simulation dashboard
//!
//! Drives a [`Simulation`] forward in simulated time and draws the coding
//! tree of its first file, the run statistics and an activity log.

use crate::simulation::{SimFile, Simulation, SimulationStatus};
use crate::storage::Status;
use crate::ui::{utils, LogEntry, LogLevel, UIConfig, UIEvent, UIState, HELP_TEXT};
use crate::Result;
use crossterm::{
    event::{self, Event},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Modifier, Style},
    widgets::{Block, Borders, Clear, Gauge, List, ListItem, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io::{self, Stdout};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const MAX_SPEED: f64 = 1000.0;
const MIN_SPEED: f64 = 0.01;

/// What the dashboard shows about one file
#[derive(Debug, Clone)]
struct FileView {
    name: String,
    status: Status,
    fault_tolerance: Option<u32>,
    /// Status and host copy count of each child of the root
    cells: Vec<(Status, Option<usize>)>,
    disk_usage: f64,
    upload_rate: f64,
    download_rate: f64,
}

impl FileView {
    fn of(file: &SimFile) -> Self {
        let tree = &file.tree;
        let cells = tree
            .children(tree.root())
            .iter()
            .map(|&id| {
                let unit = tree.unit(id);
                (unit.state.status, unit.as_chunk().map(|c| c.host_copies()))
            })
            .collect();
        Self {
            name: file.name.clone(),
            status: file.status(),
            fault_tolerance: file.fault_tolerance(),
            cells,
            disk_usage: file.stats.disk_usage.value().unwrap_or(0.0),
            upload_rate: file.stats.upload_rate.value().unwrap_or(0.0),
            download_rate: file.stats.download_rate.value().unwrap_or(0.0),
        }
    }
}

/// Full-screen dashboard bound to stdout
pub struct TerminalUI {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    config: UIConfig,
    state: UIState,
    log_entries: VecDeque<LogEntry>,
    last_update: Instant,
    paused: bool,
    /// Multiplier on simulated seconds per tick
    speed: f64,
    /// Highest fault tolerance seen, scales the gauge
    best_fault_tolerance: u32,
    last_status: Option<SimulationStatus>,
}

impl TerminalUI {
    pub fn new() -> Result<Self> {
        let stdout = io::stdout();
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend)?;

        Ok(Self {
            terminal,
            config: UIConfig::default(),
            state: UIState::Running,
            log_entries: VecDeque::new(),
            last_update: Instant::now(),
            paused: false,
            speed: 1.0,
            best_fault_tolerance: 1,
            last_status: None,
        })
    }

    /// Run the dashboard until the user quits or the configured duration ends
    pub async fn run(&mut self, mut sim: Simulation) -> Result<()> {
        enable_raw_mode()?;
        execute!(self.terminal.backend_mut(), EnterAlternateScreen)?;

        let duration = sim.config().duration;
        self.log_info(
            sim.now(),
            format!(
                "Archiving {} file(s) on {} hosts",
                sim.config().num_files,
                sim.hosts_alive()
            ),
        );
        self.log_info(sim.now(), "Press 'H' for help, 'Q' to quit".to_string());

        let mut event_receiver = self.setup_event_handling();

        loop {
            while let Ok(event) = event_receiver.try_recv() {
                self.handle_event(event, &mut sim);
            }

            if self.state == UIState::Shutdown {
                break;
            }

            if self.last_update.elapsed() >= Duration::from_millis(self.config.update_interval_ms) {
                if self.state == UIState::Running && !self.paused && sim.now() < duration {
                    let dt = (self.config.sim_seconds_per_tick * self.speed)
                        .min(duration - sim.now());
                    sim.step(dt);
                    if sim.now() >= duration {
                        self.log_success(sim.now(), "Simulation complete".to_string());
                    }
                }
                let status = sim.status();
                self.note_changes(&status);
                let view = sim.files().next().map(FileView::of);
                if let Some(ft) = view.as_ref().and_then(|v| v.fault_tolerance) {
                    self.best_fault_tolerance = self.best_fault_tolerance.max(ft);
                }
                self.draw(&status, view.as_ref())?;
                self.last_update = Instant::now();
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.cleanup()?;
        Ok(())
    }

    fn handle_event(&mut self, event: UIEvent, sim: &mut Simulation) {
        let now = sim.now();
        match event {
            UIEvent::Quit => self.state = UIState::Shutdown,
            UIEvent::TogglePause => {
                self.paused = !self.paused;
                let msg = if self.paused { "Paused" } else { "Resumed" };
                self.log_info(now, msg.to_string());
            }
            UIEvent::ShowHelp => {
                self.state = if self.state == UIState::Help {
                    UIState::Running
                } else {
                    UIState::Help
                };
            }
            UIEvent::KillRandomHost => match sim.kill_random_host() {
                Some(host) => self.log_warn(now, format!("Killed host {}", host)),
                None => self.log_warn(now, "No host holds any chunk".to_string()),
            },
            UIEvent::AddFile => {
                let name = format!("file_{}", sim.files().count());
                let id = sim.add_file(&name);
                self.log_success(now, format!("Archived {} as file {}", name, id));
            }
            UIEvent::IncreaseSpeed => {
                self.speed = (self.speed * 2.0).min(MAX_SPEED);
                self.log_info(now, format!("Speed: {:.2}x", self.speed));
            }
            UIEvent::DecreaseSpeed => {
                self.speed = (self.speed / 2.0).max(MIN_SPEED);
                self.log_info(now, format!("Speed: {:.2}x", self.speed));
            }
            UIEvent::Unknown(_) => {}
        }
    }

    /// Log departures, arrivals and losses since the previous frame
    fn note_changes(&mut self, status: &SimulationStatus) {
        if let Some(prev) = self.last_status.take() {
            let left = status.host_departures.saturating_sub(prev.host_departures);
            if left > 0 {
                self.log_warn(status.now, format!("{} host(s) departed", left));
            }
            let joined = status.host_arrivals.saturating_sub(prev.host_arrivals);
            if joined > 0 {
                self.log_info(status.now, format!("{} host(s) joined", joined));
            }
            if status.files_lost > prev.files_lost {
                self.log_error(
                    status.now,
                    format!("{} file(s) lost", status.files_lost - prev.files_lost),
                );
            }
        }
        self.last_status = Some(status.clone());
    }

    /// Forward key presses from a blocking poll loop
    fn setup_event_handling(&self) -> mpsc::UnboundedReceiver<UIEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                if let Ok(true) = event::poll(Duration::from_millis(50)) {
                    if let Ok(Event::Key(key)) = event::read() {
                        if tx.send(UIEvent::from(key)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        rx
    }

    fn draw(&mut self, status: &SimulationStatus, view: Option<&FileView>) -> Result<()> {
        let state = self.state;
        let config = self.config.clone();
        let log_entries = self.log_entries.clone();
        let speed = self.speed;
        let paused = self.paused;
        let best = self.best_fault_tolerance;

        self.terminal.draw(|f| match state {
            UIState::Help => Self::render_help_static(f, &config),
            _ => Self::render_main_static(
                f,
                status,
                view,
                &config,
                &log_entries,
                speed,
                best,
                paused,
            ),
        })?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn render_main_static(
        f: &mut Frame,
        status: &SimulationStatus,
        view: Option<&FileView>,
        config: &UIConfig,
        log_entries: &VecDeque<LogEntry>,
        speed: f64,
        best_fault_tolerance: u32,
        paused: bool,
    ) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(10),
                Constraint::Length(8),
                Constraint::Length(3),
            ])
            .split(f.size());

        Self::render_title_static(f, chunks[0], config, paused);

        let main_chunks = utils::horizontal_split(chunks[1], &[2, 1]);
        Self::render_tree_static(f, main_chunks[0], view, config);
        Self::render_statistics_static(
            f,
            main_chunks[1],
            status,
            view,
            config,
            speed,
            best_fault_tolerance,
        );

        Self::render_logs_static(f, chunks[2], log_entries, config);
        Self::render_status_bar_static(f, chunks[3], status, config, paused);
    }

    fn render_title_static(f: &mut Frame, area: Rect, config: &UIConfig, paused: bool) {
        let title = if paused {
            "VDA Simulator - PAUSED"
        } else {
            "VDA Simulator - RUNNING"
        };

        let block = Block::default()
            .borders(Borders::ALL)
            .style(Style::default().fg(config.colors.highlight));

        let paragraph = Paragraph::new(title)
            .block(block)
            .alignment(Alignment::Center)
            .style(Style::default().add_modifier(Modifier::BOLD));

        f.render_widget(paragraph, area);
    }

    /// Grid of the root's children, colored by status
    fn render_tree_static(f: &mut Frame, area: Rect, view: Option<&FileView>, config: &UIConfig) {
        let title = match view {
            Some(v) => format!("{} ({:?})", v.name, v.status),
            None => "No files".to_string(),
        };
        let block = Block::default().title(title).borders(Borders::ALL);
        let inner = block.inner(area);
        f.render_widget(block, area);

        let Some(view) = view else {
            return;
        };
        let count = view.cells.len();
        if count == 0 {
            return;
        }

        let cols = ((count as f64).sqrt().ceil() as u16).max(1);
        let rows = ((count as f64 / cols as f64).ceil() as u16).max(1);
        let cell_width = inner.width / cols;
        let cell_height = inner.height / rows;

        for (i, &(status, copies)) in view.cells.iter().enumerate() {
            let col = (i % cols as usize) as u16;
            let row = (i / cols as usize) as u16;
            let cell = Rect {
                x: inner.x + col * cell_width,
                y: inner.y + row * cell_height,
                width: cell_width.saturating_sub(1),
                height: cell_height.saturating_sub(1),
            };

            let symbol = match status {
                Status::Present => "●",
                Status::Recoverable => "◐",
                Status::Unrecoverable => "○",
            };
            let text = match copies {
                Some(n) => format!("{} {}\nx{}", symbol, i, n),
                None => format!("{} {}", symbol, i),
            };
            let paragraph = Paragraph::new(text)
                .style(Style::default().fg(config.colors.for_status(status)))
                .alignment(Alignment::Center);
            f.render_widget(paragraph, cell);
        }
    }

    fn render_statistics_static(
        f: &mut Frame,
        area: Rect,
        status: &SimulationStatus,
        view: Option<&FileView>,
        config: &UIConfig,
        speed: f64,
        best_fault_tolerance: u32,
    ) {
        let block = Block::default().title("Statistics").borders(Borders::ALL);
        let inner = block.inner(area);
        f.render_widget(block, area);

        let chunks = utils::vertical_split(inner, &[1, 3]);

        let ft = view.and_then(|v| v.fault_tolerance);
        let ratio = match ft {
            Some(ft) => (ft as f64 / best_fault_tolerance.max(1) as f64).clamp(0.0, 1.0),
            None => 1.0,
        };
        let gauge = Gauge::default()
            .block(Block::default().title("Fault Tolerance").borders(Borders::ALL))
            .gauge_style(Style::default().fg(if ratio > 0.7 {
                config.colors.success
            } else if ratio > 0.3 {
                config.colors.warning
            } else {
                config.colors.error
            }))
            .label(match ft {
                Some(ft) => ft.to_string(),
                None => "-".to_string(),
            })
            .ratio(ratio);
        f.render_widget(gauge, chunks[0]);

        let (disk, up, down) = view
            .map(|v| (v.disk_usage, v.upload_rate, v.download_rate))
            .unwrap_or_default();
        let stats_text = format!(
            "Time: {:.2} days\nHosts: {}\nArrived: {}\nDeparted: {}\nTransfers: {}\n\nFiles: {} ({} lost)\nServer disk: {:.1} MB\nUpload: {:.1} KB/s\nDownload: {:.1} KB/s\n\nSpeed: {:.2}x",
            status.now / 86400.0,
            status.hosts_alive,
            status.host_arrivals,
            status.host_departures,
            status.pending_transfers,
            status.files,
            status.files_lost,
            disk / 1e6,
            up / 1e3,
            down / 1e3,
            speed
        );
        let paragraph = Paragraph::new(stats_text).wrap(Wrap { trim: true });
        f.render_widget(paragraph, chunks[1]);
    }

    fn render_logs_static(
        f: &mut Frame,
        area: Rect,
        log_entries: &VecDeque<LogEntry>,
        config: &UIConfig,
    ) {
        let rows = area.height.saturating_sub(2) as usize;

        let items: Vec<ListItem> = log_entries
            .iter()
            .rev()
            .take(rows)
            .map(|entry| {
                ListItem::new(entry.format())
                    .style(Style::default().fg(entry.level.color(&config.colors)))
            })
            .collect();

        let block = Block::default().title("Activity Log").borders(Borders::ALL);
        f.render_widget(List::new(items).block(block), area);
    }

    fn render_status_bar_static(
        f: &mut Frame,
        area: Rect,
        status: &SimulationStatus,
        config: &UIConfig,
        paused: bool,
    ) {
        let status_text = format!(
            "State: {} | Health: {} | Press 'H' for help",
            if paused { "Paused" } else { "Running" },
            status.health_description()
        );

        let paragraph = Paragraph::new(status_text)
            .style(Style::default().fg(config.colors.text))
            .alignment(Alignment::Center);

        f.render_widget(paragraph, area);
    }

    fn render_help_static(f: &mut Frame, config: &UIConfig) {
        let area = f.size();
        f.render_widget(Clear, area);

        let popup_area = utils::centered_rect(60, 24, area);
        let block = Block::default()
            .title("Help")
            .borders(Borders::ALL)
            .style(Style::default().fg(config.colors.highlight));

        let paragraph = Paragraph::new(HELP_TEXT)
            .block(block)
            .wrap(Wrap { trim: false })
            .style(Style::default().fg(config.colors.text));

        f.render_widget(paragraph, popup_area);
    }

    fn log(&mut self, entry: LogEntry) {
        if self.log_entries.len() >= self.config.max_log_entries {
            self.log_entries.pop_front();
        }
        self.log_entries.push_back(entry);
    }

    fn log_info(&mut self, now: f64, message: String) {
        self.log(LogEntry::new(now, LogLevel::Info, message));
    }

    fn log_warn(&mut self, now: f64, message: String) {
        self.log(LogEntry::new(now, LogLevel::Warning, message));
    }

    fn log_error(&mut self, now: f64, message: String) {
        self.log(LogEntry::new(now, LogLevel::Error, message));
    }

    fn log_success(&mut self, now: f64, message: String) {
        self.log(LogEntry::new(now, LogLevel::Success, message));
    }

    fn cleanup(&mut self) -> Result<()> {
        disable_raw_mode()?;
        execute!(self.terminal.backend_mut(), LeaveAlternateScreen)?;
        self.terminal.show_cursor()?;
        Ok(())
    }
}

impl Drop for TerminalUI {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}
