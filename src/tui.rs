use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph, Wrap};

use crate::app::{ProgressEvent, ProgressSink, ProgressSinkKind};
use crate::error::HarvestError;

const EVENTS_MAX: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    Listing,
    Download,
    Persist,
    Done,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Setup => "Setup",
            Phase::Listing => "Listing",
            Phase::Download => "Download",
            Phase::Persist => "Persist",
            Phase::Done => "Done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug)]
struct AppState {
    status: String,
    phase: Phase,
    keys: (usize, usize),
    keys_failed: usize,
    items: (usize, usize),
    downloaded: usize,
    cached: usize,
    failed: usize,
    retries: usize,
    events: VecDeque<String>,
    started: Instant,
}

impl AppState {
    fn new() -> Self {
        Self {
            status: "starting".to_string(),
            phase: Phase::Setup,
            keys: (0, 0),
            keys_failed: 0,
            items: (0, 0),
            downloaded: 0,
            cached: 0,
            failed: 0,
            retries: 0,
            events: VecDeque::new(),
            started: Instant::now(),
        }
    }

    fn apply(&mut self, message: &str) {
        if let Some((phase, payload)) = parse_phase(message) {
            self.phase = phase;
            self.status = payload.to_string();
        } else if message.starts_with("key.") {
            if message.starts_with("key.failed") {
                self.keys_failed += 1;
            }
            if let Some(progress) = parse_progress(message) {
                self.keys = progress;
            }
        } else if message.starts_with("item.") {
            if message.starts_with("item.ok") {
                self.downloaded += 1;
            } else if message.starts_with("item.cached") {
                self.cached += 1;
            } else if message.starts_with("item.failed") {
                self.failed += 1;
            }
            if let Some(progress) = parse_progress(message) {
                self.items = progress;
            }
        } else if message.starts_with("retry") {
            self.retries += 1;
        }

        self.events.push_back(format!("[{}] {message}", timestamp()));
        while self.events.len() > EVENTS_MAX {
            self.events.pop_front();
        }
    }
}

pub struct Tui {
    kind: ProgressSinkKind,
    state: Arc<Mutex<AppState>>,
}

struct TuiProgress {
    state: Arc<Mutex<AppState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            state.apply(event.message.trim());
        }
    }
}

impl Tui {
    pub fn new(kind: ProgressSinkKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(AppState::new())),
        }
    }

    /// Runs `f` on a worker thread and redraws until it returns. `q` or `Esc`
    /// leaves the screen early; the previous dataset stays as it was.
    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, HarvestError> + Send + 'static,
        R: Send + 'static,
    {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_ui(frame, self.kind, &state, tick))
                    .into_diagnostic()?;
            }

            if let Ok(result) = rx.try_recv() {
                leave_screen()?;
                handle.join().ok();
                return result.map_err(miette::Report::new);
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if key.kind == KeyEventKind::Press
                        && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
                    {
                        break;
                    }
                }
            }

            tick = tick.wrapping_add(1);
        }

        leave_screen()?;
        Err(miette::Report::msg("aborted"))
    }
}

fn leave_screen() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    let mut stdout = io::stdout();
    stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
    Ok(())
}

fn draw_ui(frame: &mut ratatui::Frame, kind: ProgressSinkKind, state: &AppState, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(4),
            Constraint::Min(4),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(kind, state, tick), chunks[0]);
    frame.render_widget(
        gauge("Listing keys", state.keys, Color::Cyan),
        chunks[1],
    );
    frame.render_widget(
        gauge("Assets", state.items, Color::Green),
        chunks[2],
    );
    frame.render_widget(draw_counters(state), chunks[3]);
    frame.render_widget(draw_events(state), chunks[4]);
}

fn draw_header(kind: ProgressSinkKind, state: &AppState, tick: usize) -> Paragraph<'static> {
    let hb = if tick % 2 == 0 { "*" } else { " " };
    let op_label = match kind {
        ProgressSinkKind::Harvest => "Harvest",
        ProgressSinkKind::List => "List",
    };
    let phase_color = if state.phase == Phase::Done {
        Color::Green
    } else {
        Color::Cyan
    };
    let line = Line::from(vec![
        Span::styled(
            "LEXICON-HARVEST",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw(format!("   Op: {op_label}   Phase: ")),
        Span::styled(state.phase.to_string(), Style::default().fg(phase_color)),
        Span::raw(format!("   {}s  ", state.started.elapsed().as_secs())),
        Span::styled(hb, Style::default().fg(Color::Green)),
    ]);
    Paragraph::new(vec![line, Line::from(state.status.clone())]).alignment(Alignment::Left)
}

fn gauge(title: &'static str, (done, total): (usize, usize), color: Color) -> Gauge<'static> {
    let ratio = if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    };
    Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(Style::default().fg(color))
        .ratio(ratio)
        .label(format!("{done}/{total}"))
}

fn draw_counters(state: &AppState) -> Paragraph<'static> {
    let lines = vec![
        Line::from(vec![
            Span::styled("Downloaded: ", Style::default().fg(Color::Gray)),
            Span::styled(state.downloaded.to_string(), Style::default().fg(Color::Green)),
            Span::styled("   Cached: ", Style::default().fg(Color::Gray)),
            Span::raw(state.cached.to_string()),
            Span::styled("   Failed: ", Style::default().fg(Color::Gray)),
            Span::styled(state.failed.to_string(), Style::default().fg(Color::Red)),
        ]),
        Line::from(vec![
            Span::styled("Retried: ", Style::default().fg(Color::Gray)),
            Span::raw(state.retries.to_string()),
            Span::styled("   Keys failed: ", Style::default().fg(Color::Gray)),
            Span::styled(state.keys_failed.to_string(), Style::default().fg(Color::Yellow)),
        ]),
    ];
    Paragraph::new(lines).block(Block::default().borders(Borders::TOP).title("Counters"))
}

fn draw_events(state: &AppState) -> Paragraph<'static> {
    let lines: Vec<Line> = state
        .events
        .iter()
        .rev()
        .map(|event| Line::from(event.clone()))
        .collect();
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::TOP).title("Recent events (q to leave)"))
        .wrap(Wrap { trim: true })
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (name, payload) = rest.split_once(';')?;
    let phase = match name {
        "Setup" => Phase::Setup,
        "Listing" => Phase::Listing,
        "Download" => Phase::Download,
        "Persist" => Phase::Persist,
        "Done" => Phase::Done,
        _ => return None,
    };
    Some((phase, payload.trim()))
}

fn parse_progress(message: &str) -> Option<(usize, usize)> {
    let value = message
        .split_whitespace()
        .find_map(|token| token.strip_prefix("done="))?;
    let (done, total) = value.split_once('/')?;
    Some((done.parse().ok()?, total.parse().ok()?))
}

fn timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs();
    let hours = (secs / 3600) % 24;
    let mins = (secs / 60) % 60;
    let seconds = secs % 60;
    format!("{hours:02}:{mins:02}:{seconds:02}")
}
