mod help;
mod state;

use crate::cli::Cli;
use crate::engine::protocol::PROTOCOL_NAME;
use crate::model::{PipelineEvent, RunReport};
use crate::orchestrator::{self, UiCommand};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Tabs, Wrap},
    Terminal,
};
use state::UiState;
use std::panic::{self, PanicHookInfo};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub async fn run(args: Cli) -> Result<()> {
    // Unbounded channels keep the worker from ever waiting on the UI.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<PipelineEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_args = args.clone();
    let ui_handle = std::thread::spawn(move || run_threaded(ui_args, event_rx, cmd_tx));

    let res = orchestrator::run_controller(&args, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
pub fn run_threaded(
    args: Cli,
    mut event_rx: UnboundedReceiver<PipelineEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let _panics = PanicLogGuard::install();
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState::default();
    let mut summary: Vec<String> = Vec::new();
    if args.start_on_launch {
        state.begin_run();
    }

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking; one run's events arrive in emission order.
        while let Ok(ev) = event_rx.try_recv() {
            if let PipelineEvent::RunCompleted { report } = &ev {
                summary = handle_run_completed(&args, &mut state, report);
            }
            state.apply_event(ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state, &summary)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if state.confirming {
                    if state.confirm(matches!(k.code, KeyCode::Char('y') | KeyCode::Char('Y'))) {
                        let _ = cmd_tx.send(UiCommand::Start);
                        summary.clear();
                    }
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('r')) | (_, KeyCode::Enter) => {
                        state.tab = 0;
                        state.request_start();
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => state.scroll_up(1),
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => state.scroll_down(1),
                    (_, KeyCode::PageUp) => state.scroll_up(20),
                    (_, KeyCode::PageDown) => state.scroll_down(20),
                    (_, KeyCode::End) => state.log_scroll = 0,
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % 3;
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = 2;
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>;

/// Sends panic reports to the log file instead of stderr until dropped.
/// Panics caught in the engine would otherwise print over the alternate screen.
struct PanicLogGuard {
    previous: Option<PanicHook>,
}

impl PanicLogGuard {
    fn install() -> Self {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(|info| {
            tracing::error!(target: "panacea::panic", "{info}");
        }));
        Self {
            previous: Some(previous),
        }
    }
}

impl Drop for PanicLogGuard {
    fn drop(&mut self) {
        // The hook cannot be swapped from a panicking thread.
        if std::thread::panicking() {
            return;
        }
        if let Some(previous) = self.previous.take() {
            panic::set_hook(previous);
        }
    }
}

fn handle_run_completed(args: &Cli, state: &mut UiState, report: &RunReport) -> Vec<String> {
    let processed = orchestrator::process_run_completion(args, report);
    if !processed.export_messages.is_empty() {
        state.info = processed.export_messages.join("; ");
    }
    processed.summary
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState, summary: &[String]) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Dashboard"),
        Line::from("Summary"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title("panacea"))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_dashboard(chunks[1], f, state),
        1 => draw_summary(chunks[1], f, state, summary),
        _ => help::draw_help(chunks[1], f),
    }
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3),
                Constraint::Length(4),
                Constraint::Min(3),
            ]
            .as_ref(),
        )
        .split(area);

    let gauge = Gauge::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(PROTOCOL_NAME),
        )
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(state.fraction.clamp(0.0, 1.0))
        .label(format!("{:.0}%", state.fraction * 100.0));
    f.render_widget(gauge, rows[0]);

    let (start_label, start_style) = if state.running {
        ("running", Style::default().fg(Color::DarkGray))
    } else {
        ("r start", Style::default().fg(Color::Magenta))
    };
    let status = Paragraph::new(vec![
        Line::from(vec![
            Span::raw("Status: "),
            Span::styled(state.status.clone(), Style::default().fg(Color::White)),
            Span::raw("   ["),
            Span::styled(start_label, start_style),
            Span::raw("]"),
        ]),
        Line::from(Span::styled(
            state.info.clone(),
            Style::default().fg(Color::Yellow),
        )),
    ])
    .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(status, rows[1]);

    let height = rows[2].height.saturating_sub(2) as usize;
    let lines: Vec<Line> = state
        .visible_log(height)
        .iter()
        .map(|(level, text)| state::log_line(*level, text))
        .collect();
    let title = if state.log_scroll > 0 {
        format!("Execution Log (scrolled {} up, End to follow)", state.log_scroll)
    } else {
        "Execution Log".to_string()
    };
    let log = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(log, rows[2]);
}

fn draw_summary(area: Rect, f: &mut ratatui::Frame, state: &UiState, summary: &[String]) {
    let lines: Vec<Line> = if summary.is_empty() {
        vec![Line::from("No completed run yet.")]
    } else {
        summary.iter().map(|l| Line::from(l.clone())).collect()
    };
    let title = match state.last_report.as_ref() {
        Some(r) => format!("Last run ({})", r.timestamp_utc),
        None => "Last run".to_string(),
    };
    let p = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn payload(info: &PanicHookInfo<'_>) -> Option<String> {
        info.payload().downcast_ref::<&str>().map(|s| s.to_string())
    }

    #[test]
    fn panic_guard_silences_then_restores_previous_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let original = panic::take_hook();
        let recorder = seen.clone();
        panic::set_hook(Box::new(move |info| {
            if let Some(msg) = payload(info) {
                recorder.lock().unwrap().push(msg);
            }
        }));

        let guard = PanicLogGuard::install();
        let quiet = panic::catch_unwind(|| panic!("panic-while-tui-active"));
        drop(guard);
        let loud = panic::catch_unwind(|| panic!("panic-after-tui-closed"));
        panic::set_hook(original);

        assert!(quiet.is_err());
        assert!(loud.is_err());
        let seen = seen.lock().unwrap();
        assert!(!seen.iter().any(|m| m == "panic-while-tui-active"));
        assert!(seen.iter().any(|m| m == "panic-after-tui-closed"));
    }
}
