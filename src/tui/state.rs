use crate::model::{InfoEvent, LogLevel, PipelineEvent, RunOutcome, RunReport};
use ratatui::{
    style::{Color, Modifier, Style},
    text::{Line, Span},
};

/// Oldest log lines are dropped past this many.
const MAX_LOG_LINES: usize = 5000;

pub struct UiState {
    pub tab: usize,
    pub running: bool,
    /// `running` was set by this UI and no event of the new run has arrived yet.
    pub start_pending: bool,
    /// Waiting for the user to confirm a start with `y`.
    pub confirming: bool,
    pub fraction: f64,
    pub status: String,
    pub info: String,
    pub log: Vec<(LogLevel, String)>,
    /// Lines scrolled up from the bottom of the log; 0 follows new output.
    pub log_scroll: usize,
    pub last_report: Option<RunReport>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            running: false,
            start_pending: false,
            confirming: false,
            fraction: 0.0,
            status: "Ready".into(),
            info: String::new(),
            log: Vec::new(),
            log_scroll: 0,
            last_report: None,
        }
    }
}

impl UiState {
    /// First step of a start: ask for confirmation unless a run is active.
    pub fn request_start(&mut self) {
        if self.running {
            self.info = "A protocol run is already in progress".into();
            return;
        }
        self.confirming = true;
        self.info = "Start the Resurrection Protocol? Press y to confirm, any other key to cancel"
            .into();
    }

    /// Returns true when a start command should be sent.
    pub fn confirm(&mut self, accepted: bool) -> bool {
        self.confirming = false;
        if !accepted {
            self.info = "Start cancelled".into();
            return false;
        }
        self.begin_run();
        true
    }

    pub fn begin_run(&mut self) {
        self.running = true;
        self.start_pending = true;
        self.fraction = 0.0;
        self.status = "Starting...".into();
        self.info = String::new();
        self.log.clear();
        self.log_scroll = 0;
        self.last_report = None;
    }

    pub fn apply_event(&mut self, ev: PipelineEvent) {
        match ev {
            PipelineEvent::Progress { fraction, label } => {
                self.start_pending = false;
                self.fraction = fraction.clamp(0.0, 1.0);
                self.status = label;
            }
            PipelineEvent::Line { level, text } => {
                self.start_pending = false;
                self.log.push((level, text));
                if self.log.len() > MAX_LOG_LINES {
                    let excess = self.log.len() - MAX_LOG_LINES;
                    self.log.drain(..excess);
                }
            }
            // Finalization of the run re-enables the start control.
            PipelineEvent::RunFinished { outcome } => {
                self.running = false;
                self.start_pending = false;
                self.status = match outcome {
                    RunOutcome::Completed => "Complete. Restart recommended".into(),
                    RunOutcome::Failed(reason) => format!("Failed: {reason}"),
                };
            }
            PipelineEvent::Info(info) => {
                // The controller refused the start this UI already showed as running.
                if self.start_pending && matches!(info, InfoEvent::AlreadyRunning) {
                    self.running = false;
                    self.start_pending = false;
                    self.status = "Ready".into();
                }
                self.info = info.to_message();
            }
            PipelineEvent::RunCompleted { report } => {
                self.last_report = Some(*report);
            }
        }
    }

    pub fn scroll_up(&mut self, lines: usize) {
        self.log_scroll = (self.log_scroll + lines).min(self.log.len().saturating_sub(1));
    }

    pub fn scroll_down(&mut self, lines: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(lines);
    }

    /// The slice of the log visible in a pane `height` rows tall.
    pub fn visible_log(&self, height: usize) -> &[(LogLevel, String)] {
        let end = self.log.len().saturating_sub(self.log_scroll);
        let start = end.saturating_sub(height);
        &self.log[start..end]
    }
}

pub fn level_style(level: LogLevel) -> Style {
    match level {
        LogLevel::Head => Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
        LogLevel::Info => Style::default().fg(Color::Gray),
        LogLevel::Warn => Style::default().fg(Color::Yellow),
        LogLevel::Error => Style::default()
            .fg(Color::Red)
            .add_modifier(Modifier::BOLD),
    }
}

pub fn log_line(level: LogLevel, text: &str) -> Line<'static> {
    Line::from(Span::styled(text.to_string(), level_style(level)))
}
