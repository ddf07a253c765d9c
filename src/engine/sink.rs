//! Observer seams between the engine and whoever presents its output.

use crate::model::{LogLevel, PipelineEvent, RunOutcome};
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

/// Receives output lines as they are produced. Must not block for long.
pub trait LineSink: Send + Sync {
    fn on_line(&self, text: &str);

    /// Lines the orchestrator writes itself carry a level; plain sinks ignore it.
    fn on_status(&self, level: LogLevel, text: &str) {
        let _ = level;
        self.on_line(text);
    }
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, fraction: f64, label: &str);

    /// Called from the finalization step of every run.
    fn on_finished(&self, _outcome: &RunOutcome) {}
}

/// Forwards everything onto the UI event channel.
///
/// A closed receiver is ignored: the UI going away must not fail a phase.
#[derive(Clone)]
pub struct EventSink {
    tx: UnboundedSender<PipelineEvent>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<PipelineEvent>) -> Self {
        Self { tx }
    }
}

impl LineSink for EventSink {
    fn on_line(&self, text: &str) {
        self.on_status(LogLevel::Info, text);
    }

    fn on_status(&self, level: LogLevel, text: &str) {
        let _ = self.tx.send(PipelineEvent::Line {
            level,
            text: text.to_string(),
        });
    }
}

impl ProgressSink for EventSink {
    fn on_progress(&self, fraction: f64, label: &str) {
        let _ = self.tx.send(PipelineEvent::Progress {
            fraction,
            label: label.to_string(),
        });
    }

    fn on_finished(&self, outcome: &RunOutcome) {
        let _ = self.tx.send(PipelineEvent::RunFinished {
            outcome: outcome.clone(),
        });
    }
}

/// Passes lines through while keeping a copy, for operations that need to
/// inspect what their tool printed.
pub struct CapturingSink<'a> {
    inner: &'a dyn LineSink,
    captured: Mutex<Vec<String>>,
}

impl<'a> CapturingSink<'a> {
    pub fn new(inner: &'a dyn LineSink) -> Self {
        Self {
            inner,
            captured: Mutex::new(Vec::new()),
        }
    }

    pub fn into_lines(self) -> Vec<String> {
        self.captured.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl LineSink for CapturingSink<'_> {
    fn on_line(&self, text: &str) {
        if let Ok(mut lines) = self.captured.lock() {
            lines.push(text.to_string());
        }
        self.inner.on_line(text);
    }

    fn on_status(&self, level: LogLevel, text: &str) {
        if let Ok(mut lines) = self.captured.lock() {
            lines.push(text.to_string());
        }
        self.inner.on_status(level, text);
    }
}
