//! Text formatting for CLI output.
//!
//! Renders streamed log lines, progress updates and the end-of-run summary.

use crate::model::{LogLevel, PhaseStatus, RunOutcome, RunReport};
use std::time::Duration;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn format_log_line(level: LogLevel, text: &str) -> String {
    match level {
        LogLevel::Head => format!("\n{text}"),
        LogLevel::Info => format!("  {text}"),
        LogLevel::Warn => format!("  ! {text}"),
        LogLevel::Error => text.to_string(),
    }
}

pub(crate) fn format_progress(fraction: f64, label: &str) -> String {
    let pct = (fraction.clamp(0.0, 1.0) * 100.0).round() as u32;
    format!("[{pct:>3}%] {label}")
}

fn status_tag(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Succeeded => "ok",
        PhaseStatus::ReportedFailure => "warn",
        PhaseStatus::Aborted => "FAIL",
    }
}

fn format_ms(ms: u64) -> String {
    // Whole seconds keep the output short for multi-minute scans.
    let secs = Duration::from_secs(ms / 1000);
    if secs.is_zero() {
        format!("{ms}ms")
    } else {
        humantime::format_duration(secs).to_string()
    }
}

/// Build the end-of-run summary.
pub(crate) fn build_text_summary(report: &RunReport) -> TextSummary {
    let mut lines = vec![String::new(), format!("{} summary:", report.pipeline)];

    for phase in &report.phases {
        let mut line = format!(
            "  [{:>4}] {}/{} {} ({})",
            status_tag(phase.status),
            phase.index,
            phase.total,
            phase.label,
            format_ms(phase.duration_ms)
        );
        if let Some(summary) = phase.summary.as_deref() {
            line.push_str(": ");
            line.push_str(summary);
        }
        lines.push(line);
    }

    lines.push(format!(
        "Phases: {} succeeded, {} reported problems, {} aborted",
        report.count(PhaseStatus::Succeeded),
        report.count(PhaseStatus::ReportedFailure),
        report.count(PhaseStatus::Aborted),
    ));
    lines.push(format!("Total time: {}", format_ms(report.duration_ms)));

    match &report.outcome {
        RunOutcome::Completed => {
            lines.push("Restart your computer to finish applying the changes.".to_string());
        }
        RunOutcome::Failed(reason) => {
            lines.push(format!("Run stopped early: {reason}"));
        }
    }

    TextSummary { lines }
}
