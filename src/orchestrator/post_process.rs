//! Post-run processing utilities.
//!
//! Builds the summary and performs the optional JSON export after a run completes.

use crate::cli::Cli;
use crate::model::RunReport;
use anyhow::{Context, Result};
use std::path::Path;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub summary: Vec<String>,
    pub export_messages: Vec<String>,
    /// Export failure, kept for modes that must exit non-zero on it.
    pub export_error: Option<anyhow::Error>,
}

/// Write `report` as pretty JSON, creating parent directories.
pub(crate) fn export_json(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

/// Process a completed run: summarize it and export when requested.
pub(crate) fn process_run_completion(args: &Cli, report: &RunReport) -> ProcessedRun {
    let summary = crate::text_summary::build_text_summary(report).lines;

    let mut export_messages = Vec::new();
    let mut export_error = None;
    if let Some(export_path) = args.export_json.as_deref() {
        match export_json(export_path, report) {
            Ok(()) => export_messages.push(format!("Exported JSON: {}", export_path.display())),
            Err(e) => {
                export_messages.push(format!("Export JSON failed: {e:#}"));
                export_error = Some(e);
            }
        }
    }

    ProcessedRun {
        summary,
        export_messages,
        export_error,
    }
}
