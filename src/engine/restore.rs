//! System Restore checkpoint taken before anything is changed.

use crate::engine::operation::{MaintenanceOperation, OperationOutcome};
use crate::engine::runner::{Command, StreamingProcessRunner};
use crate::engine::sink::{CapturingSink, LineSink};
use crate::model::LogLevel;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

pub struct RestorePointOperation {
    drive: String,
    description: String,
    runner: StreamingProcessRunner,
    timeout: Option<Duration>,
}

impl RestorePointOperation {
    pub fn new(
        drive: impl Into<String>,
        description: impl Into<String>,
        runner: StreamingProcessRunner,
    ) -> Self {
        Self {
            drive: drive.into(),
            description: description.into(),
            runner,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn enable_command(&self) -> Command {
        let drive = format!("{}\\", self.drive.trim_end_matches('\\'));
        powershell(
            format!("Enable-ComputerRestore -Drive '{}'", quote(&drive)),
            "Enable System Restore",
        )
        .with_timeout(self.timeout)
    }

    fn checkpoint_command(&self) -> Command {
        powershell(
            format!(
                "Checkpoint-Computer -Description '{}' -RestorePointType 'MODIFY_SETTINGS'",
                quote(&self.description)
            ),
            "Create Restore Point",
        )
        .with_timeout(self.timeout)
    }
}

fn powershell(script: String, description: &str) -> Command {
    Command::program(
        "powershell.exe",
        ["-NoProfile".to_string(), "-Command".to_string(), script],
        description,
    )
}

/// Escape for a single-quoted PowerShell string.
fn quote(value: &str) -> String {
    value.replace('\'', "''")
}

/// Turn what `Checkpoint-Computer` printed into a short user-facing reason.
pub fn classify_failure(lines: &[String]) -> String {
    let joined = lines.join("\n");
    if joined.contains("0x80042306") {
        return "Failed: Shadow Copy Volume error.".to_string();
    }
    if joined.contains("Privilege") || joined.contains("Access") {
        return "Failed: Run as Administrator.".to_string();
    }
    match lines.iter().rev().find(|l| !l.trim().is_empty()) {
        Some(last) => format!("Error: {last}"),
        None => "Failed: restore point could not be created.".to_string(),
    }
}

#[async_trait]
impl MaintenanceOperation for RestorePointOperation {
    fn name(&self) -> &str {
        "Restore Point"
    }

    async fn execute(&self, sink: &dyn LineSink) -> Result<OperationOutcome> {
        sink.on_line("Verifying System Restore state...");
        let enabled = self.runner.run(&self.enable_command(), sink).await;
        if !enabled.succeeded {
            warn!(code = ?enabled.exit_code, "could not enable System Restore");
        }

        let capture = CapturingSink::new(sink);
        let status = self.runner.run(&self.checkpoint_command(), &capture).await;
        let printed = capture.into_lines();

        if status.succeeded {
            let summary = "Restore Point: Restore Point created successfully.";
            sink.on_line(summary);
            return Ok(OperationOutcome::succeeded(summary));
        }
        let summary = format!("Restore Point Warning: {}", classify_failure(&printed));
        sink.on_status(LogLevel::Warn, &summary);
        Ok(OperationOutcome::reported_failure(summary))
    }
}
