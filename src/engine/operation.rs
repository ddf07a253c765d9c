//! Units of maintenance work the orchestrator runs as phases.
//!
//! An operation reports a tool's own failure through
//! [`OperationOutcome::succeeded`]; returning `Err` means the operation itself
//! broke, which ends the whole run.

use crate::engine::runner::{Command, StreamingProcessRunner};
use crate::engine::sink::LineSink;
use crate::model::LogLevel;
use anyhow::{Context, Result};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    pub succeeded: bool,
    pub summary: Option<String>,
}

impl OperationOutcome {
    pub fn succeeded(summary: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            summary: Some(summary.into()),
        }
    }

    pub fn reported_failure(summary: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            summary: Some(summary.into()),
        }
    }
}

#[async_trait]
pub trait MaintenanceOperation: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        self.name()
    }

    async fn execute(&self, sink: &dyn LineSink) -> Result<OperationOutcome>;
}

/// One streaming command.
pub struct CommandOperation {
    command: Command,
    runner: StreamingProcessRunner,
}

impl CommandOperation {
    pub fn new(command: Command, runner: StreamingProcessRunner) -> Self {
        Self { command, runner }
    }
}

#[async_trait]
impl MaintenanceOperation for CommandOperation {
    fn name(&self) -> &str {
        self.command.description()
    }

    async fn execute(&self, sink: &dyn LineSink) -> Result<OperationOutcome> {
        let desc = self.command.description();
        let status = self.runner.run(&self.command, sink).await;
        let outcome = match (status.succeeded, status.exit_code) {
            (true, _) => OperationOutcome::succeeded(format!("{desc} completed successfully.")),
            (false, Some(code)) => {
                OperationOutcome::reported_failure(format!("{desc} finished with return code {code}."))
            }
            (false, None) => OperationOutcome::reported_failure(format!("{desc} did not complete.")),
        };
        if let Some(summary) = outcome.summary.as_deref() {
            let level = if outcome.succeeded {
                LogLevel::Info
            } else {
                LogLevel::Warn
            };
            sink.on_status(level, summary);
        }
        Ok(outcome)
    }
}

/// Several operations run back to back inside one phase.
pub struct SequenceOperation {
    name: String,
    steps: Vec<Box<dyn MaintenanceOperation>>,
}

impl SequenceOperation {
    pub fn new(name: impl Into<String>, steps: Vec<Box<dyn MaintenanceOperation>>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

#[async_trait]
impl MaintenanceOperation for SequenceOperation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, sink: &dyn LineSink) -> Result<OperationOutcome> {
        let mut succeeded = true;
        let mut summaries = Vec::new();
        for step in &self.steps {
            let outcome = step
                .execute(sink)
                .await
                .with_context(|| format!("{} failed", step.name()))?;
            succeeded &= outcome.succeeded;
            summaries.extend(outcome.summary);
        }
        Ok(OperationOutcome {
            succeeded,
            summary: (!summaries.is_empty()).then(|| summaries.join(" ")),
        })
    }
}
