use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Drive letter targeted by the disk phases, e.g. `C:`.
    pub drive: String,
    pub skip: Vec<PhaseKind>,
    /// Encoding labels tried in order when decoding tool output.
    pub encodings: Vec<String>,
    #[serde(default, with = "humantime_serde")]
    pub command_timeout: Option<Duration>,
    pub restore_description: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            drive: "C:".into(),
            skip: Vec::new(),
            encodings: vec!["utf-8".into(), "windows-1252".into()],
            command_timeout: None,
            restore_description: "Panacea Auto-Restore".into(),
        }
    }
}

/// The phases of the Resurrection Protocol, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    Safety,
    Browser,
    Junk,
    Network,
    Optimize,
    DiskScan,
    Dism,
    Sfc,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 8] = [
        PhaseKind::Safety,
        PhaseKind::Browser,
        PhaseKind::Junk,
        PhaseKind::Network,
        PhaseKind::Optimize,
        PhaseKind::DiskScan,
        PhaseKind::Dism,
        PhaseKind::Sfc,
    ];

    pub fn label(self) -> &'static str {
        match self {
            PhaseKind::Safety => "Safety Backup",
            PhaseKind::Browser => "Browser Cleanup",
            PhaseKind::Junk => "System Junk Cleanup",
            PhaseKind::Network => "Network Reset",
            PhaseKind::Optimize => "Disk Defrag/Trim",
            PhaseKind::DiskScan => "Disk Health Scan",
            PhaseKind::Dism => "DISM Health Check",
            PhaseKind::Sfc => "Integrity Scan (SFC)",
        }
    }
}

/// Severity tag attached to a log line, used for colouring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Head,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    Progress { fraction: f64, label: String },
    Line { level: LogLevel, text: String },
    /// Emitted by the finalization step of every run, whatever its outcome.
    RunFinished { outcome: RunOutcome },
    Info(InfoEvent),
    RunCompleted {
        // Boxed to keep the event small; the report carries one record per phase.
        report: Box<RunReport>,
    },
}

/// Structured info events emitted by the controller and consumed by UI/CLI layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    AlreadyRunning,
    RunAbandoned,
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::AlreadyRunning => "A protocol run is already in progress".to_string(),
            InfoEvent::RunAbandoned => {
                "Run abandoned; started tools keep running in the background".to_string()
            }
        }
    }
}

/// Terminal state of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed(String),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Succeeded,
    /// The phase ran to completion but its tool reported a failure.
    ReportedFailure,
    /// The phase raised an error and ended the run.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub index: usize,
    pub total: usize,
    pub label: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub summary: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(default)]
    pub timestamp_utc: String,
    pub pipeline: String,
    pub outcome: RunOutcome,
    pub phases: Vec<PhaseRecord>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn count(&self, status: PhaseStatus) -> usize {
        self.phases.iter().filter(|p| p.status == status).count()
    }
}
