//! Phased pipeline orchestrator.
//!
//! Runs an ordered list of [`Phase`]s one after another. A phase whose tool
//! reported a failure is logged and the run moves on; a phase that returns
//! `Err` or panics ends the run as [`RunOutcome::Failed`] and nothing after it
//! executes. Whatever happens, the finalization step reports the outcome to
//! the [`ProgressSink`] and leaves the orchestrator ready for the next run.

use crate::engine::operation::MaintenanceOperation;
use crate::engine::sink::{LineSink, ProgressSink};
use crate::model::{LogLevel, PhaseRecord, PhaseStatus, RunOutcome, RunReport};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::{error, info, warn};

/// One named step of a pipeline.
pub struct Phase {
    pub label: String,
    pub operation: Box<dyn MaintenanceOperation>,
}

impl Phase {
    pub fn new(label: impl Into<String>, operation: Box<dyn MaintenanceOperation>) -> Self {
        Self {
            label: label.into(),
            operation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Running { step: usize, total: usize },
    Completed,
    Failed(String),
}

impl OrchestratorState {
    pub fn is_running(&self) -> bool {
        matches!(self, OrchestratorState::Running { .. })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("a run is already in progress")]
    AlreadyRunning,
}

pub struct PhaseOrchestrator {
    name: String,
    state: Mutex<OrchestratorState>,
}

impl PhaseOrchestrator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(OrchestratorState::Idle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> OrchestratorState {
        self.lock_state().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().is_running()
    }

    fn lock_state(&self) -> MutexGuard<'_, OrchestratorState> {
        // A poisoned lock still holds a valid state value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: OrchestratorState) {
        *self.lock_state() = state;
    }

    /// Run every phase in order.
    ///
    /// Fails fast with [`OrchestratorError::AlreadyRunning`], before any event
    /// is emitted, when another run is active on this orchestrator.
    pub async fn run_all(
        &self,
        phases: &[Phase],
        progress: &dyn ProgressSink,
        log: &dyn LineSink,
    ) -> Result<RunReport, OrchestratorError> {
        let total = phases.len();
        {
            let mut state = self.lock_state();
            if state.is_running() {
                warn!(pipeline = %self.name, "rejected start while running");
                return Err(OrchestratorError::AlreadyRunning);
            }
            *state = OrchestratorState::Running { step: 0, total };
        }
        let mut finalizer = Finalizer {
            orchestrator: self,
            progress,
            outcome: None,
        };

        let timestamp_utc = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into());
        let started = Instant::now();
        info!(pipeline = %self.name, phases = total, "run started");

        let mut records = Vec::with_capacity(total);
        let mut outcome = RunOutcome::Completed;

        for (i, phase) in phases.iter().enumerate() {
            let step = i + 1;
            self.set_state(OrchestratorState::Running { step, total });
            progress.on_progress(i as f64 / total as f64, &phase.label);
            log.on_status(
                LogLevel::Head,
                &format!("[PHASE {step}/{total}] {}...", phase.label.to_uppercase()),
            );
            info!(
                step,
                total,
                phase = %phase.label,
                operation = phase.operation.description(),
                "phase started"
            );

            let phase_started = Instant::now();
            let result = AssertUnwindSafe(phase.operation.execute(log))
                .catch_unwind()
                .await;
            let mut record = PhaseRecord {
                index: step,
                total,
                label: phase.label.clone(),
                status: PhaseStatus::Succeeded,
                summary: None,
                duration_ms: phase_started.elapsed().as_millis() as u64,
            };

            let reason = match result {
                Ok(Ok(done)) => {
                    record.summary = done.summary;
                    if done.succeeded {
                        info!(step, phase = %phase.label, "phase succeeded");
                    } else {
                        record.status = PhaseStatus::ReportedFailure;
                        warn!(step, phase = %phase.label, "phase reported a failure");
                        log.on_status(
                            LogLevel::Warn,
                            &format!("{} reported a problem; continuing.", phase.label),
                        );
                    }
                    records.push(record);
                    continue;
                }
                Ok(Err(err)) => format!("{}: {err:#}", phase.label),
                Err(panic) => format!("{}: {}", phase.label, panic_message(panic.as_ref())),
            };

            error!(step, phase = %phase.label, %reason, "phase aborted the run");
            log.on_status(LogLevel::Error, &format!("[!] ERROR: {reason}"));
            record.status = PhaseStatus::Aborted;
            record.summary = Some(reason.clone());
            records.push(record);
            outcome = RunOutcome::Failed(reason);
            break;
        }

        if outcome.is_completed() {
            progress.on_progress(1.0, "Complete");
            log.on_status(
                LogLevel::Head,
                &format!("=== {} COMPLETE ===", self.name.to_uppercase()),
            );
        }
        info!(pipeline = %self.name, ?outcome, "run finished");

        finalizer.outcome = Some(outcome.clone());
        drop(finalizer);

        Ok(RunReport {
            timestamp_utc,
            pipeline: self.name.clone(),
            outcome,
            phases: records,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Leaves the orchestrator in a terminal state and notifies the progress sink,
/// also when the run future is dropped part way.
struct Finalizer<'a> {
    orchestrator: &'a PhaseOrchestrator,
    progress: &'a dyn ProgressSink,
    outcome: Option<RunOutcome>,
}

impl Drop for Finalizer<'_> {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| RunOutcome::Failed("run abandoned".to_string()));
        self.orchestrator.set_state(match &outcome {
            RunOutcome::Completed => OrchestratorState::Completed,
            RunOutcome::Failed(reason) => OrchestratorState::Failed(reason.clone()),
        });
        self.progress.on_finished(&outcome);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::operation::testing::{FakeOperation, Script};
    use crate::engine::operation::OperationOutcome;
    use crate::engine::sink::testing::RecordingSink;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn phase(op: FakeOperation) -> Phase {
        Phase::new(op.name.clone(), Box::new(op))
    }

    fn banners(sink: &RecordingSink) -> Vec<String> {
        sink.texts()
            .into_iter()
            .filter(|t| t.starts_with("[PHASE"))
            .collect()
    }

    #[test]
    fn new_orchestrator_is_idle_under_its_name() {
        let orch = PhaseOrchestrator::new("Resurrection Protocol");
        assert_eq!(orch.name(), "Resurrection Protocol");
        assert_eq!(orch.state(), OrchestratorState::Idle);
        assert!(!orch.is_running());

        let p = phase(FakeOperation::new("Temp Files", Script::Succeed));
        assert_eq!(p.operation.description(), "Temp Files");
    }

    #[tokio::test]
    async fn three_noop_phases_complete() {
        let orch = PhaseOrchestrator::new("Test Protocol");
        let sink = RecordingSink::default();
        let phases = vec![
            phase(FakeOperation::new("a", Script::Succeed)),
            phase(FakeOperation::new("b", Script::Succeed)),
            phase(FakeOperation::new("c", Script::Succeed)),
        ];

        let report = orch.run_all(&phases, &sink, &sink).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(banners(&sink), vec!["[PHASE 1/3] A...", "[PHASE 2/3] B...", "[PHASE 3/3] C..."]);
        assert_eq!(sink.fractions(), vec![0.0, 1.0 / 3.0, 2.0 / 3.0, 1.0]);
        assert_eq!(sink.labels(), vec!["a", "b", "c", "Complete"]);
        assert_eq!(
            sink.texts().last().map(String::as_str),
            Some("=== TEST PROTOCOL COMPLETE ===")
        );
        assert_eq!(*sink.finished.lock().unwrap(), vec![RunOutcome::Completed]);
        assert_eq!(orch.state(), OrchestratorState::Completed);
        assert_eq!(report.count(PhaseStatus::Succeeded), 3);
    }

    #[tokio::test]
    async fn thrown_failure_stops_the_sequence() {
        let orch = PhaseOrchestrator::new("p");
        let sink = RecordingSink::default();
        let a = FakeOperation::new("A", Script::Succeed);
        let b = FakeOperation::new("B", Script::Fail("boom"));
        let c = FakeOperation::new("C", Script::Succeed);
        let (a_calls, b_calls, c_calls) = (a.calls.clone(), b.calls.clone(), c.calls.clone());
        let phases = vec![phase(a), phase(b), phase(c)];

        let report = orch.run_all(&phases, &sink, &sink).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed("B: boom".into()));
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.labels(), vec!["A", "B"]);
        assert!(!sink.fractions().contains(&1.0));
        let lines = sink.lines.lock().unwrap().clone();
        assert_eq!(
            lines.last(),
            Some(&(LogLevel::Error, "[!] ERROR: B: boom".to_string()))
        );
        assert_eq!(report.phases.len(), 2);
        assert_eq!(report.phases[1].status, PhaseStatus::Aborted);
        assert_eq!(
            *sink.finished.lock().unwrap(),
            vec![RunOutcome::Failed("B: boom".into())]
        );
        assert_eq!(orch.state(), OrchestratorState::Failed("B: boom".into()));
    }

    #[tokio::test]
    async fn reported_failure_does_not_abort() {
        let orch = PhaseOrchestrator::new("p");
        let sink = RecordingSink::default();
        let b = FakeOperation::new("B", Script::Succeed);
        let b_calls = b.calls.clone();
        let phases = vec![phase(FakeOperation::new("A", Script::Report)), phase(b)];

        let report = orch.run_all(&phases, &sink, &sink).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.phases[0].status, PhaseStatus::ReportedFailure);
        assert_eq!(report.phases[1].status, PhaseStatus::Succeeded);
    }

    #[tokio::test]
    async fn panic_is_a_phase_failure_and_next_run_is_accepted() {
        let orch = PhaseOrchestrator::new("p");
        let sink = RecordingSink::default();
        let phases = vec![phase(FakeOperation::new("X", Script::Panic))];

        let report = orch.run_all(&phases, &sink, &sink).await.unwrap();

        assert_eq!(
            report.outcome,
            RunOutcome::Failed("X: panicked: X exploded".into())
        );
        assert!(matches!(orch.state(), OrchestratorState::Failed(_)));

        let again = vec![phase(FakeOperation::new("Y", Script::Succeed))];
        let report = orch.run_all(&again, &sink, &sink).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn phase_output_is_flushed_before_next_banner() {
        let orch = PhaseOrchestrator::new("p");
        let sink = RecordingSink::default();
        let phases = vec![
            phase(FakeOperation::new("one", Script::Succeed).with_lines(vec!["1a", "1b"])),
            phase(FakeOperation::new("two", Script::Succeed).with_lines(vec!["2a"])),
        ];

        orch.run_all(&phases, &sink, &sink).await.unwrap();

        let texts = sink.texts();
        assert_eq!(
            &texts[..5],
            &["[PHASE 1/2] ONE...", "1a", "1b", "[PHASE 2/2] TWO...", "2a"]
        );
    }

    #[tokio::test]
    async fn empty_pipeline_completes() {
        let orch = PhaseOrchestrator::new("p");
        let sink = RecordingSink::default();

        let report = orch.run_all(&[], &sink, &sink).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(sink.fractions(), vec![1.0]);
    }

    /// Blocks until released, so a run can be held open.
    struct Gate {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl MaintenanceOperation for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        async fn execute(&self, _sink: &dyn LineSink) -> Result<OperationOutcome> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(OperationOutcome::succeeded("released"))
        }
    }

    #[tokio::test]
    async fn second_run_is_rejected_without_events() {
        let orch = Arc::new(PhaseOrchestrator::new("p"));
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gate = Gate {
            entered: entered.clone(),
            release: release.clone(),
        };

        let running = {
            let orch = orch.clone();
            tokio::spawn(async move {
                let sink = RecordingSink::default();
                let phases = vec![Phase::new("Gate", Box::new(gate))];
                orch.run_all(&phases, &sink, &sink).await
            })
        };
        entered.notified().await;
        assert_eq!(orch.state(), OrchestratorState::Running { step: 1, total: 1 });

        let other = RecordingSink::default();
        let phases = vec![phase(FakeOperation::new("late", Script::Succeed))];
        let rejected = orch.run_all(&phases, &other, &other).await;

        assert_eq!(rejected.unwrap_err(), OrchestratorError::AlreadyRunning);
        assert!(other.lines.lock().unwrap().is_empty());
        assert!(other.progress.lock().unwrap().is_empty());
        assert!(other.finished.lock().unwrap().is_empty());

        release.notify_one();
        let report = running.await.unwrap().unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(orch.state(), OrchestratorState::Completed);
    }

    #[tokio::test]
    async fn dropped_run_is_finalized() {
        let orch = PhaseOrchestrator::new("p");
        let sink = RecordingSink::default();
        let gate = Gate {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        let phases = vec![Phase::new("Gate", Box::new(gate))];

        let run = orch.run_all(&phases, &sink, &sink);
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), run).await;

        assert!(timed_out.is_err());
        assert_eq!(orch.state(), OrchestratorState::Failed("run abandoned".into()));
        assert_eq!(
            *sink.finished.lock().unwrap(),
            vec![RunOutcome::Failed("run abandoned".into())]
        );
    }
}
