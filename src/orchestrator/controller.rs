//! Run lifecycle controller.
//!
//! Owns start/quit handling for protocol runs and emits events for presentation layers.

use crate::cli::{build_config, Cli};
use crate::engine::protocol::{self, PROTOCOL_NAME};
use crate::engine::{EventSink, OrchestratorError, PhaseOrchestrator};
use crate::model::{InfoEvent, PipelineEvent, RunConfig, RunReport};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Commands emitted by UI layers to control protocol runs.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Start,
    Quit,
}

type RunHandle = JoinHandle<Result<RunReport, OrchestratorError>>;

/// Spawn one protocol run as the worker task. Progress and log lines go to `event_tx`.
pub(crate) fn spawn_run(
    orchestrator: Arc<PhaseOrchestrator>,
    cfg: &RunConfig,
    event_tx: UnboundedSender<PipelineEvent>,
) -> RunHandle {
    let phases = protocol::build_phases(cfg);
    tokio::spawn(async move {
        let sink = EventSink::new(event_tx);
        orchestrator.run_all(&phases, &sink, &sink).await
    })
}

/// Internal handle for a running protocol task.
struct RunCtx {
    handle: Option<RunHandle>,
}

fn start_run(
    args: &Cli,
    orchestrator: &Arc<PhaseOrchestrator>,
    event_tx: &UnboundedSender<PipelineEvent>,
) -> RunCtx {
    info!("starting protocol run");
    RunCtx {
        handle: Some(spawn_run(
            orchestrator.clone(),
            &build_config(args),
            event_tx.clone(),
        )),
    }
}

/// Orchestrate protocol runs based on UI commands and emit events back to presentation layers.
pub(crate) async fn run_controller(
    args: &Cli,
    event_tx: UnboundedSender<PipelineEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let orchestrator = Arc::new(PhaseOrchestrator::new(PROTOCOL_NAME));
    let mut run_ctx = if args.start_on_launch {
        Some(start_run(args, &orchestrator, &event_tx))
    } else {
        None
    };

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Start) => {
                        if run_ctx.is_some() || orchestrator.is_running() {
                            warn!(
                                pipeline = orchestrator.name(),
                                state = ?orchestrator.state(),
                                "start requested while a run is active"
                            );
                            let _ = event_tx.send(PipelineEvent::Info(InfoEvent::AlreadyRunning));
                        } else {
                            run_ctx = Some(start_run(args, &orchestrator, &event_tx));
                        }
                    }
                    Some(UiCommand::Quit) | None => {
                        // Phases cannot be interrupted; leaving drops the sequence
                        // and lets any started tool finish on its own.
                        if let Some(handle) = run_ctx.as_mut().and_then(|ctx| ctx.handle.take()) {
                            warn!("quit during a run; abandoning remaining phases");
                            handle.abort();
                            let _ = event_tx.send(PipelineEvent::Info(InfoEvent::RunAbandoned));
                        }
                        break Ok(());
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(ctx) = &mut run_ctx {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    match join_res {
                        Ok(Ok(report)) => {
                            info!(outcome = ?report.outcome, "protocol run finished");
                            let _ = event_tx.send(PipelineEvent::RunCompleted { report: Box::new(report) });
                        }
                        Ok(Err(OrchestratorError::AlreadyRunning)) => {
                            let _ = event_tx.send(PipelineEvent::Info(InfoEvent::AlreadyRunning));
                        }
                        Err(e) => {
                            let _ = event_tx.send(PipelineEvent::Info(InfoEvent::Message(format!(
                                "Run join failed: {e}"
                            ))));
                        }
                    }
                    run_ctx = None;
                }
            }
        }
    }
}
