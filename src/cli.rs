use crate::engine::protocol::{self, PROTOCOL_NAME};
use crate::engine::PhaseOrchestrator;
use crate::model::{PhaseKind, PipelineEvent, RunConfig, RunReport};
use crate::orchestrator::{process_run_completion, spawn_run};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "panacea",
    version,
    about = "Runs the Resurrection Protocol maintenance pipeline with an optional TUI"
)]
pub struct Cli {
    /// Print the run report as JSON and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Stream the execution log as text and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (requires --json)
    #[arg(long)]
    pub silent: bool,

    /// Do not ask for confirmation before starting
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Drive targeted by the defrag and disk scan phases
    #[arg(long, default_value = "C:")]
    pub drive: String,

    /// Leave out a phase (repeatable)
    #[arg(long, value_enum)]
    pub skip: Vec<PhaseKind>,

    /// List the protocol phases and the commands they run, then exit
    #[arg(long)]
    pub list_phases: bool,

    /// Encodings tried in order when decoding tool output
    #[arg(long, value_delimiter = ',', default_values = ["utf-8", "windows-1252"])]
    pub encodings: Vec<String>,

    /// Kill a command that runs longer than this (e.g. 30m). No limit by default
    #[arg(long)]
    pub command_timeout: Option<humantime::Duration>,

    /// Description given to the restore point
    #[arg(long, default_value = "Panacea Auto-Restore")]
    pub restore_description: String,

    /// Export the run report as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Use --start-on-launch true to start the protocol as soon as the TUI opens
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub start_on_launch: bool,

    /// Write the diagnostic log here instead of the default location
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    if args.list_phases {
        for line in phase_listing(&build_config(&args)) {
            println!("{line}");
        }
        return Ok(());
    }

    // Silent mode takes precedence over other output modes
    if args.silent {
        return run_report(args, true).await;
    }

    if !args.json && !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_text(args).await;
        }
    }

    if args.json {
        return run_report(args, false).await;
    }

    run_text(args).await
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    RunConfig {
        drive: args.drive.clone(),
        skip: args.skip.clone(),
        encodings: args.encodings.clone(),
        command_timeout: args.command_timeout.map(Duration::from),
        restore_description: args.restore_description.clone(),
    }
}

fn phase_listing(cfg: &RunConfig) -> Vec<String> {
    let kinds = protocol::selected_kinds(cfg);
    let total = kinds.len();
    let mut lines = vec![format!("{PROTOCOL_NAME} ({total} phases)")];
    for (i, kind) in kinds.into_iter().enumerate() {
        let name = kind
            .to_possible_value()
            .map(|v| v.get_name().to_string())
            .unwrap_or_default();
        lines.push(format!("{}/{total} {} [{name}]", i + 1, kind.label()));
        for cmd in protocol::shell_lines(kind, &cfg.drive) {
            lines.push(format!("      $ {cmd}"));
        }
    }
    lines
}

/// Ask on stderr whether to go ahead. Anything but y/yes declines.
fn confirm_start(input: &mut impl BufRead) -> Result<bool> {
    eprint!(
        "This will create a restore point, delete temporary files and run the disk and system \
         integrity tools. Continue? [y/N] "
    );
    std::io::stderr().flush().ok();
    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn ensure_confirmed(args: &Cli) -> Result<()> {
    if args.yes || args.silent {
        return Ok(());
    }
    if !confirm_start(&mut std::io::stdin().lock())? {
        anyhow::bail!("cancelled by user");
    }
    Ok(())
}

/// Turn a failed outcome into an error so the process exits non-zero.
fn outcome_result(report: &RunReport) -> Result<()> {
    match &report.outcome {
        crate::model::RunOutcome::Completed => Ok(()),
        crate::model::RunOutcome::Failed(reason) => {
            Err(anyhow::anyhow!("{} failed: {reason}", report.pipeline))
        }
    }
}

/// Run the protocol and print the report as JSON.
/// `silent` suppresses all output; errors still propagate.
async fn run_report(args: Cli, silent: bool) -> Result<()> {
    ensure_confirmed(&args)?;
    let cfg = build_config(&args);
    let (out_tx, out_handle) = if silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };

    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<PipelineEvent>();
    let orchestrator = Arc::new(PhaseOrchestrator::new(PROTOCOL_NAME));
    let handle = spawn_run(orchestrator, &cfg, evt_tx);

    // Events are drained so the channel does not grow; JSON mode reports at the end.
    while evt_rx.recv().await.is_some() {}

    let report = handle
        .await
        .context("protocol task failed")?
        .context("protocol could not start")?;

    let processed = process_run_completion(&args, &report);
    if let Some(tx) = out_tx.as_ref() {
        let out = serde_json::to_string_pretty(&report)?;
        let _ = tx.send(OutputLine::Stdout(out));
        for msg in &processed.export_messages {
            let _ = tx.send(OutputLine::Stderr(msg.clone()));
        }
    }

    drop(out_tx);
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }
    if let Some(err) = processed.export_error {
        return Err(err);
    }

    outcome_result(&report)
}

async fn run_text(args: Cli) -> Result<()> {
    ensure_confirmed(&args)?;
    let cfg = build_config(&args);
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<PipelineEvent>();
    let orchestrator = Arc::new(PhaseOrchestrator::new(PROTOCOL_NAME));
    let handle = spawn_run(orchestrator, &cfg, evt_tx);

    let mut interrupted = false;
    loop {
        tokio::select! {
            ev = evt_rx.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    PipelineEvent::Line { level, text } => {
                        let _ = out_tx.send(OutputLine::Stdout(
                            crate::text_summary::format_log_line(level, &text),
                        ));
                    }
                    PipelineEvent::Progress { fraction, label } => {
                        let _ = out_tx.send(OutputLine::Stderr(
                            crate::text_summary::format_progress(fraction, &label),
                        ));
                    }
                    PipelineEvent::Info(info) => {
                        let _ = out_tx.send(OutputLine::Stderr(info.to_message()));
                    }
                    PipelineEvent::RunFinished { .. } | PipelineEvent::RunCompleted { .. } => {}
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                // Started tools are not killed; only the sequence stops.
                interrupted = true;
                handle.abort();
                let _ = out_tx.send(OutputLine::Stderr(
                    crate::model::InfoEvent::RunAbandoned.to_message(),
                ));
            }
        }
    }

    let joined = handle.await;
    if interrupted {
        drop(out_tx);
        let _ = out_handle.await;
        anyhow::bail!("interrupted");
    }
    let report = joined
        .context("protocol task failed")?
        .context("protocol could not start")?;

    let processed = process_run_completion(&args, &report);
    for line in processed.summary {
        let _ = out_tx.send(OutputLine::Stdout(line));
    }
    for msg in processed.export_messages {
        let _ = out_tx.send(OutputLine::Stderr(msg));
    }
    drop(out_tx);
    let _ = out_handle.await;
    if let Some(err) = processed.export_error {
        return Err(err);
    }

    outcome_result(&report)
}
