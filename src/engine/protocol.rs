//! The Resurrection Protocol: the fixed maintenance pipeline.

use crate::engine::cleanup::{BrowserCacheCleanup, TempCleanup};
use crate::engine::encoding::EncodingResolver;
use crate::engine::filter::{BlankLineFilter, PhraseFilter};
use crate::engine::operation::{CommandOperation, MaintenanceOperation, SequenceOperation};
use crate::engine::pipeline::Phase;
use crate::engine::restore::RestorePointOperation;
use crate::engine::runner::{Command, StreamingProcessRunner};
use crate::model::{PhaseKind, RunConfig};
use tracing::info;

pub const PROTOCOL_NAME: &str = "Resurrection Protocol";

const EMPTY_RECYCLE_BIN: &str =
    "powershell.exe -NoProfile -Command \"Clear-RecycleBin -Force -ErrorAction SilentlyContinue\"";

/// Shell lines a phase issues, in order. Empty for filesystem-only phases.
pub fn shell_lines(kind: PhaseKind, drive: &str) -> Vec<String> {
    match kind {
        PhaseKind::Safety | PhaseKind::Browser => Vec::new(),
        PhaseKind::Junk => vec![EMPTY_RECYCLE_BIN.to_string()],
        PhaseKind::Network => vec!["ipconfig /flushdns".into(), "netsh winsock reset".into()],
        PhaseKind::Optimize => vec![format!("defrag {drive} /O")],
        PhaseKind::DiskScan => vec![format!("chkdsk {drive} /scan /perf")],
        PhaseKind::Dism => vec!["DISM /Online /Cleanup-Image /CheckHealth".into()],
        PhaseKind::Sfc => vec!["sfc /scannow".into()],
    }
}

/// Phases selected by `cfg`, in protocol order.
pub fn selected_kinds(cfg: &RunConfig) -> Vec<PhaseKind> {
    PhaseKind::ALL
        .into_iter()
        .filter(|kind| !cfg.skip.contains(kind))
        .collect()
}

pub fn build_phases(cfg: &RunConfig) -> Vec<Phase> {
    let resolver = EncodingResolver::from_labels(&cfg.encodings);
    info!(encodings = ?resolver.candidate_names(), drive = %cfg.drive, "building protocol");
    let runner = StreamingProcessRunner::new(resolver);
    selected_kinds(cfg)
        .into_iter()
        .map(|kind| Phase::new(kind.label(), operation_for(kind, cfg, &runner)))
        .collect()
}

fn operation_for(
    kind: PhaseKind,
    cfg: &RunConfig,
    runner: &StreamingProcessRunner,
) -> Box<dyn MaintenanceOperation> {
    let timeout = cfg.command_timeout;
    let command = |line: String, desc: &str| -> Box<dyn MaintenanceOperation> {
        Box::new(CommandOperation::new(
            Command::shell(line, desc)
                .with_filter(BlankLineFilter)
                .with_timeout(timeout),
            runner.clone(),
        ))
    };
    let scan = |line: String, desc: &str| -> Box<dyn MaintenanceOperation> {
        Box::new(CommandOperation::new(
            Command::shell(line, desc)
                .with_filter(PhraseFilter::health_scan())
                .with_timeout(timeout),
            runner.clone(),
        ))
    };
    let mut lines = shell_lines(kind, &cfg.drive).into_iter();
    let mut next = || lines.next().unwrap_or_default();

    match kind {
        PhaseKind::Safety => Box::new(
            RestorePointOperation::new(&cfg.drive, &cfg.restore_description, runner.clone())
                .with_timeout(timeout),
        ),
        PhaseKind::Browser => Box::new(BrowserCacheCleanup::system()),
        PhaseKind::Junk => Box::new(SequenceOperation::new(
            kind.label(),
            vec![
                Box::new(TempCleanup::system()) as Box<dyn MaintenanceOperation>,
                command(next(), "Recycle Bin"),
            ],
        )),
        PhaseKind::Network => Box::new(SequenceOperation::new(
            kind.label(),
            vec![command(next(), "DNS Flush"), command(next(), "Winsock Reset")],
        )),
        PhaseKind::Optimize => Box::new(CommandOperation::new(
            Command::shell(next(), "Optimization")
                .with_filter(PhraseFilter::defrag())
                .with_timeout(timeout),
            runner.clone(),
        )),
        PhaseKind::DiskScan => scan(next(), "CHKDSK Scan"),
        PhaseKind::Dism => scan(next(), "DISM Check"),
        PhaseKind::Sfc => scan(next(), "SFC Scan"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_protocol_has_eight_phases_in_order() {
        let labels: Vec<String> = build_phases(&RunConfig::default())
            .into_iter()
            .map(|p| p.label)
            .collect();
        assert_eq!(
            labels,
            vec![
                "Safety Backup",
                "Browser Cleanup",
                "System Junk Cleanup",
                "Network Reset",
                "Disk Defrag/Trim",
                "Disk Health Scan",
                "DISM Health Check",
                "Integrity Scan (SFC)",
            ]
        );
    }

    #[test]
    fn skipping_keeps_relative_order() {
        let cfg = RunConfig {
            skip: vec![PhaseKind::Sfc, PhaseKind::Safety, PhaseKind::Network],
            ..RunConfig::default()
        };
        assert_eq!(
            selected_kinds(&cfg),
            vec![
                PhaseKind::Browser,
                PhaseKind::Junk,
                PhaseKind::Optimize,
                PhaseKind::DiskScan,
                PhaseKind::Dism,
            ]
        );
        assert_eq!(build_phases(&cfg).len(), 5);
    }

    #[test]
    fn disk_phases_target_configured_drive() {
        assert_eq!(shell_lines(PhaseKind::Optimize, "D:"), vec!["defrag D: /O"]);
        assert_eq!(
            shell_lines(PhaseKind::DiskScan, "D:"),
            vec!["chkdsk D: /scan /perf"]
        );
        assert!(shell_lines(PhaseKind::Browser, "D:").is_empty());
    }

    #[test]
    fn operations_are_named_after_their_work() {
        let phases = build_phases(&RunConfig::default());
        let names: Vec<&str> = phases.iter().map(|p| p.operation.name()).collect();
        assert_eq!(
            names,
            vec![
                "Restore Point",
                "Browser Cache",
                "System Junk Cleanup",
                "Network Reset",
                "Optimization",
                "CHKDSK Scan",
                "DISM Check",
                "SFC Scan",
            ]
        );
    }
}
