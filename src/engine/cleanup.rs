//! Filesystem-walk cleanup operations.
//!
//! Failures here are per item: a locked or vanished file is skipped and
//! counted, and the walk carries on. Only a broken walker task (panic) reaches
//! the orchestrator as a phase failure.

use crate::engine::operation::{MaintenanceOperation, OperationOutcome};
use crate::engine::sink::LineSink;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub files_deleted: u64,
    pub bytes_freed: u64,
    pub dirs_removed: u64,
    pub skipped: u64,
}

impl CleanupStats {
    pub fn merge(&mut self, other: CleanupStats) {
        self.files_deleted += other.files_deleted;
        self.bytes_freed += other.bytes_freed;
        self.dirs_removed += other.dirs_removed;
        self.skipped += other.skipped;
    }

    pub fn freed_mb(&self) -> f64 {
        self.bytes_freed as f64 / (1024.0 * 1024.0)
    }
}

/// Result of trying to delete one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemResult {
    Deleted { bytes: u64 },
    Skipped,
}

fn delete_file(path: &Path) -> ItemResult {
    let removed = fs::symlink_metadata(path).and_then(|meta| {
        fs::remove_file(path)?;
        Ok(meta.len())
    });
    match removed {
        Ok(bytes) => {
            debug!(path = %path.display(), bytes, "deleted file");
            ItemResult::Deleted { bytes }
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "skipped file");
            ItemResult::Skipped
        }
    }
}

/// Delete everything below `root`, keeping `root` itself.
///
/// Directories are removed after their contents; one that still holds a
/// skipped file stays in place.
pub fn clean_dir_contents(root: &Path) -> CleanupStats {
    clean_dir_contents_with(root, delete_file)
}

fn clean_dir_contents_with(root: &Path, delete: impl Fn(&Path) -> ItemResult) -> CleanupStats {
    let mut stats = CleanupStats::default();
    if !root.is_dir() {
        return stats;
    }
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "unreadable entry");
                stats.skipped += 1;
                continue;
            }
        };
        if entry.file_type().is_dir() {
            if fs::remove_dir(entry.path()).is_ok() {
                stats.dirs_removed += 1;
            }
            continue;
        }
        match delete(entry.path()) {
            ItemResult::Deleted { bytes } => {
                stats.files_deleted += 1;
                stats.bytes_freed += bytes;
            }
            ItemResult::Skipped => stats.skipped += 1,
        }
    }
    stats
}

async fn clean_roots(roots: &[PathBuf], sink: &dyn LineSink) -> Result<CleanupStats> {
    let mut total = CleanupStats::default();
    for root in roots {
        sink.on_line(&format!("Scanning {}...", root.display()));
        let owned = root.clone();
        let stats = tokio::task::spawn_blocking(move || clean_dir_contents(&owned))
            .await
            .with_context(|| format!("cleanup of {} did not finish", root.display()))?;
        info!(root = %root.display(), ?stats, "cleaned");
        total.merge(stats);
    }
    Ok(total)
}

/// User and system temp directories, without duplicates.
pub fn temp_roots() -> Vec<PathBuf> {
    let mut roots = vec![std::env::temp_dir()];
    if let Some(system_root) = std::env::var_os("SystemRoot") {
        let win_temp = PathBuf::from(system_root).join("Temp");
        if win_temp.is_dir() {
            roots.push(win_temp);
        }
    }
    roots.dedup();
    roots
}

pub struct TempCleanup {
    roots: Vec<PathBuf>,
}

impl TempCleanup {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn system() -> Self {
        Self::new(temp_roots())
    }
}

#[async_trait]
impl MaintenanceOperation for TempCleanup {
    fn name(&self) -> &str {
        "Temp Files"
    }

    async fn execute(&self, sink: &dyn LineSink) -> Result<OperationOutcome> {
        let stats = clean_roots(&self.roots, sink).await?;
        let summary = format!(
            "Temp Files: Deleted {}, Freed {:.2} MB",
            stats.files_deleted,
            stats.freed_mb()
        );
        sink.on_line(&summary);
        Ok(OperationOutcome::succeeded(summary))
    }
}

const CHROMIUM_CACHES: &[&str] = &[
    "Google/Chrome/User Data/Default/Cache",
    "Google/Chrome/User Data/Default/Code Cache",
    "Microsoft/Edge/User Data/Default/Cache",
    "Microsoft/Edge/User Data/Default/Code Cache",
];

/// Existing Chrome, Edge and Firefox cache directories under `local_app_data`.
pub fn browser_cache_dirs(local_app_data: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = CHROMIUM_CACHES
        .iter()
        .map(|rel| local_app_data.join(rel))
        .filter(|p| p.is_dir())
        .collect();

    let profiles = local_app_data.join("Mozilla/Firefox/Profiles");
    if let Ok(entries) = fs::read_dir(&profiles) {
        let mut caches: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path().join("cache2"))
            .filter(|p| p.is_dir())
            .collect();
        caches.sort();
        found.extend(caches);
    }
    found
}

pub struct BrowserCacheCleanup {
    local_app_data: Option<PathBuf>,
}

impl BrowserCacheCleanup {
    pub fn new(local_app_data: Option<PathBuf>) -> Self {
        Self { local_app_data }
    }

    pub fn system() -> Self {
        Self::new(dirs::data_local_dir())
    }
}

#[async_trait]
impl MaintenanceOperation for BrowserCacheCleanup {
    fn name(&self) -> &str {
        "Browser Cache"
    }

    async fn execute(&self, sink: &dyn LineSink) -> Result<OperationOutcome> {
        let Some(base) = self.local_app_data.as_deref() else {
            let summary = "Browser Cache: local application data directory not found";
            sink.on_line(summary);
            return Ok(OperationOutcome::succeeded(summary));
        };
        sink.on_line("Starting Browser Cleanup...");
        let stats = clean_roots(&browser_cache_dirs(base), sink).await?;
        let summary = format!(
            "Browser Cache: Cleared {} files ({:.2} MB)",
            stats.files_deleted,
            stats.freed_mb()
        );
        sink.on_line(&summary);
        Ok(OperationOutcome::succeeded(summary))
    }
}
