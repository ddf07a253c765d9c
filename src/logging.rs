//! File logging setup.
//!
//! The TUI owns the terminal, so diagnostics always go to a log file.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "panacea=info";

/// `<documents>/SystemOptimizer/panacea.log`, or the local data dir when there
/// is no documents folder.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::document_dir()
        .or_else(dirs::data_local_dir)
        .map(|base| base.join("SystemOptimizer").join("panacea.log"))
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

/// Install the global subscriber. Returns the log path in use, or `None` when
/// logging is disabled because the file could not be opened.
pub fn init_tracing(path: Option<PathBuf>) -> Option<PathBuf> {
    let path = path.or_else(default_log_path)?;
    let file = match open_log_file(&path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("logging disabled: {e:#}");
            return None;
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_env_filter(filter)
        .try_init()
        .ok()?;
    Some(path)
}
