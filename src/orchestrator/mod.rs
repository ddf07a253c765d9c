//! Application-level orchestration utilities.
//!
//! This module owns run lifecycle control (start/quit) and post-run processing
//! such as the summary and JSON export. UI/CLI layers call into this module to
//! keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{run_controller, spawn_run, UiCommand};
pub(crate) use post_process::process_run_completion;
