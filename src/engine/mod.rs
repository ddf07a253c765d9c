pub mod cleanup;
pub mod encoding;
pub mod filter;
pub mod operation;
pub mod pipeline;
pub mod protocol;
pub mod restore;
pub mod runner;
pub mod sink;

pub use pipeline::{OrchestratorError, PhaseOrchestrator};
pub use sink::EventSink;
