//! Collaborator interfaces for the engine.
//!
//! Adapters connect a run to the outside world: where prompt answers come
//! from, which connection is active, where the final payload goes, and what
//! happens when an error turns out to be unrecoverable.

pub mod prompt;
pub mod session;
pub mod sink;

use tracing::error;

use crate::domain::RelayError;

pub use prompt::{
    Answers, BatchQueue, LinePrompter, Prompt, PromptBatch, PromptKind, PromptPlan,
    PromptProvider, ScriptedPrompter,
};
pub use session::{Connection, ConnectionProvider};
pub use sink::{MemorySink, NullSink, ReportSink};

/// Decides what an unrecoverable error does to the process.
///
/// Called at most once per run.
pub trait FatalHook: Send + Sync {
    fn on_fatal(&self, error: &RelayError);
}

/// Logs the error and leaves termination to whoever awaits the root
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFatal;

impl FatalHook for LogFatal {
    fn on_fatal(&self, err: &RelayError) {
        error!(error = %err, "Unrecoverable error, aborting run");
    }
}

/// User-facing output channel for errors flagged for display
pub trait UserChannel: Send + Sync {
    fn show(&self, message: &str);
}

/// Writes to stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrChannel;

impl UserChannel for StderrChannel {
    fn show(&self, message: &str) {
        eprintln!("error: {}", message);
    }
}
