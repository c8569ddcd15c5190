//! Lifecycle events raised by running operations.
//!
//! Every operation emits `called`, then optionally `prompting`/`ready`/
//! `executing`, then exactly one of `done` or `error`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::RelayError;
use super::state::{OperationId, Payload};

/// A single lifecycle notification.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    /// The operation this event belongs to
    pub operation: OperationId,

    /// Type name of the operation
    pub type_name: String,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// What happened
    #[serde(flatten)]
    pub kind: LifecycleKind,
}

impl LifecycleEvent {
    /// Create a new event with the current timestamp
    pub fn new(operation: OperationId, type_name: impl Into<String>, kind: LifecycleKind) -> Self {
        Self {
            operation,
            type_name: type_name.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Build an `error` event from a relay error
    pub fn error(operation: OperationId, type_name: impl Into<String>, error: &RelayError) -> Self {
        Self::new(
            operation,
            type_name,
            LifecycleKind::Error {
                message: error.to_string(),
                display: error.display_to_user(),
            },
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            LifecycleKind::Done { .. } | LifecycleKind::Error { .. }
        )
    }
}

/// Lifecycle stages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleKind {
    /// The operation was invoked (raised to its parent first)
    Called { parent: Option<OperationId> },

    /// A prompt batch is about to be asked
    Prompting { batch: usize, prompts: Vec<String> },

    /// Readiness check passed
    Ready,

    /// Execution started
    Executing { interactive: bool },

    /// The operation settled successfully
    Done { payload: Payload },

    /// The operation failed
    Error { message: String, display: bool },
}
