//! Error taxonomy for operation runs and the reference registry.

use std::fmt;

use thiserror::Error;

use super::state::Payload;

/// Why an operation's readiness check failed
#[derive(Debug, Clone, PartialEq)]
pub enum Reason {
    /// Plain description
    Text(String),

    /// Machine-readable reason (e.g. a list of missing fields)
    Structured(Payload),
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{}", text),
            Self::Structured(value) => write!(f, "{}", value),
        }
    }
}

impl From<&str> for Reason {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Reason {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Marker error for failures that should be shown to the user.
///
/// Return it (or wrap it with `anyhow::Context`) from an operation body to
/// have the resulting execution error flagged for display.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct UserFacing(pub String);

/// Errors raised while registering or parsing reference ids
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Reference key must not be empty")]
    EmptyKey,

    #[error("Custom reference key '{key}' contains reserved separator '{separator}'")]
    ReservedSeparator { key: String, separator: char },

    #[error("Custom reference key '{0}' already exists")]
    DuplicateKey(String),

    #[error("Reference prefix must not be empty")]
    EmptyPrefix,

    #[error("Reference id '{0}' appears more than once in the serialized tree")]
    DuplicateId(String),

    #[error("Reference id '{0}' not found")]
    UnknownId(String),

    #[error("Reference counter for prefix '{0}' is exhausted")]
    CounterExhausted(String),
}

/// Errors surfaced by the operation engine
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Readiness check returned a failure description
    #[error("{operation} is not ready: {reason}")]
    Validation { operation: String, reason: Reason },

    /// Failure thrown by an operation body or one of its hooks
    #[error("{operation} failed: {message}")]
    Execution {
        operation: String,
        message: String,
        display: bool,
    },

    /// An operation tried to settle out of protocol; always an implementation bug
    #[error("Protocol violation in {operation}: {detail}")]
    ProtocolViolation { operation: String, detail: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{operation} exposes no call named '{name}'")]
    UnknownCall { operation: String, name: String },

    #[error("A root handle already exists for this run")]
    RootExists,

    /// Chained calls are only ordered on a single-threaded scheduler
    #[error("Runs need a current-thread tokio runtime, found {0}")]
    UnsupportedRuntime(String),

    #[error("Run aborted: {cause}")]
    Aborted { cause: Box<RelayError> },
}

impl RelayError {
    /// Wrap an error thrown by operation code.
    ///
    /// Relay errors propagated with `?` (registry failures, a child's
    /// outcome) are passed through unchanged.
    pub fn execution(operation: impl Into<String>, error: anyhow::Error) -> Self {
        let error = match error.downcast::<RelayError>() {
            Ok(relay) => return relay,
            Err(error) => error,
        };
        let display = error.chain().any(|cause| cause.is::<UserFacing>());
        Self::Execution {
            operation: operation.into(),
            message: format!("{:#}", error),
            display,
        }
    }

    pub fn protocol(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Errors that skip the parent's recoverability decision
    pub fn is_always_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation { .. } | Self::Registry(_) | Self::Aborted { .. }
        )
    }

    /// Whether the error should be surfaced on the user-facing channel
    pub fn display_to_user(&self) -> bool {
        match self {
            Self::Validation { .. } | Self::Registry(_) | Self::UnknownCall { .. } => true,
            Self::Execution { display, .. } => *display,
            Self::ProtocolViolation { .. } | Self::RootExists | Self::UnsupportedRuntime(_) => {
                false
            }
            Self::Aborted { cause } => cause.display_to_user(),
        }
    }
}
