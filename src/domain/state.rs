//! Operation identity, state and run mode.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result value produced by an operation.
pub type Payload = serde_json::Value;

/// Arguments and prompt answers held by an operation while it runs.
pub type State = serde_json::Map<String, Payload>;

/// Unique identifier of one operation instance within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Allocate a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How operations in a run gather their input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Prompt-driven wizard: prompt plans are drained before readiness
    Interactive,

    /// Chainable library call: state comes only from call arguments
    #[default]
    Library,
}

impl Mode {
    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::Interactive)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interactive" | "wizard" => Ok(Self::Interactive),
            "library" | "lib" => Ok(Self::Library),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interactive => write!(f, "interactive"),
            Self::Library => write!(f, "library"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("interactive".parse::<Mode>(), Ok(Mode::Interactive));
        assert_eq!(" Library ".parse::<Mode>(), Ok(Mode::Library));
        assert!("batch".parse::<Mode>().is_err());
        assert_eq!(Mode::default(), Mode::Library);
    }

    #[test]
    fn test_operation_ids_are_unique() {
        assert_ne!(OperationId::new(), OperationId::new());
    }
}
