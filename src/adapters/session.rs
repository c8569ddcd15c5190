//! Connection accessor.
//!
//! The engine treats the current connection as read-mostly configuration:
//! operations read it, only the caller that owns the run replaces it.

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Target org/session an operation tree works against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Short name the connection is known by
    pub alias: String,

    /// Base URL of the instance
    #[serde(default)]
    pub instance_url: Option<String>,

    /// API version requested for calls made by operations
    #[serde(default)]
    pub api_version: Option<String>,
}

impl Connection {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            instance_url: None,
            api_version: None,
        }
    }
}

/// Get-current / set-current accessor over the active connection
#[derive(Debug, Default)]
pub struct ConnectionProvider {
    current: RwLock<Option<Connection>>,
}

impl ConnectionProvider {
    pub fn new(initial: Option<Connection>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Snapshot of the active connection
    pub fn current(&self) -> Option<Connection> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the active connection, returning the previous one
    pub fn set_current(&self, connection: Option<Connection>) -> Option<Connection> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, connection)
    }
}
