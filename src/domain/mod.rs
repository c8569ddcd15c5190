//! Domain types for the oprelay engine.
//!
//! This module contains the core data structures:
//! - State: operation ids, arguments/answers and run modes
//! - Events: lifecycle notifications raised by running operations
//! - Error: the error taxonomy shared by the engine and the registry

pub mod error;
pub mod events;
pub mod state;

// Re-export commonly used types
pub use error::{Reason, RegistryError, RelayError, UserFacing};
pub use events::{LifecycleEvent, LifecycleKind};
pub use state::{Mode, OperationId, Payload, State};
