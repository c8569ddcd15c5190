//! oprelay - ordered operation trees, run as a prompt-driven wizard or as
//! chainable async library calls
//!
//! # Architecture
//!
//! The system is built around a lifecycle engine:
//! - Every operation runs in its own task through a fixed lifecycle
//! - A parent sees its children's payloads in the order it called them,
//!   whatever order they actually finished in
//! - Reference ids handed out during a run are filled when their owning
//!   operation completes
//!
//! # Modules
//!
//! - `adapters`: Collaborators (prompts, connection, report sink, fatal hook)
//! - `core`: Lifecycle engine, sequencer, relay handles, reference registry
//! - `domain`: Data structures (ids, state, lifecycle events, errors)
//! - `records`: Record-building operations used by the CLI
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a record tree, prompting for missing values
//! oprelay run tree.yaml --interactive
//!
//! # Run non-interactively with scripted answers, keeping the registry
//! oprelay run tree.yaml --answers answers.yaml --registry refs.json
//!
//! # Inspect a serialized registry
//! oprelay refs refs.json
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod records;

// Re-export main types at crate root for convenience
pub use crate::core::{
    ChildFactory, ChildResult, ChildResults, FactoryMap, OpContext, Operation, Readiness,
    ReferenceRegistry, RelayHandle, RunContext,
};
pub use domain::{LifecycleEvent, LifecycleKind, Mode, OperationId, Payload, RelayError, State};
