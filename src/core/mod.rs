//! Core orchestration logic.
//!
//! This module contains:
//! - Operation: the trait and the lifecycle engine that runs it
//! - Sequencer: call-order delivery of child completions
//! - Relay: chainable handles over running operations
//! - Registry: reference ids filled when their owner completes
//! - Context: per-run state threaded through the tree

pub mod context;
pub mod operation;
pub mod registry;
pub mod relay;
pub mod sequencer;

// Re-export commonly used types
pub use context::{LifecycleListener, RunContext, RunContextBuilder};
pub use operation::{
    ChildRef, ChildResult, ChildResults, OpContext, Operation, Outcome, Readiness,
};
pub use registry::{
    classify, Bucket, IdShape, Owner, ReferenceEntry, ReferenceRegistry, RegisterOptions,
    RegistrySnapshot, RegistryStore, RegistryView, SerializedRecord, SerializedTree,
};
pub use relay::{ChildFactory, FactoryMap, RelayHandle};
pub use sequencer::{CallRecord, CompletionSequencer, Delivery, SequenceError};
