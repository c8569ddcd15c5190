//! Call-order delivery of child completions.
//!
//! Children of one parent settle in whatever order their work finishes.
//! The sequencer keeps one slot per child, appended when the child is
//! called, and releases completed payloads strictly in call order: a slot is
//! delivered only once every slot before it has been delivered or failed.

use std::collections::HashMap;

use thiserror::Error;

use crate::domain::{OperationId, Payload};

/// Per-child bookkeeping held by the parent
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// The child operation
    pub child: OperationId,

    /// Type name of the child
    pub type_name: String,

    /// Payload reported by the child (None until done, or when it failed)
    pub payload: Option<Payload>,

    /// Terminal status reported
    pub done: bool,

    /// Handed to the parent (or skipped because it failed)
    pub filled: bool,

    /// Terminal status was an error
    pub failed: bool,
}

/// A payload released to the parent
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Position in call order
    pub index: usize,
    pub child: OperationId,
    pub type_name: String,
    pub payload: Payload,
}

/// Bookkeeping errors; each one means a child broke the call protocol
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("child {0} was called twice")]
    DuplicateCall(OperationId),

    #[error("child {0} reported without being called")]
    UnknownChild(OperationId),

    #[error("child {0} reported a terminal status twice")]
    AlreadyTerminal(OperationId),
}

/// Reorders child completions into call order
#[derive(Debug, Default)]
pub struct CompletionSequencer {
    slots: Vec<CallRecord>,
    index: HashMap<OperationId, usize>,
    /// First slot not yet filled; never moves backwards
    cursor: usize,
    terminal: usize,
}

impl CompletionSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a slot for a newly called child. Returns its call position.
    pub fn called(
        &mut self,
        child: OperationId,
        type_name: impl Into<String>,
    ) -> Result<usize, SequenceError> {
        if self.index.contains_key(&child) {
            return Err(SequenceError::DuplicateCall(child));
        }

        let position = self.slots.len();
        self.slots.push(CallRecord {
            child,
            type_name: type_name.into(),
            payload: None,
            done: false,
            filled: false,
            failed: false,
        });
        self.index.insert(child, position);
        Ok(position)
    }

    /// Record a successful completion and release everything now in order.
    pub fn complete(
        &mut self,
        child: OperationId,
        payload: Payload,
    ) -> Result<Vec<Delivery>, SequenceError> {
        let slot = self.terminate(child)?;
        slot.payload = Some(payload);
        Ok(self.release())
    }

    /// Record a failure.
    ///
    /// The slot is filled immediately (the caller handles the error without
    /// waiting for earlier slots) so it never blocks later children.
    pub fn fail(&mut self, child: OperationId) -> Result<Vec<Delivery>, SequenceError> {
        let slot = self.terminate(child)?;
        slot.failed = true;
        slot.filled = true;
        Ok(self.release())
    }

    fn terminate(&mut self, child: OperationId) -> Result<&mut CallRecord, SequenceError> {
        let position = *self
            .index
            .get(&child)
            .ok_or(SequenceError::UnknownChild(child))?;
        let slot = &mut self.slots[position];
        if slot.done {
            return Err(SequenceError::AlreadyTerminal(child));
        }
        slot.done = true;
        self.terminal += 1;
        Ok(slot)
    }

    /// Scan forward from the cursor, filling done slots until the first pending one.
    fn release(&mut self) -> Vec<Delivery> {
        let mut released = Vec::new();

        while let Some(slot) = self.slots.get_mut(self.cursor) {
            if !slot.done {
                break;
            }
            if !slot.filled {
                slot.filled = true;
                if let Some(payload) = &slot.payload {
                    released.push(Delivery {
                        index: self.cursor,
                        child: slot.child,
                        type_name: slot.type_name.clone(),
                        payload: payload.clone(),
                    });
                }
            }
            self.cursor += 1;
        }

        released
    }

    pub fn type_name_of(&self, child: OperationId) -> Option<&str> {
        self.index
            .get(&child)
            .map(|&position| self.slots[position].type_name.as_str())
    }

    pub fn records(&self) -> &[CallRecord] {
        &self.slots
    }

    pub fn called_count(&self) -> usize {
        self.slots.len()
    }

    pub fn terminal_count(&self) -> usize {
        self.terminal
    }

    /// Every called child has reported done or error
    pub fn is_settled(&self) -> bool {
        self.terminal == self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call_n(seq: &mut CompletionSequencer, n: usize) -> Vec<OperationId> {
        (0..n)
            .map(|i| {
                let id = OperationId::new();
                seq.called(id, format!("child{}", i)).unwrap();
                id
            })
            .collect()
    }

    #[test]
    fn test_zero_children_is_settled() {
        let seq = CompletionSequencer::new();
        assert!(seq.is_settled());
        assert_eq!(seq.called_count(), 0);
    }

    #[test]
    fn test_in_order_completion_releases_immediately() {
        let mut seq = CompletionSequencer::new();
        let ids = call_n(&mut seq, 2);

        let out = seq.complete(ids[0], json!("a")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, json!("a"));

        let out = seq.complete(ids[1], json!("b")).unwrap();
        assert_eq!(out[0].index, 1);
        assert!(seq.is_settled());
    }

    #[test]
    fn test_out_of_order_completion_is_held_back() {
        let mut seq = CompletionSequencer::new();
        let ids = call_n(&mut seq, 3);

        assert!(seq.complete(ids[2], json!(3)).unwrap().is_empty());
        assert!(seq.complete(ids[1], json!(2)).unwrap().is_empty());
        assert!(!seq.is_settled());

        let out = seq.complete(ids[0], json!(1)).unwrap();
        let payloads: Vec<_> = out.iter().map(|d| d.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(1), json!(2), json!(3)]);
        assert!(seq.records().iter().all(|r| r.filled));
    }

    #[test]
    fn test_failure_unblocks_later_slots() {
        let mut seq = CompletionSequencer::new();
        let ids = call_n(&mut seq, 3);

        assert!(seq.complete(ids[1], json!("b")).unwrap().is_empty());

        let out = seq.fail(ids[0]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].child, ids[1]);

        let record = &seq.records()[0];
        assert!(record.done && record.filled && record.failed);
        assert!(record.payload.is_none());

        let out = seq.complete(ids[2], json!("c")).unwrap();
        assert_eq!(out[0].index, 2);
        assert!(seq.is_settled());
    }

    #[test]
    fn test_failure_behind_pending_slot_stays_filled() {
        let mut seq = CompletionSequencer::new();
        let ids = call_n(&mut seq, 3);

        assert!(seq.fail(ids[1]).unwrap().is_empty());
        assert!(seq.complete(ids[2], json!("c")).unwrap().is_empty());

        let out = seq.complete(ids[0], json!("a")).unwrap();
        let children: Vec<_> = out.iter().map(|d| d.child).collect();
        assert_eq!(children, vec![ids[0], ids[2]]);
    }

    #[test]
    fn test_protocol_errors() {
        let mut seq = CompletionSequencer::new();
        let ids = call_n(&mut seq, 1);

        assert_eq!(
            seq.called(ids[0], "again"),
            Err(SequenceError::DuplicateCall(ids[0]))
        );

        let stranger = OperationId::new();
        assert_eq!(
            seq.complete(stranger, json!(null)),
            Err(SequenceError::UnknownChild(stranger))
        );

        seq.complete(ids[0], json!(1)).unwrap();
        assert_eq!(seq.fail(ids[0]), Err(SequenceError::AlreadyTerminal(ids[0])));
        assert_eq!(seq.terminal_count(), 1);
    }

    #[test]
    fn test_reverse_completion_of_many_children() {
        let mut seq = CompletionSequencer::new();
        let ids = call_n(&mut seq, 50);

        for (i, id) in ids.iter().enumerate().skip(1).rev() {
            assert!(seq.complete(*id, json!(i)).unwrap().is_empty());
        }

        let out = seq.complete(ids[0], json!(0)).unwrap();
        let order: Vec<_> = out.iter().map(|d| d.index).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
        assert_eq!(seq.type_name_of(ids[7]), Some("child7"));
    }
}
