//! Reporting sinks for the final payload of a run.

use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::Payload;

/// Receives the root payload once readiness and execution have succeeded
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn submit(&self, payload: &Payload) -> Result<()>;
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl ReportSink for NullSink {
    async fn submit(&self, _payload: &Payload) -> Result<()> {
        Ok(())
    }
}

/// Keeps submitted payloads in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    submitted: Mutex<Vec<Payload>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<Payload> {
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn submit(&self, payload: &Payload) -> Result<()> {
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.clone());
        Ok(())
    }
}
