//! Durable sink for batches that could not be delivered to Sentinel.
//!
//! Narrow enough to fake in tests, mirroring [`crate::object_store::ObjectStore`]:
//! a trait with the two operations the router actually needs, plus an
//! in-memory reference implementation. The filesystem-backed implementation
//! lives in the `sentinel-ingest-filesink` crate.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;
use thiserror::Error;

use crate::model::FailedBatchEnvelope;

#[derive(Debug, Error)]
pub enum FailedBatchSinkError {
    #[error("failed-batch sink transport error: {0}")]
    Transport(String),
}

/// Durable store for [`FailedBatchEnvelope`]s, keyed deterministically by
/// [`FailedBatchEnvelope::storage_key`].
#[async_trait]
pub trait FailedBatchSink: Send + Sync {
    async fn store(&self, envelope: FailedBatchEnvelope) -> Result<(), FailedBatchSinkError>;

    /// List envelopes sealed at or after `since`, oldest first.
    async fn list(&self, since: Option<SystemTime>) -> Result<Vec<FailedBatchEnvelope>, FailedBatchSinkError>;
}

/// In-memory reference implementation for tests and small deployments.
#[derive(Default)]
pub struct InMemoryFailedBatchSink {
    envelopes: Mutex<HashMap<String, FailedBatchEnvelope>>,
}

impl InMemoryFailedBatchSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FailedBatchSink for InMemoryFailedBatchSink {
    async fn store(&self, envelope: FailedBatchEnvelope) -> Result<(), FailedBatchSinkError> {
        let key = envelope.storage_key();
        self.envelopes.lock().unwrap().insert(key, envelope);
        Ok(())
    }

    async fn list(&self, since: Option<SystemTime>) -> Result<Vec<FailedBatchEnvelope>, FailedBatchSinkError> {
        let mut envelopes: Vec<FailedBatchEnvelope> = self
            .envelopes
            .lock()
            .unwrap()
            .values()
            .filter(|e| since.map(|cutoff| e.sealed_at >= cutoff).unwrap_or(true))
            .cloned()
            .collect();
        envelopes.sort_by_key(|e| e.sealed_at);
        Ok(envelopes)
    }
}
