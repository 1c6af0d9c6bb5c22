//! Persisted last-processed-time cursor, an external collaborator's job per
//! the object-store and secret-store protocols: a narrow trait plus an
//! in-memory reference implementation. The filesystem-backed implementation
//! lives in the `sentinel-ingest-filesink` crate.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatermarkStoreError {
    #[error("watermark store transport error: {0}")]
    Transport(String),
    #[error("stored watermark is not a valid RFC-3339 timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Loads and persists the single last-processed-time scalar the orchestrator
/// advances after every cycle.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self) -> Result<Option<SystemTime>, WatermarkStoreError>;
    async fn store(&self, watermark: SystemTime) -> Result<(), WatermarkStoreError>;
}

/// In-memory reference implementation for tests; does not survive a restart.
#[derive(Default)]
pub struct InMemoryWatermarkStore {
    watermark: Mutex<Option<SystemTime>>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn load(&self) -> Result<Option<SystemTime>, WatermarkStoreError> {
        Ok(*self.watermark.lock().unwrap())
    }

    async fn store(&self, watermark: SystemTime) -> Result<(), WatermarkStoreError> {
        *self.watermark.lock().unwrap() = Some(watermark);
        Ok(())
    }
}
