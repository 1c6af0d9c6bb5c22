//! Filesystem-backed [`FailedBatchSink`] and [`WatermarkStore`] for
//! `sentinel-ingest`. One file per envelope, keyed by
//! [`FailedBatchEnvelope::storage_key`], the same
//! append-one-file-per-call-with-`tokio::fs` idiom as the JSONL telemetry
//! sink, minus the append: each envelope is its own durable record rather
//! than a line in a shared log.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use ninelives::model::FailedBatchEnvelope;
use ninelives::{FailedBatchSink, FailedBatchSinkError, WatermarkStore, WatermarkStoreError};

/// Stores one JSON file per diverted batch under `base_dir`, at the path
/// `base_dir/<storage_key>`. `storage_key` already nests by table name, so
/// each table gets its own subdirectory.
#[derive(Clone, Debug)]
pub struct FileFailedBatchSink {
    base_dir: PathBuf,
}

impl FileFailedBatchSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }
}

fn io_transport(err: std::io::Error) -> FailedBatchSinkError {
    FailedBatchSinkError::Transport(err.to_string())
}

#[async_trait]
impl FailedBatchSink for FileFailedBatchSink {
    async fn store(&self, envelope: FailedBatchEnvelope) -> Result<(), FailedBatchSinkError> {
        let path = self.base_dir.join(envelope.storage_key());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_transport)?;
        }
        let body = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| FailedBatchSinkError::Transport(format!("failed to serialize envelope: {e}")))?;
        tokio::fs::write(&path, body).await.map_err(io_transport)
    }

    async fn list(&self, since: Option<SystemTime>) -> Result<Vec<FailedBatchEnvelope>, FailedBatchSinkError> {
        let mut envelopes = Vec::new();

        let mut table_dirs = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(envelopes),
            Err(e) => return Err(io_transport(e)),
        };

        while let Some(table_dir) = table_dirs.next_entry().await.map_err(io_transport)? {
            if !table_dir.file_type().await.map_err(io_transport)?.is_dir() {
                continue;
            }
            read_envelopes_from(&table_dir.path(), since, &mut envelopes).await?;
        }

        envelopes.sort_by_key(|e| e.sealed_at);
        Ok(envelopes)
    }
}

async fn read_envelopes_from(
    dir: &Path,
    since: Option<SystemTime>,
    out: &mut Vec<FailedBatchEnvelope>,
) -> Result<(), FailedBatchSinkError> {
    let mut files = tokio::fs::read_dir(dir).await.map_err(io_transport)?;
    while let Some(file) = files.next_entry().await.map_err(io_transport)? {
        let body = tokio::fs::read(file.path()).await.map_err(io_transport)?;
        let envelope: FailedBatchEnvelope = serde_json::from_slice(&body)
            .map_err(|e| FailedBatchSinkError::Transport(format!("malformed envelope at {:?}: {e}", file.path())))?;
        if since.map(|cutoff| envelope.sealed_at >= cutoff).unwrap_or(true) {
            out.push(envelope);
        }
    }
    Ok(())
}

/// Persists the watermark as an RFC-3339 timestamp in a single plain-text
/// file at `path`.
#[derive(Clone, Debug)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn load(&self) -> Result<Option<SystemTime>, WatermarkStoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(WatermarkStoreError::Transport(e.to_string())),
        };

        let parsed = time::OffsetDateTime::parse(contents.trim(), &time::format_description::well_known::Rfc3339)
            .map_err(|e| WatermarkStoreError::InvalidTimestamp(e.to_string()))?;
        Ok(Some(SystemTime::from(parsed)))
    }

    async fn store(&self, watermark: SystemTime) -> Result<(), WatermarkStoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| WatermarkStoreError::Transport(e.to_string()))?;
        }
        let formatted = time::OffsetDateTime::from(watermark)
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|e| WatermarkStoreError::Transport(e.to_string()))?;
        tokio::fs::write(&self.path, formatted).await.map_err(|e| WatermarkStoreError::Transport(e.to_string()))
    }
}
