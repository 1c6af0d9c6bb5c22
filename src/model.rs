//! Core data model: Record, TableConfig, Batch, S3Object, CachedSecret,
//! FailedBatchEnvelope.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// A field's declared canonical type, used for schema coercion/validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum FieldType {
    DateTime,
    String,
    Int,
    Long,
    Bool,
    Float,
}

/// One coerced field value inside a [`Record`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum FieldValue {
    DateTime(String), // RFC-3339
    String(String),
    Int(i32),
    Long(i64),
    Bool(bool),
    Float(f64),
}

/// A parsed log event: a canonical RFC-3339 timestamp plus table-specific
/// attributes produced by a parser's transform map.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Record {
    pub timestamp: String,
    pub fields: HashMap<String, FieldValue>,
    /// Set by `prepare` when the table's declared timestamp field was absent
    /// and `timestamp` was substituted with current UTC.
    pub injected_timestamp: bool,
}

impl Record {
    pub fn new(timestamp: impl Into<String>) -> Self {
        Self { timestamp: timestamp.into(), fields: HashMap::new(), injected_timestamp: false }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Approximate serialized byte size used for batch packing decisions.
    pub fn approximate_byte_size(&self) -> usize {
        let mut size = self.timestamp.len() + 16;
        for (k, v) in &self.fields {
            size += k.len()
                + match v {
                    FieldValue::DateTime(s) | FieldValue::String(s) => s.len(),
                    FieldValue::Int(_) => 4,
                    FieldValue::Long(_) => 8,
                    FieldValue::Bool(_) => 1,
                    FieldValue::Float(_) => 8,
                };
        }
        size
    }
}

/// Immutable descriptor for a logical destination table. Loaded once at
/// startup; never mutated.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub table_name: String,
    #[serde(default)]
    pub schema: HashMap<String, FieldType>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    pub max_batch_items: usize,
    pub max_batch_bytes: usize,
    #[serde(default)]
    pub retention_hint_seconds: Option<u64>,
    /// Source field name -> canonical field name.
    #[serde(default)]
    pub transform_map: HashMap<String, String>,
    pub default_timestamp_field: String,
    /// Whether uploads for this table are gzip-compressed.
    #[serde(default)]
    pub gzip: bool,
}

impl TableConfig {
    pub fn retention_hint(&self) -> Option<Duration> {
        self.retention_hint_seconds.map(Duration::from_secs)
    }
}

/// A batch's position in its CREATED -> SEALED -> IN-FLIGHT -> {ACKNOWLEDGED |
/// DIVERTED} lifecycle. No backward transitions are ever performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Created,
    Sealed,
    InFlight,
    Acknowledged,
    Diverted,
}

/// A bounded group of records bound to exactly one table, immutable once sealed.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub table_name: String,
    /// Monotonic sequence number per table, for observability.
    pub sequence: u64,
    pub records: Vec<Record>,
    pub state: BatchState,
    pub sealed_at: Option<SystemTime>,
    /// Correlation id of the ingestion cycle that produced this batch, carried
    /// from the orchestrator's `RequestContext` so a diverted envelope can be
    /// traced back to the cycle that produced it.
    pub correlation_id: Uuid,
}

impl Batch {
    pub fn new(table_name: impl Into<String>, sequence: u64, correlation_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            table_name: table_name.into(),
            sequence,
            records: Vec::new(),
            state: BatchState::Created,
            sealed_at: None,
            correlation_id,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.records.iter().map(Record::approximate_byte_size).sum()
    }

    pub fn item_count(&self) -> usize {
        self.records.len()
    }

    /// Seal the batch, transitioning CREATED -> SEALED. Panics (a caller bug,
    /// not a runtime condition) if called on an already-sealed batch.
    pub fn seal(&mut self, sealed_at: SystemTime) {
        assert_eq!(self.state, BatchState::Created, "cannot seal a batch twice");
        self.state = BatchState::Sealed;
        self.sealed_at = Some(sealed_at);
    }

    pub fn mark_in_flight(&mut self) {
        assert_eq!(self.state, BatchState::Sealed, "batch must be sealed before upload");
        self.state = BatchState::InFlight;
    }

    pub fn mark_acknowledged(&mut self) {
        assert_eq!(self.state, BatchState::InFlight, "batch must be in-flight to acknowledge");
        self.state = BatchState::Acknowledged;
    }

    pub fn mark_diverted(&mut self) {
        assert_eq!(self.state, BatchState::InFlight, "batch must be in-flight to divert");
        self.state = BatchState::Diverted;
    }
}

/// (bucket, key, size, last-modified, etag) — filtered by extension/prefix/
/// last-processed-time before download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Object {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
    pub etag: String,
}

impl S3Object {
    pub fn extension(&self) -> Option<&str> {
        self.key.rsplit('.').next().filter(|ext| *ext != self.key)
    }

    pub fn is_gzip(&self) -> bool {
        self.key.ends_with(".gz")
    }
}

/// A cached, possibly-encrypted secret. Plaintext is derived on demand.
#[derive(Debug, Clone)]
pub struct CachedSecret {
    pub name: String,
    pub ciphertext: Vec<u8>,
    pub fetched_at: SystemTime,
    pub ttl: Duration,
}

impl CachedSecret {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now.duration_since(self.fetched_at).map(|age| age >= self.ttl).unwrap_or(false)
    }
}

/// Error category recorded on a diverted batch, coarse enough for replay
/// tooling to branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ErrorCategory {
    TransientTransport,
    Authorization,
    Validation,
    Configuration,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientTransport => "transient-transport",
            Self::Authorization => "authorization",
            Self::Validation => "validation",
            Self::Configuration => "configuration",
        }
    }
}

/// Persisted JSON document for a batch that could not be delivered.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FailedBatchEnvelope {
    pub batch_id: Uuid,
    pub table_name: String,
    pub sealed_at: SystemTime,
    pub error_category: ErrorCategory,
    pub error_message: String,
    pub attempt_count: usize,
    pub correlation_id: Uuid,
    /// Serialized records with PII fields redacted.
    pub records: Vec<Record>,
}

impl FailedBatchEnvelope {
    /// Deterministic key encoding table, batch id, and sealed-at timestamp,
    /// for use by a durable sink's storage backend.
    pub fn storage_key(&self) -> String {
        let sealed_epoch = self
            .sealed_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("{}/{}-{}.json", self.table_name, sealed_epoch, self.batch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_lifecycle_transitions_forward_only() {
        let mut batch = Batch::new("firewall", 1, Uuid::new_v4());
        assert_eq!(batch.state, BatchState::Created);
        batch.seal(SystemTime::now());
        assert_eq!(batch.state, BatchState::Sealed);
        batch.mark_in_flight();
        assert_eq!(batch.state, BatchState::InFlight);
        batch.mark_acknowledged();
        assert_eq!(batch.state, BatchState::Acknowledged);
    }

    #[test]
    #[should_panic(expected = "cannot seal a batch twice")]
    fn sealing_twice_panics() {
        let mut batch = Batch::new("firewall", 1, Uuid::new_v4());
        batch.seal(SystemTime::now());
        batch.seal(SystemTime::now());
    }

    #[test]
    fn s3_object_extension_and_gzip_detection() {
        let obj = S3Object {
            bucket: "b".into(),
            key: "logs/fw-2025-01-01.gz".into(),
            size: 100,
            last_modified: SystemTime::now(),
            etag: "abc".into(),
        };
        assert_eq!(obj.extension(), Some("gz"));
        assert!(obj.is_gzip());
    }

    #[test]
    fn cached_secret_expiry_boundary() {
        let now = SystemTime::now();
        let secret = CachedSecret {
            name: "s".into(),
            ciphertext: vec![],
            fetched_at: now,
            ttl: Duration::from_secs(60),
        };
        assert!(!secret.is_expired(now + Duration::from_secs(59)));
        assert!(secret.is_expired(now + Duration::from_secs(61)));
    }

    #[test]
    fn failed_batch_envelope_storage_key_encodes_table_and_batch() {
        let envelope = FailedBatchEnvelope {
            batch_id: Uuid::nil(),
            table_name: "firewall".into(),
            sealed_at: SystemTime::UNIX_EPOCH + Duration::from_secs(100),
            error_category: ErrorCategory::TransientTransport,
            error_message: "boom".into(),
            attempt_count: 4,
            correlation_id: Uuid::nil(),
            records: vec![],
        };
        let key = envelope.storage_key();
        assert!(key.starts_with("firewall/100-"));
    }
}
