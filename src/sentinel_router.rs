//! Routes parsed records to Azure Monitor / Sentinel: resolves a table,
//! validates and coerces each record, packs records into size/count-bounded
//! batches, and uploads each batch over HTTPS with retry + circuit breaker,
//! diverting whatever still fails to the failed-batch sink.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::credential_broker::CredentialBroker;
use crate::failed_batch_sink::FailedBatchSink;
use crate::ingest_error::IngestError;
use crate::metrics::{self, MetricSink};
use crate::model::{Batch, ErrorCategory, FailedBatchEnvelope, FieldType, FieldValue, Record, TableConfig};
use crate::{CircuitBreakerPolicy, ResilienceError, RetryPolicy};

const SENTINEL_AAD_TOKEN_SECRET: &str = "sentinel-aad-token";
const API_VERSION: &str = "2023-01-01";

#[derive(Debug, Error)]
pub enum SentinelUploadError {
    #[error("sentinel upload returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport error calling sentinel: {0}")]
    Transport(String),
}

/// Classifies a [`SentinelUploadError`] for use as a [`RetryPolicy::should_retry`]
/// predicate: 408/429/500/502/503/504 are retryable, everything else is not.
pub fn is_retryable_upload_error(err: &SentinelUploadError) -> bool {
    match err {
        SentinelUploadError::Http { status, .. } => {
            matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
        }
        SentinelUploadError::Transport(_) => true,
    }
}

/// Aggregate outcome of one [`SentinelRouter::route`] call.
#[derive(Debug, Clone)]
pub struct RouteResult {
    pub processed: usize,
    pub failed: usize,
    pub batch_count: usize,
    pub dropped: usize,
    pub start_time: SystemTime,
}

fn current_utc_rfc3339() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339).expect("OffsetDateTime::now_utc always formats")
}

fn coerce_field(value: &FieldValue, target: FieldType, field: &str) -> Result<FieldValue, String> {
    let invalid = || format!("field {field} cannot be coerced to {target:?}");
    match (target, value) {
        (FieldType::String, FieldValue::String(s)) => Ok(FieldValue::String(s.clone())),
        (FieldType::DateTime, FieldValue::DateTime(s) | FieldValue::String(s)) => {
            Ok(FieldValue::DateTime(s.clone()))
        }
        (FieldType::String, other) => Ok(FieldValue::String(display_field(other))),
        (FieldType::Int, FieldValue::Int(i)) => Ok(FieldValue::Int(*i)),
        (FieldType::Int, FieldValue::Long(l)) => i32::try_from(*l).map(FieldValue::Int).map_err(|_| invalid()),
        (FieldType::Int, FieldValue::String(s)) => s.parse::<i32>().map(FieldValue::Int).map_err(|_| invalid()),
        (FieldType::Long, FieldValue::Long(l)) => Ok(FieldValue::Long(*l)),
        (FieldType::Long, FieldValue::Int(i)) => Ok(FieldValue::Long(*i as i64)),
        (FieldType::Long, FieldValue::String(s)) => s.parse::<i64>().map(FieldValue::Long).map_err(|_| invalid()),
        (FieldType::Bool, FieldValue::Bool(b)) => Ok(FieldValue::Bool(*b)),
        (FieldType::Bool, FieldValue::String(s)) => s.parse::<bool>().map(FieldValue::Bool).map_err(|_| invalid()),
        (FieldType::Float, FieldValue::Float(f)) => Ok(FieldValue::Float(*f)),
        (FieldType::Float, FieldValue::Int(i)) => Ok(FieldValue::Float(*i as f64)),
        (FieldType::Float, FieldValue::Long(l)) => Ok(FieldValue::Float(*l as f64)),
        (FieldType::Float, FieldValue::String(s)) => s.parse::<f64>().map(FieldValue::Float).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn display_field(value: &FieldValue) -> String {
    match value {
        FieldValue::String(s) | FieldValue::DateTime(s) => s.clone(),
        FieldValue::Int(i) => i.to_string(),
        FieldValue::Long(l) => l.to_string(),
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Float(f) => f.to_string(),
    }
}

/// Outcome of admitting one raw record into a table: either it is ready to
/// pack into a batch, or it was dropped with a reason for observability.
enum Prepared {
    Ready(Record),
    Dropped(String),
}

/// Rename fields per the table's transform map, coerce to the declared
/// schema, inject a timestamp when absent, and enforce required fields.
/// Never panics; any failure drops only this record.
fn prepare(record: Record, table: &TableConfig) -> Prepared {
    let mut fields = HashMap::with_capacity(record.fields.len());
    for (name, value) in record.fields {
        let canonical = table.transform_map.get(&name).cloned().unwrap_or(name);
        fields.insert(canonical, value);
    }

    for (name, field_type) in &table.schema {
        if let Some(value) = fields.get(name) {
            match coerce_field(value, *field_type, name) {
                Ok(coerced) => {
                    fields.insert(name.clone(), coerced);
                }
                Err(message) => return Prepared::Dropped(message),
            }
        }
    }

    let (timestamp, injected_timestamp) = if record.timestamp.is_empty() {
        (current_utc_rfc3339(), true)
    } else {
        (record.timestamp, record.injected_timestamp)
    };

    for required in &table.required_fields {
        if required != &table.default_timestamp_field && !fields.contains_key(required) {
            return Prepared::Dropped(format!("missing required field: {required}"));
        }
    }

    Prepared::Ready(Record { timestamp, fields, injected_timestamp })
}

/// Greedily pack prepared records into batches respecting the table's
/// item-count and byte-size caps, sealing a batch when the next record
/// would overflow either one. A record whose own size alone exceeds the
/// table's byte cap can never fit in any batch, so it is dropped up front
/// (reason `"payload-too-large"`) rather than force-packed into an otherwise
/// empty batch.
fn pack_batches(
    table: &TableConfig,
    records: Vec<Record>,
    sequence: &AtomicU64,
    correlation_id: Uuid,
) -> (Vec<Batch>, Vec<String>) {
    let mut batches = Vec::new();
    let mut dropped_reasons = Vec::new();
    let mut current = Batch::new(table.table_name.clone(), sequence.fetch_add(1, Ordering::Relaxed), correlation_id);

    for record in records {
        let record_size = record.approximate_byte_size();
        if record_size > table.max_batch_bytes {
            dropped_reasons.push("payload-too-large".to_string());
            continue;
        }

        let would_overflow_items = current.item_count() + 1 > table.max_batch_items;
        let would_overflow_bytes = current.byte_size() + record_size > table.max_batch_bytes;

        if !current.records.is_empty() && (would_overflow_items || would_overflow_bytes) {
            current.seal(SystemTime::now());
            batches.push(current);
            current = Batch::new(table.table_name.clone(), sequence.fetch_add(1, Ordering::Relaxed), correlation_id);
        }
        current.records.push(record);
    }

    if !current.records.is_empty() {
        current.seal(SystemTime::now());
        batches.push(current);
    }

    (batches, dropped_reasons)
}

fn record_to_json(record: &Record, table: &TableConfig) -> serde_json::Value {
    let mut object = serde_json::Map::with_capacity(record.fields.len() + 1);
    object.insert(table.default_timestamp_field.clone(), serde_json::Value::String(record.timestamp.clone()));
    for (name, value) in &record.fields {
        let json_value = match value {
            FieldValue::DateTime(s) | FieldValue::String(s) => serde_json::Value::String(s.clone()),
            FieldValue::Int(i) => serde_json::Value::from(*i),
            FieldValue::Long(l) => serde_json::Value::from(*l),
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::Float(f) => serde_json::Value::from(*f),
        };
        object.insert(name.clone(), json_value);
    }
    serde_json::Value::Object(object)
}

fn gzip_body(body: &[u8]) -> Result<Vec<u8>, SentinelUploadError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body).map_err(|e| SentinelUploadError::Transport(e.to_string()))?;
    encoder.finish().map_err(|e| SentinelUploadError::Transport(e.to_string()))
}

/// Allow-list of field names that may pass through to a diverted envelope
/// unredacted; everything else is replaced with a `"<redacted>"` placeholder.
/// Conservative by default: only the canonical timestamp and explicitly
/// opted-in fields survive.
fn redact_for_divert(record: &Record, allow_list: &[String]) -> Record {
    let fields = record
        .fields
        .iter()
        .map(|(name, value)| {
            if allow_list.iter().any(|allowed| allowed == name) {
                (name.clone(), value.clone())
            } else {
                (name.clone(), FieldValue::String("<redacted>".to_string()))
            }
        })
        .collect();
    Record { timestamp: record.timestamp.clone(), fields, injected_timestamp: record.injected_timestamp }
}

/// Routes records into Sentinel data-collection-rule streams: one configured
/// [`TableConfig`] per logical destination table (keyed by log type), a
/// credential broker for AAD bearer tokens, and a retry + circuit breaker
/// wrapped HTTPS upload path.
pub struct SentinelRouter {
    http: reqwest::Client,
    dce_endpoint: String,
    dcr_immutable_id: String,
    credential_broker: Arc<CredentialBroker>,
    failed_batch_sink: Arc<dyn FailedBatchSink>,
    tables: HashMap<String, TableConfig>,
    pii_allow_list: Vec<String>,
    max_concurrent_batches: usize,
    retry: RetryPolicy<SentinelUploadError>,
    circuit_breaker: CircuitBreakerPolicy,
    sequence: AtomicU64,
    metrics: Arc<dyn MetricSink>,
}

impl SentinelRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: reqwest::Client,
        dce_endpoint: impl Into<String>,
        dcr_immutable_id: impl Into<String>,
        credential_broker: Arc<CredentialBroker>,
        failed_batch_sink: Arc<dyn FailedBatchSink>,
        tables: Vec<TableConfig>,
        pii_allow_list: Vec<String>,
        max_concurrent_batches: usize,
        retry: RetryPolicy<SentinelUploadError>,
        circuit_breaker: CircuitBreakerPolicy,
        metrics: Arc<dyn MetricSink>,
    ) -> Self {
        let tables = tables.into_iter().map(|t| (t.table_name.clone(), t)).collect();
        Self {
            http,
            dce_endpoint: dce_endpoint.into(),
            dcr_immutable_id: dcr_immutable_id.into(),
            credential_broker,
            failed_batch_sink,
            tables,
            pii_allow_list,
            max_concurrent_batches: max_concurrent_batches.max(1),
            retry,
            circuit_breaker,
            sequence: AtomicU64::new(1),
            metrics,
        }
    }

    fn stream_url(&self, table_name: &str) -> String {
        format!(
            "{}/dataCollectionRules/{}/streams/{}?api-version={}",
            self.dce_endpoint.trim_end_matches('/'),
            self.dcr_immutable_id,
            table_name,
            API_VERSION
        )
    }

    async fn upload_batch(&self, batch: &Batch, table: &TableConfig, token: &str) -> Result<(), SentinelUploadError> {
        let payload: Vec<serde_json::Value> = batch.records.iter().map(|r| record_to_json(r, table)).collect();
        let body = serde_json::to_vec(&payload).expect("batch records always serialize");

        let mut request = self
            .http
            .post(self.stream_url(&batch.table_name))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        let body = if table.gzip {
            request = request.header(reqwest::header::CONTENT_ENCODING, "gzip");
            gzip_body(&body)?
        } else {
            body
        };

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| SentinelUploadError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 204 {
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let status_code = status.as_u16();
        let response_body = response.text().await.unwrap_or_default();
        let body_with_retry_after = match retry_after {
            Some(seconds) => format!("{response_body} (retry-after: {seconds}s)"),
            None => response_body,
        };
        Err(SentinelUploadError::Http { status: status_code, body: body_with_retry_after })
    }

    /// Upload one sealed batch with retry + circuit breaker, diverting it to
    /// the failed-batch sink if every attempt still fails.
    async fn deliver_batch(&self, mut batch: Batch, table: &TableConfig, token: &str) -> Result<usize, usize> {
        batch.mark_in_flight();
        let item_count = batch.item_count();

        let circuit_breaker = self.circuit_breaker.clone();
        let result = self
            .retry
            .execute(|| {
                let batch = batch.clone();
                let table = table.clone();
                let token = token.to_string();
                let circuit_breaker = circuit_breaker.clone();
                async move {
                    circuit_breaker
                        .execute(|| {
                            let batch = batch.clone();
                            let table = table.clone();
                            let token = token.clone();
                            async move {
                                self.upload_batch(&batch, &table, &token).await.map_err(ResilienceError::Inner)
                            }
                        })
                        .await
                }
            })
            .await;

        match result {
            Ok(()) => {
                metrics::emit(
                    self.metrics.as_ref(),
                    "sentinel_router_batch_acknowledged_total",
                    1.0,
                    &[("table", &batch.table_name)],
                );
                Ok(item_count)
            }
            Err(err) => {
                let (category, message) = classify_upload_failure(&err);
                let envelope = FailedBatchEnvelope {
                    batch_id: batch.id,
                    table_name: batch.table_name.clone(),
                    sealed_at: batch.sealed_at.unwrap_or_else(SystemTime::now),
                    error_category: category,
                    error_message: message,
                    attempt_count: err.failures().map(|f| f.len()).unwrap_or(1),
                    correlation_id: batch.correlation_id,
                    records: batch.records.iter().map(|r| redact_for_divert(r, &self.pii_allow_list)).collect(),
                };
                if let Err(sink_err) = self.failed_batch_sink.store(envelope).await {
                    tracing::error!(error = %sink_err, table = %batch.table_name, "failed to persist diverted batch");
                }
                metrics::emit(
                    self.metrics.as_ref(),
                    "sentinel_router_batch_diverted_total",
                    1.0,
                    &[("table", &batch.table_name)],
                );
                Err(item_count)
            }
        }
    }

    /// Resolve a table, prepare and pack `records`, and upload the resulting
    /// batches under bounded concurrency, diverting final failures to the
    /// failed-batch sink.
    pub async fn route(
        &self,
        log_type: &str,
        records: Vec<Record>,
        _classification: &str,
        ctx: &RequestContext,
    ) -> Result<RouteResult, IngestError> {
        let start_time = SystemTime::now();
        let table = self
            .tables
            .get(log_type)
            .ok_or_else(|| IngestError::Configuration { message: format!("unsupported log type: {log_type}") })?;

        let mut dropped = 0usize;
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            match prepare(record, table) {
                Prepared::Ready(record) => prepared.push(record),
                Prepared::Dropped(reason) => {
                    dropped += 1;
                    metrics::emit(
                        self.metrics.as_ref(),
                        "sentinel_router_records_dropped_total",
                        1.0,
                        &[("table", log_type), ("reason", &reason)],
                    );
                }
            }
        }

        let (batches, oversized_reasons) = pack_batches(table, prepared, &self.sequence, ctx.correlation_id());
        for reason in &oversized_reasons {
            dropped += 1;
            metrics::emit(
                self.metrics.as_ref(),
                "sentinel_router_records_dropped_total",
                1.0,
                &[("table", log_type), ("reason", reason)],
            );
        }
        let batch_count = batches.len();

        if batches.is_empty() {
            return Ok(RouteResult { processed: 0, failed: 0, batch_count: 0, dropped, start_time });
        }

        let token = self
            .credential_broker
            .get(SENTINEL_AAD_TOKEN_SECRET, false, ctx)
            .await?;

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_batches));
        let processed = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for batch in batches {
            let semaphore = semaphore.clone();
            let processed = processed.clone();
            let failed = failed.clone();
            let token = token.clone();
            let handle = async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                match self.deliver_batch(batch, table, &token).await {
                    Ok(count) => processed.fetch_add(count as u64, Ordering::Relaxed),
                    Err(count) => failed.fetch_add(count as u64, Ordering::Relaxed),
                };
            };
            handles.push(handle);
        }
        futures::future::join_all(handles).await;

        Ok(RouteResult {
            processed: processed.load(Ordering::Relaxed) as usize,
            failed: failed.load(Ordering::Relaxed) as usize,
            batch_count,
            dropped,
            start_time,
        })
    }
}

fn classify_upload_failure(err: &ResilienceError<SentinelUploadError>) -> (ErrorCategory, String) {
    match err {
        ResilienceError::CircuitOpen { .. } | ResilienceError::Timeout { .. } | ResilienceError::Bulkhead { .. } => {
            (ErrorCategory::TransientTransport, err.to_string())
        }
        ResilienceError::RetryExhausted { failures, .. } => match failures.last() {
            Some(SentinelUploadError::Http { status, body }) if matches!(status, 401 | 403) => {
                (ErrorCategory::Authorization, format!("HTTP {status}: {body}"))
            }
            Some(SentinelUploadError::Http { status, body }) if matches!(status, 400 | 413 | 422) => {
                (ErrorCategory::Validation, format!("HTTP {status}: {body}"))
            }
            Some(other) => (ErrorCategory::TransientTransport, other.to_string()),
            None => (ErrorCategory::TransientTransport, "retry exhausted with no recorded failure".to_string()),
        },
        ResilienceError::Inner(inner) => (ErrorCategory::TransientTransport, inner.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialBrokerConfig;
    use crate::failed_batch_sink::InMemoryFailedBatchSink;
    use crate::metrics::NullSink;
    use crate::model::FieldValue;
    use crate::secret_store::InMemorySecretStore;
    use crate::stack::ResilienceStack;
    use crate::{Backoff, CircuitBreakerConfig};
    use std::time::Duration;

    fn firewall_table() -> TableConfig {
        let mut schema = HashMap::new();
        schema.insert("status".to_string(), FieldType::Int);
        TableConfig {
            table_name: "Firewall_CL".to_string(),
            schema,
            required_fields: vec!["src_ip".to_string()],
            max_batch_items: 2,
            max_batch_bytes: 1_000_000,
            retention_hint_seconds: None,
            transform_map: HashMap::from([("source_ip".to_string(), "src_ip".to_string())]),
            default_timestamp_field: "TimeGenerated".to_string(),
            gzip: false,
        }
    }

    fn credential_broker() -> Arc<CredentialBroker> {
        let secret_store = Arc::new(InMemorySecretStore::seeded([(
            SENTINEL_AAD_TOKEN_SECRET.to_string(),
            "fake-token".to_string(),
        )]));
        let config = CredentialBrokerConfig {
            vault_endpoint: "https://vault.example.com".into(),
            cache_ttl_seconds: 3600,
            encryption_enabled: false,
        };
        let stack = ResilienceStack::new()
            .retry(RetryPolicy::builder().max_attempts(1).unwrap().backoff(Backoff::constant(Duration::from_millis(1))).build())
            .build();
        Arc::new(CredentialBroker::new(secret_store, &config, None, stack, Arc::new(NullSink)))
    }

    fn router(dce_endpoint: String, failed_batch_sink: Arc<dyn FailedBatchSink>) -> SentinelRouter {
        let retry = RetryPolicy::builder()
            .max_attempts(1)
            .unwrap()
            .backoff(Backoff::constant(Duration::from_millis(1)))
            .should_retry(is_retryable_upload_error)
            .build();
        let circuit_breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            min_calls_before_open: 0,
            success_threshold: 1,
        });
        SentinelRouter::new(
            reqwest::Client::new(),
            dce_endpoint,
            "dcr-immutable-id".to_string(),
            credential_broker(),
            failed_batch_sink,
            vec![firewall_table()],
            vec!["src_ip".to_string()],
            4,
            retry,
            circuit_breaker,
            Arc::new(NullSink),
        )
    }

    #[test]
    fn prepare_renames_via_transform_map_and_coerces_schema() {
        let table = firewall_table();
        let record = Record::new("2024-01-01T00:00:00Z")
            .with_field("source_ip", FieldValue::String("10.0.0.1".to_string()))
            .with_field("status", FieldValue::String("200".to_string()));

        match prepare(record, &table) {
            Prepared::Ready(record) => {
                assert_eq!(record.fields.get("src_ip"), Some(&FieldValue::String("10.0.0.1".to_string())));
                assert_eq!(record.fields.get("status"), Some(&FieldValue::Int(200)));
            }
            Prepared::Dropped(reason) => panic!("unexpected drop: {reason}"),
        }
    }

    #[test]
    fn prepare_injects_timestamp_when_absent() {
        let table = firewall_table();
        let record = Record::new("").with_field("src_ip", FieldValue::String("10.0.0.1".to_string()));

        match prepare(record, &table) {
            Prepared::Ready(record) => {
                assert!(!record.timestamp.is_empty());
                assert!(record.injected_timestamp);
            }
            Prepared::Dropped(reason) => panic!("unexpected drop: {reason}"),
        }
    }

    #[test]
    fn prepare_drops_record_missing_required_field() {
        let table = firewall_table();
        let record = Record::new("2024-01-01T00:00:00Z");
        assert!(matches!(prepare(record, &table), Prepared::Dropped(_)));
    }

    #[test]
    fn pack_batches_seals_on_item_count_overflow() {
        let table = firewall_table(); // max_batch_items = 2
        let sequence = AtomicU64::new(1);
        let records = (0..3)
            .map(|i| Record::new("2024-01-01T00:00:00Z").with_field("src_ip", FieldValue::String(format!("10.0.0.{i}"))))
            .collect();

        let (batches, dropped) = pack_batches(&table, records, &sequence, Uuid::new_v4());
        assert!(dropped.is_empty());
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].item_count(), 2);
        assert_eq!(batches[1].item_count(), 1);
        assert_eq!(batches[0].sequence, 1);
        assert_eq!(batches[1].sequence, 2);
    }

    #[test]
    fn pack_batches_drops_record_exceeding_byte_cap_alone() {
        let mut table = firewall_table();
        table.max_batch_bytes = 32;
        let sequence = AtomicU64::new(1);
        let oversized = Record::new("2024-01-01T00:00:00Z")
            .with_field("src_ip", FieldValue::String("x".repeat(64)));
        let fits = Record::new("2024-01-01T00:00:00Z").with_field("src_ip", FieldValue::String("1".to_string()));

        let (batches, dropped) = pack_batches(&table, vec![oversized, fits], &sequence, Uuid::new_v4());
        assert_eq!(dropped, vec!["payload-too-large".to_string()]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].item_count(), 1);
    }

    #[test]
    fn pack_batches_stamps_every_batch_with_the_given_correlation_id() {
        let table = firewall_table();
        let sequence = AtomicU64::new(1);
        let correlation_id = Uuid::new_v4();
        let records = (0..3)
            .map(|i| Record::new("2024-01-01T00:00:00Z").with_field("src_ip", FieldValue::String(format!("10.0.0.{i}"))))
            .collect();

        let (batches, _dropped) = pack_batches(&table, records, &sequence, correlation_id);
        assert!(batches.iter().all(|b| b.correlation_id == correlation_id));
    }

    #[tokio::test]
    async fn route_raises_configuration_error_for_unknown_log_type() {
        let sink = Arc::new(InMemoryFailedBatchSink::new());
        let router = router("https://dce.example.com".to_string(), sink);
        let ctx = RequestContext::new();
        let err = router.route("unknown", vec![], "standard", &ctx).await.unwrap_err();
        assert!(matches!(err, IngestError::Configuration { .. }));
    }

    #[tokio::test]
    async fn route_with_no_records_returns_empty_result_without_a_credential_fetch() {
        // Endpoint the credential broker would reach isn't wired to anything
        // reachable, and the secret store would fail too if it were ever
        // asked — any call reaching it would surface as an error here.
        let sink = Arc::new(InMemoryFailedBatchSink::new());
        let failing_store = Arc::new(InMemorySecretStore::seeded(Vec::<(String, String)>::new()));
        let stack = ResilienceStack::new()
            .retry(RetryPolicy::builder().max_attempts(1).unwrap().backoff(Backoff::constant(Duration::from_millis(1))).build())
            .build();
        let config = CredentialBrokerConfig {
            vault_endpoint: "https://vault.example.com".into(),
            cache_ttl_seconds: 3600,
            encryption_enabled: false,
        };
        let broker = Arc::new(CredentialBroker::new(failing_store, &config, None, stack, Arc::new(NullSink)));

        let retry = RetryPolicy::builder()
            .max_attempts(1)
            .unwrap()
            .backoff(Backoff::constant(Duration::from_millis(1)))
            .should_retry(is_retryable_upload_error)
            .build();
        let circuit_breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            min_calls_before_open: 0,
            success_threshold: 1,
        });
        let router = SentinelRouter::new(
            reqwest::Client::new(),
            "https://dce.example.com".to_string(),
            "dcr-immutable-id".to_string(),
            broker,
            sink,
            vec![firewall_table()],
            vec!["src_ip".to_string()],
            4,
            retry,
            circuit_breaker,
            Arc::new(NullSink),
        );

        let ctx = RequestContext::new();
        let result = router.route("Firewall_CL", vec![], "standard", &ctx).await.unwrap();
        assert_eq!(result.batch_count, 0);
        assert_eq!(result.processed, 0);
        assert_eq!(result.failed, 0);
        assert_eq!(result.dropped, 0);
    }

    #[tokio::test]
    async fn route_counts_dropped_records_and_leaves_batches_empty() {
        let sink = Arc::new(InMemoryFailedBatchSink::new());
        let router = router("https://dce.invalid".to_string(), sink);
        let ctx = RequestContext::new();
        let records = vec![Record::new("2024-01-01T00:00:00Z")]; // missing src_ip
        let result = router.route("Firewall_CL", records, "standard", &ctx).await.unwrap();
        assert_eq!(result.dropped, 1);
        assert_eq!(result.batch_count, 0);
        assert_eq!(result.processed, 0);
        assert_eq!(result.failed, 0);
    }

    #[tokio::test]
    async fn route_diverts_batch_to_failed_sink_when_upload_unreachable() {
        let sink = Arc::new(InMemoryFailedBatchSink::new());
        // Schemeless endpoint: reqwest rejects it at URL-parse time, so the
        // failure is synchronous and never touches the network.
        let router = router("not-a-valid-endpoint".to_string(), sink.clone());
        let ctx = RequestContext::new();
        let records = vec![Record::new("2024-01-01T00:00:00Z").with_field("src_ip", FieldValue::String("10.0.0.1".to_string()))];

        let result = router.route("Firewall_CL", records, "standard", &ctx).await.unwrap();
        assert_eq!(result.batch_count, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.processed, 0);

        let diverted = sink.list(None).await.unwrap();
        assert_eq!(diverted.len(), 1);
        assert_eq!(diverted[0].records[0].fields.get("src_ip"), Some(&FieldValue::String("10.0.0.1".to_string())));
        assert_eq!(diverted[0].correlation_id, ctx.correlation_id());
    }

    #[test]
    fn redact_for_divert_keeps_only_allow_listed_fields() {
        let record = Record::new("2024-01-01T00:00:00Z")
            .with_field("src_ip", FieldValue::String("10.0.0.1".to_string()))
            .with_field("user_email", FieldValue::String("alice@example.com".to_string()));
        let redacted = redact_for_divert(&record, &["src_ip".to_string()]);
        assert_eq!(redacted.fields.get("src_ip"), Some(&FieldValue::String("10.0.0.1".to_string())));
        assert_eq!(redacted.fields.get("user_email"), Some(&FieldValue::String("<redacted>".to_string())));
    }

    #[test]
    fn is_retryable_classifies_sentinel_status_codes() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_upload_error(&SentinelUploadError::Http { status, body: String::new() }));
        }
        for status in [400, 401, 403, 413, 422] {
            assert!(!is_retryable_upload_error(&SentinelUploadError::Http { status, body: String::new() }));
        }
    }
}
