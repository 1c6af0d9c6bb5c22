//! Convenient re-exports for common sentinel-ingest types.
pub use crate::{
    config::{
        CircuitBreakerDefaults, ConfigSnapshot, CredentialBrokerConfig, IngestorConfig,
        OrchestratorConfig, RouterConfig,
    },
    context::RequestContext,
    credential_broker::CredentialBroker,
    failed_batch_sink::{FailedBatchSink, FailedBatchSinkError, InMemoryFailedBatchSink},
    ingest_error::IngestError,
    metrics::{LogSink, MemorySink, MetricSink, NullSink},
    model::{Batch, BatchState, FieldType, FieldValue, Record, S3Object, TableConfig},
    object_store::{is_retryable, ObjectStore, ObjectStoreError, S3ObjectStore},
    orchestrator::{CycleReport, PipelineOrchestrator},
    parser::{LogParser, ParseError, ParserRegistry},
    s3_ingestor::{BatchResult, ListOptions, S3Ingestor},
    secret_store::{SecretStore, SecretStoreError},
    sentinel_router::{is_retryable_upload_error, RouteResult, SentinelRouter, SentinelUploadError},
    timeout::MAX_TIMEOUT,
    watermark::{InMemoryWatermarkStore, WatermarkStore, WatermarkStoreError},
    Backoff, BuildError, BulkheadPolicy, Cancelled, CircuitBreakerConfig, CircuitBreakerPolicy,
    CircuitBreakerRegistry, CircuitState, Clock, Jitter, MonotonicClock, RateLimiter,
    ResilienceError, ResilienceStack, ResilienceStackBuilder, RetryPolicy, RetryPolicyBuilder,
    TimeoutError, TimeoutPolicy,
};
