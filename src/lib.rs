#![forbid(unsafe_code)]

//! # sentinel-ingest
//!
//! Resilient S3-to-Sentinel log ingestion: paginated object discovery,
//! parsing, credential brokering, batching, and upload, all built on a
//! small set of composable resilience primitives (retry, circuit breaker,
//! bulkhead, timeout, rate limiter).
//!
//! ## Layering
//!
//! - [`retry`], [`circuit_breaker`], [`bulkhead`], [`timeout`], [`rate_limit`]
//!   — generic, domain-agnostic resilience policies, composed via
//!   [`stack::ResilienceStack`].
//! - [`config`], [`model`], [`context`], [`metrics`], [`ingest_error`] —
//!   shared configuration, data model, request context, and error/metric
//!   plumbing used by every pipeline stage.
//! - [`secret_store`] / [`credential_broker`] — secret retrieval with
//!   caching, encryption at rest, and stale-on-circuit-open fallback.
//! - [`parser`] — turns raw object bytes into [`model::Record`]s.
//! - [`object_store`] / [`s3_ingestor`] — S3 listing and per-object
//!   processing under a bounded worker pool.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sentinel_ingest::{
//!     Backoff, CircuitBreakerPolicy, RateLimiter, RetryPolicy,
//! };
//! use sentinel_ingest::object_store::{InMemoryObjectStore, is_retryable};
//!
//! # async fn example() {
//! let store = Arc::new(InMemoryObjectStore::new());
//! let retry = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .expect("valid max_attempts")
//!     .backoff(Backoff::exponential(Duration::from_millis(200)))
//!     .should_retry(is_retryable)
//!     .build();
//! let circuit_breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(30));
//! let rate_limiter = RateLimiter::new(10.0, 10.0);
//! let _ = (store, retry, circuit_breaker, rate_limiter);
//! # }
//! ```

mod backoff;
mod bulkhead;
mod circuit_breaker;
mod circuit_breaker_registry;
mod clock;
pub mod config;
pub mod context;
pub mod credential_broker;
mod error;
pub mod failed_batch_sink;
pub mod ingest_error;
mod jitter;
pub mod metrics;
pub mod model;
pub mod object_store;
pub mod orchestrator;
pub mod parser;
mod rate_limit;
mod retry;
pub mod s3_ingestor;
pub mod secret_store;
pub mod sentinel_router;
mod sleeper;
mod stack;
mod timeout;
pub mod watermark;

// Re-exports: the generic resilience toolkit.
pub use backoff::Backoff;
pub use bulkhead::BulkheadPolicy;
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use clock::{Clock, MonotonicClock};
pub use error::ResilienceError;
pub use jitter::Jitter;
pub use rate_limit::{Cancelled, RateLimiter};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder};
pub use timeout::{TimeoutError, TimeoutPolicy};

// Re-exports: domain-level pipeline surface.
pub use credential_broker::CredentialBroker;
pub use failed_batch_sink::{FailedBatchSink, FailedBatchSinkError};
pub use ingest_error::IngestError;
pub use orchestrator::{CycleReport, PipelineOrchestrator};
pub use s3_ingestor::{BatchResult, ListOptions, S3Ingestor};
pub use sentinel_router::{RouteResult, SentinelRouter};
pub use watermark::{WatermarkStore, WatermarkStoreError};

pub mod prelude;
