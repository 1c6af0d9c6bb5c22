//! Discovers and downloads S3 objects, decompresses and validates their
//! bodies, and hands them to a registered parser under bounded concurrency.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use flate2::read::GzDecoder;
use std::io::Read;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::context::RequestContext;
use crate::ingest_error::IngestError;
use crate::metrics::{self, MetricSink};
use crate::model::{Record, S3Object};
use crate::object_store::{is_retryable, ObjectStore, ObjectStoreError};
use crate::parser::LogParser;
use crate::rate_limit::RateLimiter;
use crate::{CircuitBreakerPolicy, ResilienceError, RetryPolicy};

/// Minimal `*`-wildcard glob matcher — this crate's allow-list use case never
/// needs character classes or `**`.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }
    let mut rest = candidate;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}

fn extension_allowed(key: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    allowed.iter().any(|ext| key.ends_with(ext.as_str()))
}

pub struct ListOptions<'a> {
    pub since: Option<SystemTime>,
    pub max_keys: usize,
    pub allowed_extensions: &'a [String],
    pub allowed_glob: Option<&'a str>,
}

#[derive(Debug, Default, Clone)]
pub struct BatchResult {
    pub successful_keys: Vec<String>,
    pub failed_keys: Vec<(String, String)>,
    pub total_files: usize,
    pub total_bytes: u64,
    pub total_parse_errors: usize,
    pub processing_time: Duration,
    pub rate_limit_wait_time: Duration,
}

pub struct S3Ingestor {
    store: Arc<dyn ObjectStore>,
    rate_limiter: RateLimiter,
    retry: RetryPolicy<ObjectStoreError>,
    circuit_breaker: CircuitBreakerPolicy,
    worker_pool_size: usize,
    metrics: Arc<dyn MetricSink>,
    /// Cumulative nanoseconds spent blocked in `rate_limiter.acquire`, read by
    /// `process_batch` to report `BatchResult::rate_limit_wait_time`.
    rate_limit_wait_nanos: AtomicU64,
}

impl S3Ingestor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        rate_limiter: RateLimiter,
        retry: RetryPolicy<ObjectStoreError>,
        circuit_breaker: CircuitBreakerPolicy,
        worker_pool_size: usize,
        metrics: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            store,
            rate_limiter,
            retry,
            circuit_breaker,
            worker_pool_size,
            metrics,
            rate_limit_wait_nanos: AtomicU64::new(0),
        }
    }

    fn effective_pool_size(&self) -> usize {
        let cpu_based = std::thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(4);
        self.worker_pool_size.min(cpu_based).max(1)
    }

    pub async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        opts: ListOptions<'_>,
        ctx: &RequestContext,
    ) -> Result<Vec<S3Object>, IngestError> {
        let store = self.store.clone();
        let retry = &self.retry;
        let circuit_breaker = &self.circuit_breaker;

        let mut all_objects = Vec::new();
        let mut continuation = None;

        loop {
            let wait_started = Instant::now();
            self.rate_limiter
                .acquire(1, ctx.cancellation())
                .await
                .map_err(|_| IngestError::Cancelled)?;
            self.rate_limit_wait_nanos.fetch_add(wait_started.elapsed().as_nanos() as u64, Ordering::Relaxed);

            let store = store.clone();
            let bucket_owned = bucket.to_string();
            let prefix_owned = prefix.to_string();
            let token = continuation.clone();
            let max_keys = opts.max_keys;

            let result = ctx
                .run_cancellable(retry.execute(|| {
                    let store = store.clone();
                    let bucket = bucket_owned.clone();
                    let prefix = prefix_owned.clone();
                    let token = token.clone();
                    let circuit_breaker = circuit_breaker.clone();
                    async move {
                        circuit_breaker
                            .execute(|| {
                                let store = store.clone();
                                let bucket = bucket.clone();
                                let prefix = prefix.clone();
                                let token = token.clone();
                                async move {
                                    store
                                        .list(&bucket, &prefix, token.as_deref(), max_keys)
                                        .await
                                        .map_err(ResilienceError::Inner)
                                }
                            })
                            .await
                    }
                }))
                .await;

            let page = match result {
                None => return Err(IngestError::Cancelled),
                Some(Ok(page)) => page,
                Some(Err(e)) => return Err(IngestError::from_resilience("s3", e)),
            };

            for object in page.objects {
                if let Some(since) = opts.since {
                    if object.last_modified <= since {
                        continue;
                    }
                }
                if !extension_allowed(&object.key, opts.allowed_extensions) {
                    continue;
                }
                if let Some(glob) = opts.allowed_glob {
                    if !glob_match(glob, &object.key) {
                        continue;
                    }
                }
                all_objects.push(object);
            }

            continuation = page.continuation_token;
            if continuation.is_none() {
                break;
            }
        }

        Ok(all_objects)
    }

    /// Download, decompress, validate, and parse one object. Errors here are
    /// per-object: they never abort the enclosing batch.
    async fn process_object(
        &self,
        bucket: &str,
        object: &S3Object,
        parser: &LogParser,
        cancellation: &CancellationToken,
    ) -> Result<(Vec<Record>, u64), String> {
        let wait_started = Instant::now();
        self.rate_limiter.acquire(1, cancellation).await.map_err(|_| "cancelled".to_string())?;
        self.rate_limit_wait_nanos.fetch_add(wait_started.elapsed().as_nanos() as u64, Ordering::Relaxed);

        let store = self.store.clone();
        let bucket_owned = bucket.to_string();
        let key_owned = object.key.clone();
        let circuit_breaker = self.circuit_breaker.clone();

        let result = self
            .retry
            .execute(|| {
                let store = store.clone();
                let bucket = bucket_owned.clone();
                let key = key_owned.clone();
                let circuit_breaker = circuit_breaker.clone();
                async move {
                    circuit_breaker
                        .execute(|| {
                            let store = store.clone();
                            let bucket = bucket.clone();
                            let key = key.clone();
                            async move { store.get(&bucket, &key).await.map_err(ResilienceError::Inner) }
                        })
                        .await
                }
            })
            .await;

        let body = result.map_err(|e| e.to_string())?;
        let byte_count = body.len() as u64;

        let decompressed = if object.is_gzip() {
            let mut decoder = GzDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|e| format!("gzip decompression failed: {e}"))?;
            out
        } else {
            body
        };

        let is_json = object.extension() == Some("json");
        if is_json {
            serde_json::from_slice::<serde_json::Value>(&decompressed)
                .map_err(|e| format!("invalid JSON: {e}"))?;
        } else if decompressed.is_empty() {
            return Err("object body is empty".to_string());
        }

        let records = parser.parse(&decompressed).map_err(|e| e.to_string())?;
        Ok((records, byte_count))
    }

    pub async fn process_batch(
        &self,
        bucket: &str,
        objects: &[S3Object],
        parser: &LogParser,
        callback: Option<&(dyn Fn(&[Record]) + Send + Sync)>,
        ctx: &RequestContext,
    ) -> BatchResult {
        let started = Instant::now();
        let wait_nanos_before = self.rate_limit_wait_nanos.load(Ordering::Relaxed);
        let semaphore = Arc::new(Semaphore::new(self.effective_pool_size()));

        let successful_keys = Arc::new(std::sync::Mutex::new(Vec::new()));
        let failed_keys = Arc::new(std::sync::Mutex::new(Vec::new()));
        let total_bytes = Arc::new(AtomicU64::new(0));
        let total_parse_errors = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for object in objects {
            let semaphore = semaphore.clone();
            let successful_keys = successful_keys.clone();
            let failed_keys = failed_keys.clone();
            let total_bytes = total_bytes.clone();
            let total_parse_errors = total_parse_errors.clone();
            let object = object.clone();
            let cancellation = ctx.cancellation().clone();

            let handle = async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                match self.process_object(bucket, &object, parser, &cancellation).await {
                    Ok((records, bytes)) => {
                        total_bytes.fetch_add(bytes, Ordering::Relaxed);
                        if let Some(cb) = callback {
                            cb(&records);
                        }
                        successful_keys.lock().unwrap().push(object.key.clone());
                    }
                    Err(message) => {
                        if message.contains("parse") || message.contains("JSON") {
                            total_parse_errors.fetch_add(1, Ordering::Relaxed);
                        }
                        failed_keys.lock().unwrap().push((object.key.clone(), message));
                    }
                }
            };
            handles.push(handle);
        }

        futures::future::join_all(handles).await;

        metrics::emit(
            self.metrics.as_ref(),
            "s3_ingestor_batch_files_total",
            objects.len() as f64,
            &[("bucket", bucket)],
        );

        let wait_nanos_after = self.rate_limit_wait_nanos.load(Ordering::Relaxed);

        BatchResult {
            successful_keys: successful_keys.lock().unwrap().clone(),
            failed_keys: failed_keys.lock().unwrap().clone(),
            total_files: objects.len(),
            total_bytes: total_bytes.load(Ordering::Relaxed),
            total_parse_errors: total_parse_errors.load(Ordering::Relaxed),
            processing_time: started.elapsed(),
            rate_limit_wait_time: Duration::from_nanos(wait_nanos_after - wait_nanos_before),
        }
    }
}

/// Classifies an [`ObjectStoreError`] as retryable for use as a
/// [`RetryPolicy::should_retry`] predicate.
pub fn is_retryable_predicate(err: &ObjectStoreError) -> bool {
    is_retryable(err)
}
