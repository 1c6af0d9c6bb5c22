//! Narrow object-store interface so the S3 ingestor is testable without AWS,
//! plus AWS error classification mirroring a retry-logic "should I retry
//! this response" pattern: a pure function from error to a three-way verdict,
//! decoupled from the retry helper itself so callers supply it as a predicate.

use async_trait::async_trait;
use std::time::SystemTime;
use thiserror::Error;

use crate::model::S3Object;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("S3 API error: {code}: {message}")]
    Api { code: String, message: String },
    #[error("object body could not be decompressed: {0}")]
    Decompression(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Per-call classification of an [`ObjectStoreError`], mirroring a
/// should-I-retry-this-response verdict: `Retry`, `DontRetry`, or (for
/// completeness against the 3-way shape) `Unknown` for errors this crate
/// doesn't recognize but chooses not to retry by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3ErrorKind {
    Retryable,
    NonRetryable,
    Unknown,
}

/// Classifies an S3 API error code per spec: `SlowDown`, `InternalError`,
/// `RequestTimeout`, `ServiceUnavailable` are retryable; `NoSuchKey`,
/// `NoSuchBucket`, `AccessDenied`, `InvalidRequest` are not; anything else is
/// `Unknown` (treated as non-retryable by the caller, but tracked separately
/// for observability).
pub fn classify_s3_error(code: &str) -> S3ErrorKind {
    match code {
        "SlowDown" | "InternalError" | "RequestTimeout" | "ServiceUnavailable" => S3ErrorKind::Retryable,
        "NoSuchKey" | "NoSuchBucket" | "AccessDenied" | "InvalidRequest" => S3ErrorKind::NonRetryable,
        _ => S3ErrorKind::Unknown,
    }
}

pub fn is_retryable(err: &ObjectStoreError) -> bool {
    match err {
        ObjectStoreError::Api { code, .. } => classify_s3_error(code) == S3ErrorKind::Retryable,
        ObjectStoreError::Transport(_) => true,
        ObjectStoreError::Decompression(_) => false,
    }
}

/// Bucket-scoped object listing and retrieval, narrow enough to fake in tests.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ObjectPage, ObjectStoreError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
}

pub struct ObjectPage {
    pub objects: Vec<S3Object>,
    pub continuation_token: Option<String>,
}

/// In-memory reference implementation for tests.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: std::collections::HashMap<(String, String), (Vec<u8>, S3Object)>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, bucket: &str, key: &str, body: Vec<u8>, last_modified: SystemTime) {
        let size = body.len() as u64;
        let object = S3Object {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
            last_modified,
            etag: format!("{:x}", size),
        };
        self.objects.insert((bucket.to_string(), key.to_string()), (body, object));
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        _continuation_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ObjectPage, ObjectStoreError> {
        let mut objects: Vec<S3Object> = self
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|(_, (_, obj))| obj.clone())
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        objects.truncate(max_keys);
        Ok(ObjectPage { objects, continuation_token: None })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(body, _)| body.clone())
            .ok_or_else(|| ObjectStoreError::Api { code: "NoSuchKey".into(), message: key.to_string() })
    }
}

/// Production [`ObjectStore`] backed by `aws-sdk-s3`. Thin: pagination,
/// field mapping, and error classification only — no retry or rate
/// limiting, both of which the ingestor layers on above this trait.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

fn classify_sdk_error(err: aws_sdk_s3::Error) -> ObjectStoreError {
    use aws_sdk_s3::error::ProvideErrorMetadata;
    match err.code() {
        Some(code) => ObjectStoreError::Api { code: code.to_string(), message: err.to_string() },
        None => ObjectStoreError::Transport(err.to_string()),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ObjectPage, ObjectStoreError> {
        let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix).max_keys(max_keys as i32);
        if let Some(token) = continuation_token {
            request = request.continuation_token(token);
        }

        let output = request.send().await.map_err(|e| classify_sdk_error(e.into()))?;

        let objects = output
            .contents()
            .iter()
            .map(|obj| S3Object {
                bucket: bucket.to_string(),
                key: obj.key().unwrap_or_default().to_string(),
                size: obj.size().unwrap_or_default().max(0) as u64,
                last_modified: obj
                    .last_modified()
                    .map(|dt| std::time::SystemTime::UNIX_EPOCH + std::time::Duration::new(dt.secs().max(0) as u64, dt.subsec_nanos()))
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
                etag: obj.e_tag().unwrap_or_default().trim_matches('"').to_string(),
            })
            .collect();

        Ok(ObjectPage { objects, continuation_token: output.next_continuation_token().map(str::to_string) })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let output =
            self.client.get_object().bucket(bucket).key(key).send().await.map_err(|e| classify_sdk_error(e.into()))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Transport(format!("failed to read object body: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }
}
