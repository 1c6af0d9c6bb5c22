//! Crate-level error taxonomy for the ingestion pipeline.
//!
//! [`ResilienceError`](crate::ResilienceError) is the policy-level wrapper every
//! resilience primitive returns; [`IngestError`] is the domain-level error every
//! public ingestion API returns. Call sites convert one into the other once they
//! know which named dependency they were calling, so a `CircuitOpen` from the
//! generic wrapper becomes an `IngestError::CircuitOpen { dependency, .. }`.

use crate::ResilienceError;
use std::time::Duration;
use thiserror::Error;

/// Domain error taxonomy (spec §7): seven kinds, not seven Rust types — several
/// kinds share a variant shape distinguished by field, matching how callers
/// actually branch on them (retryable vs. not, fatal vs. scoped).
#[derive(Debug, Error)]
pub enum IngestError {
    /// Network timeouts, 5xx, 429, `SlowDown` — retryable until exhausted.
    #[error("transient transport error calling {dependency}: {message}")]
    TransientTransport { dependency: String, message: String },

    /// Malformed bytes, schema violation, required-field absence. Scoped to one
    /// record or object; never fatal to the enclosing operation.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// 401/403, invalid signature, `AccessDenied`. Non-retryable for the caller.
    #[error("authorization failed calling {dependency}: {message}")]
    Authorization { dependency: String, message: String },

    /// A retryable error that survived all attempts.
    #[error("retry exhausted calling {dependency} after {attempts} attempts: {last_error}")]
    Exhausted { dependency: String, attempts: usize, last_error: String },

    /// The named dependency's circuit breaker is open; the call was refused
    /// without attempting I/O.
    #[error("circuit open for {dependency} ({failure_count} failures, open {open_duration:?})")]
    CircuitOpen { dependency: String, failure_count: usize, open_duration: Duration },

    /// Unknown log type, missing required option. Fatal at startup.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Cooperative shutdown. Never surfaced as a failure by metrics.
    #[error("operation cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn is_retryable_transport(&self) -> bool {
        matches!(self, Self::TransientTransport { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Convert a generic policy failure into the domain taxonomy now that the
    /// caller knows which dependency it was addressing.
    pub fn from_resilience<E: std::error::Error>(
        dependency: impl Into<String>,
        err: ResilienceError<E>,
    ) -> Self {
        let dependency = dependency.into();
        match err {
            ResilienceError::Timeout { elapsed, timeout } => IngestError::TransientTransport {
                dependency,
                message: format!("timed out after {:?} (limit {:?})", elapsed, timeout),
            },
            ResilienceError::Bulkhead { in_flight, max } => IngestError::TransientTransport {
                dependency,
                message: format!("worker pool saturated ({in_flight}/{max} in flight)"),
            },
            ResilienceError::CircuitOpen { failure_count, open_duration } => {
                IngestError::CircuitOpen { dependency, failure_count, open_duration }
            }
            ResilienceError::RetryExhausted { attempts, failures } => IngestError::Exhausted {
                dependency,
                attempts,
                last_error: failures.last().map(|e| e.to_string()).unwrap_or_default(),
            },
            ResilienceError::Inner(e) => {
                IngestError::TransientTransport { dependency, message: e.to_string() }
            }
        }
    }
}
