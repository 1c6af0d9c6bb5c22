//! Registry for managing named circuit breakers.
//!
//! Callers that all address the same upstream dependency (e.g. "s3" or
//! "sentinel") must share one [`CircuitBreakerPolicy`] instance so that a
//! failure observed by one caller is visible to all. The registry hands out
//! clones of the same underlying policy by name, creating one lazily on
//! first use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};

/// Registry keyed by breaker name.
#[derive(Default, Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<String, CircuitBreakerPolicy>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker under `name`, overwriting any existing entry.
    pub fn register(&self, name: impl Into<String>, policy: CircuitBreakerPolicy) {
        self.inner.lock().unwrap().insert(name.into(), policy);
    }

    /// Retrieve the breaker registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<CircuitBreakerPolicy> {
        self.inner.lock().unwrap().get(name).cloned()
    }

    /// Retrieve the breaker for `name`, creating one from `config` on first use.
    /// Subsequent calls for the same name return clones of the same policy.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreakerPolicy {
        let mut map = self.inner.lock().unwrap();
        map.entry(name.to_string())
            .or_insert_with(|| CircuitBreakerPolicy::with_config(config))
            .clone()
    }

    /// Convenience over [`Self::get_or_create`] using `CircuitBreakerPolicy::new` defaults
    /// plus the extended spec fields.
    pub fn get_or_create_default(
        &self,
        name: &str,
        failure_threshold: usize,
        recovery_timeout: Duration,
    ) -> CircuitBreakerPolicy {
        self.get_or_create(
            name,
            CircuitBreakerConfig {
                failure_threshold,
                recovery_timeout,
                half_open_max_calls: 1,
                min_calls_before_open: 0,
                success_threshold: 1,
            },
        )
    }

    /// Snapshot of all registered breakers' current states, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().unwrap();
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
