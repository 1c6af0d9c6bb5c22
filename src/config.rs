//! Configuration snapshot types.
//!
//! These are plain, read-only-at-startup structs. Loading them from YAML,
//! environment variables, or a CLI is an external collaborator's job — this
//! crate only declares the shape and its defaults.

use serde::Deserialize;
use std::time::Duration;

fn default_rate_limit_per_sec() -> u32 {
    10
}
fn default_list_page_size() -> usize {
    1000
}
fn default_worker_pool_size() -> usize {
    8
}
fn default_batch_size() -> usize {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestorConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    pub region: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
    #[serde(default)]
    pub file_extensions: Vec<String>,
    #[serde(default)]
    pub allowed_glob: Option<String>,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

fn default_max_concurrent_batches() -> usize {
    4
}
fn default_batch_timeout_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub table_configs: Vec<crate::model::TableConfig>,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default = "default_batch_timeout_seconds")]
    pub batch_timeout_seconds: u64,
    #[serde(default = "default_classification")]
    pub default_classification: String,
}

fn default_classification() -> String {
    "standard".to_string()
}

impl RouterConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_seconds)
    }
}

fn default_cache_ttl_seconds() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialBrokerConfig {
    pub vault_endpoint: String,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    #[serde(default)]
    pub encryption_enabled: bool,
}

impl CredentialBrokerConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

fn default_failure_threshold() -> usize {
    5
}
fn default_success_threshold() -> usize {
    2
}
fn default_min_calls_before_open() -> usize {
    10
}
fn default_recovery_timeout_seconds() -> u64 {
    60
}
fn default_half_open_max_calls() -> usize {
    3
}

/// Circuit breaker defaults for one named dependency.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerDefaults {
    pub dependency: String,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: usize,
    #[serde(default = "default_min_calls_before_open")]
    pub min_calls_before_open: usize,
    #[serde(default = "default_recovery_timeout_seconds")]
    pub recovery_timeout_seconds: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: usize,
}

impl From<&CircuitBreakerDefaults> for crate::CircuitBreakerConfig {
    fn from(d: &CircuitBreakerDefaults) -> Self {
        crate::CircuitBreakerConfig {
            failure_threshold: d.failure_threshold,
            recovery_timeout: Duration::from_secs(d.recovery_timeout_seconds),
            half_open_max_calls: d.half_open_max_calls,
            min_calls_before_open: d.min_calls_before_open,
            success_threshold: d.success_threshold,
        }
    }
}

fn default_cycle_interval_seconds() -> u64 {
    60
}
fn default_cycle_timeout_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_cycle_interval_seconds")]
    pub cycle_interval_seconds: u64,
    #[serde(default = "default_cycle_timeout_seconds")]
    pub cycle_timeout_seconds: u64,
    pub watermark_path: String,
}

impl OrchestratorConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_seconds)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_seconds)
    }
}

/// The complete, read-only-at-startup configuration snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSnapshot {
    pub ingestor: IngestorConfig,
    pub router: RouterConfig,
    pub credential_broker: CredentialBrokerConfig,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerDefaults>,
    pub orchestrator: OrchestratorConfig,
}

impl ConfigSnapshot {
    pub fn circuit_breaker_defaults(&self, dependency: &str) -> Option<&CircuitBreakerDefaults> {
        self.circuit_breakers.iter().find(|d| d.dependency == dependency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The crate itself never parses YAML (loading is an external collaborator's
    // job); exercising defaults via serde_json keeps this test dependency-free
    // while covering the same Deserialize impl a YAML loader would drive.
    #[test]
    fn deserializes_minimal_json_with_defaults() {
        let json = r#"{
            "ingestor": {"bucket": "my-bucket", "region": "us-east-1"},
            "router": {"default_classification": "standard"},
            "credential_broker": {"vault_endpoint": "https://vault.example.com"},
            "orchestrator": {"watermark_path": "/var/lib/ingest/watermark"}
        }"#;
        let snapshot: ConfigSnapshot = serde_json::from_str(json).expect("valid config fixture");
        assert_eq!(snapshot.ingestor.rate_limit_per_sec, 10);
        assert_eq!(snapshot.router.max_concurrent_batches, 4);
        assert_eq!(snapshot.credential_broker.cache_ttl_seconds, 3600);
    }

    #[test]
    fn circuit_breaker_defaults_lookup_by_dependency() {
        let json = r#"{
            "ingestor": {"bucket": "my-bucket", "region": "us-east-1"},
            "router": {"default_classification": "standard"},
            "credential_broker": {"vault_endpoint": "https://vault.example.com"},
            "circuit_breakers": [{"dependency": "s3", "failure_threshold": 7}],
            "orchestrator": {"watermark_path": "/var/lib/ingest/watermark"}
        }"#;
        let snapshot: ConfigSnapshot = serde_json::from_str(json).expect("valid config fixture");
        let s3 = snapshot.circuit_breaker_defaults("s3").expect("s3 breaker present");
        assert_eq!(s3.failure_threshold, 7);
        assert!(snapshot.circuit_breaker_defaults("sentinel").is_none());
    }
}
