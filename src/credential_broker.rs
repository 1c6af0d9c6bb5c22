//! Caches, rotates, and resiliently fetches secrets from a [`SecretStore`].
//!
//! Wraps every remote call in the same retry → circuit-breaker → bulkhead →
//! timeout stack used elsewhere in this crate. On `CircuitOpen`, a still-cached
//! (even if expired) secret is served as a fallback rather than failing the
//! caller outright — the broker emits a `stale-credential` metric so operators
//! can see when this happened.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;

use crate::config::CredentialBrokerConfig;
use crate::context::RequestContext;
use crate::ingest_error::IngestError;
use crate::metrics::{self, MetricSink};
use crate::model::CachedSecret;
use crate::secret_store::{SecretStore, SecretStoreError};
use crate::stack::ResilienceStack;
use crate::ResilienceError;

const NONCE_LEN: usize = 12;

fn encrypt(key: &[u8; 32], plaintext: &str) -> Vec<u8> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is exactly 32 bytes");
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, plaintext.as_bytes()).expect("encryption cannot fail for valid key/nonce");
    let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);
    packed
}

/// Generate a random replacement value for `rotate(name, None, ..)`: 32
/// random bytes, hex-encoded so the result is safe to hand to any backend's
/// `set_secret` as a plain string.
fn generate_secret_value() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decrypt(key: &[u8; 32], packed: &[u8]) -> Result<String, IngestError> {
    if packed.len() < NONCE_LEN {
        return Err(IngestError::Configuration { message: "cached secret ciphertext truncated".into() });
    }
    let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is exactly 32 bytes");
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| IngestError::Configuration { message: "failed to decrypt cached secret".into() })?;
    String::from_utf8(plaintext)
        .map_err(|e| IngestError::Configuration { message: format!("cached secret is not valid utf-8: {e}") })
}

/// Resiliently fetches secrets from a [`SecretStore`], caching plaintext
/// (optionally encrypted at rest) for up to the configured TTL.
pub struct CredentialBroker {
    store: Arc<dyn SecretStore>,
    cache: Mutex<HashMap<String, CachedSecret>>,
    ttl: Duration,
    cipher_key: Option<[u8; 32]>,
    stack: ResilienceStack<SecretStoreError>,
    metrics: Arc<dyn MetricSink>,
}

impl CredentialBroker {
    pub fn new(
        store: Arc<dyn SecretStore>,
        config: &CredentialBrokerConfig,
        cipher_key: Option<[u8; 32]>,
        stack: ResilienceStack<SecretStoreError>,
        metrics: Arc<dyn MetricSink>,
    ) -> Self {
        assert_eq!(
            config.encryption_enabled,
            cipher_key.is_some(),
            "cipher_key must be provided iff encryption_enabled is set"
        );
        Self { store, cache: Mutex::new(HashMap::new()), ttl: config.cache_ttl(), cipher_key, stack, metrics }
    }

    fn store_in_cache(&self, name: &str, plaintext: &str) {
        let ciphertext = match &self.cipher_key {
            Some(key) => encrypt(key, plaintext),
            None => plaintext.as_bytes().to_vec(),
        };
        self.cache.lock().unwrap().insert(
            name.to_string(),
            CachedSecret { name: name.to_string(), ciphertext, fetched_at: SystemTime::now(), ttl: self.ttl },
        );
    }

    fn decode_cached(&self, cached: &CachedSecret) -> Result<String, IngestError> {
        match &self.cipher_key {
            Some(key) => decrypt(key, &cached.ciphertext),
            None => String::from_utf8(cached.ciphertext.clone())
                .map_err(|e| IngestError::Configuration { message: format!("cached secret is not valid utf-8: {e}") }),
        }
    }

    /// Fetch a secret's current plaintext value, serving from cache when
    /// fresh. Pass `force_refresh` to bypass the cache unconditionally.
    pub async fn get(&self, name: &str, force_refresh: bool, ctx: &RequestContext) -> Result<String, IngestError> {
        if !force_refresh {
            let cached = self.cache.lock().unwrap().get(name).cloned();
            if let Some(cached) = cached {
                if !cached.is_expired(SystemTime::now()) {
                    return self.decode_cached(&cached);
                }
            }
        }

        let store = self.store.clone();
        let result = ctx
            .run_cancellable(self.stack.execute(|| {
                let store = store.clone();
                let name = name.to_string();
                async move { store.get_secret(&name).await.map_err(ResilienceError::Inner) }
            }))
            .await;

        match result {
            None => Err(IngestError::Cancelled),
            Some(Ok(plaintext)) => {
                self.store_in_cache(name, &plaintext);
                Ok(plaintext)
            }
            Some(Err(ResilienceError::CircuitOpen { failure_count, open_duration })) => {
                let cached = self.cache.lock().unwrap().get(name).cloned();
                if let Some(cached) = cached {
                    metrics::emit(self.metrics.as_ref(), "stale_credential_served", 1.0, &[("secret", name)]);
                    self.decode_cached(&cached)
                } else {
                    Err(IngestError::CircuitOpen { dependency: "secret-store".into(), failure_count, open_duration })
                }
            }
            Some(Err(other)) => Err(IngestError::from_resilience("secret-store", other)),
        }
    }

    /// Rotate a secret: push `new_value`, or — when `new_value` is `None` —
    /// generate a cryptographically random replacement ourselves and push
    /// that, then refresh the cache. Either way the backend always receives
    /// an explicit value; it never has to infer a rotation request.
    pub async fn rotate(&self, name: &str, new_value: Option<&str>, ctx: &RequestContext) -> Result<(), IngestError> {
        let generated;
        let value = match new_value {
            Some(value) => value,
            None => {
                generated = generate_secret_value();
                generated.as_str()
            }
        };

        let store = self.store.clone();
        let name_owned = name.to_string();
        let value_owned = value.to_string();
        let result = ctx
            .run_cancellable(self.stack.execute(|| {
                let store = store.clone();
                let name = name_owned.clone();
                let value = value_owned.clone();
                async move { store.set_secret(&name, &value).await.map_err(ResilienceError::Inner) }
            }))
            .await;

        match result {
            None => return Err(IngestError::Cancelled),
            Some(Err(e)) => return Err(IngestError::from_resilience("secret-store", e)),
            Some(Ok(())) => {}
        }

        self.cache.lock().unwrap().remove(name);
        self.get(name, true, ctx).await.map(|_| ())
    }

    /// Probe backend reachability without touching the cache.
    pub async fn validate(&self, ctx: &RequestContext) -> Result<(), IngestError> {
        let store = self.store.clone();
        let result = ctx
            .run_cancellable(self.stack.execute(|| {
                let store = store.clone();
                async move { store.health().await.map_err(ResilienceError::Inner) }
            }))
            .await;

        match result {
            None => Err(IngestError::Cancelled),
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(IngestError::from_resilience("secret-store", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;
    use crate::secret_store::InMemorySecretStore;
    use crate::{Backoff, CircuitBreakerConfig};

    fn test_stack() -> ResilienceStack<SecretStoreError> {
        ResilienceStack::new()
            .circuit_breaker_with_config(CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
                min_calls_before_open: 0,
                success_threshold: 1,
            })
            .retry(
                crate::RetryPolicy::builder()
                    .max_attempts(1)
                    .unwrap()
                    .backoff(Backoff::constant(Duration::from_millis(1)))
                    .build(),
            )
            .build()
    }

    fn broker(store: Arc<dyn SecretStore>) -> (CredentialBroker, Arc<MemorySink>) {
        let metrics = Arc::new(MemorySink::with_capacity(10));
        let config = CredentialBrokerConfig {
            vault_endpoint: "https://vault.example.com".into(),
            cache_ttl_seconds: 3600,
            encryption_enabled: false,
        };
        (CredentialBroker::new(store, &config, None, test_stack(), metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn fetches_and_caches_secret() {
        let store: Arc<dyn SecretStore> =
            Arc::new(InMemorySecretStore::seeded([("db-password".to_string(), "hunter2".to_string())]));
        let (broker, _metrics) = broker(store);
        let ctx = RequestContext::new();

        let value = broker.get("db-password", false, &ctx).await.unwrap();
        assert_eq!(value, "hunter2");
    }

    #[tokio::test]
    async fn encrypted_cache_roundtrips() {
        let store: Arc<dyn SecretStore> =
            Arc::new(InMemorySecretStore::seeded([("api-key".to_string(), "topsecret".to_string())]));
        let metrics = Arc::new(MemorySink::with_capacity(10));
        let config = CredentialBrokerConfig {
            vault_endpoint: "https://vault.example.com".into(),
            cache_ttl_seconds: 3600,
            encryption_enabled: true,
        };
        let key = [0x11u8; 32];
        let broker = CredentialBroker::new(store, &config, Some(key), test_stack(), metrics);
        let ctx = RequestContext::new();

        let first = broker.get("api-key", false, &ctx).await.unwrap();
        assert_eq!(first, "topsecret");
        // Second call is served from the (now encrypted) cache.
        let second = broker.get("api-key", false, &ctx).await.unwrap();
        assert_eq!(second, "topsecret");
    }

    #[tokio::test]
    async fn rotate_pushes_new_value_and_refreshes_cache() {
        let store: Arc<dyn SecretStore> =
            Arc::new(InMemorySecretStore::seeded([("db-password".to_string(), "old".to_string())]));
        let (broker, _metrics) = broker(store);
        let ctx = RequestContext::new();

        broker.get("db-password", false, &ctx).await.unwrap();
        broker.rotate("db-password", Some("new"), &ctx).await.unwrap();
        let value = broker.get("db-password", false, &ctx).await.unwrap();
        assert_eq!(value, "new");
    }

    #[tokio::test]
    async fn rotate_with_no_value_generates_a_fresh_random_secret() {
        let store: Arc<dyn SecretStore> =
            Arc::new(InMemorySecretStore::seeded([("db-password".to_string(), "old".to_string())]));
        let (broker, _metrics) = broker(store);
        let ctx = RequestContext::new();

        broker.rotate("db-password", None, &ctx).await.unwrap();
        let rotated = broker.get("db-password", false, &ctx).await.unwrap();
        assert_ne!(rotated, "old");
        assert_eq!(rotated.len(), 64); // 32 random bytes, hex-encoded

        broker.rotate("db-password", None, &ctx).await.unwrap();
        let rotated_again = broker.get("db-password", false, &ctx).await.unwrap();
        assert_ne!(rotated_again, rotated);
    }

    #[tokio::test]
    async fn stale_cache_served_when_circuit_open() {
        struct FlakyStore;
        #[async_trait::async_trait]
        impl SecretStore for FlakyStore {
            async fn get_secret(&self, _name: &str) -> Result<String, SecretStoreError> {
                Err(SecretStoreError::Transport("connection reset".into()))
            }
            async fn set_secret(&self, _name: &str, _value: &str) -> Result<(), SecretStoreError> {
                Ok(())
            }
            async fn health(&self) -> Result<(), SecretStoreError> {
                Ok(())
            }
        }

        // Prime the cache via a fresh working store, then swap the broker's
        // store for one that always fails so the circuit trips on the first
        // failed refresh attempt (failure_threshold=1 in test_stack()).
        let working_store: Arc<dyn SecretStore> =
            Arc::new(InMemorySecretStore::seeded([("db-password".to_string(), "cached-value".to_string())]));
        let (broker, metrics) = broker(working_store);
        let ctx = RequestContext::new();
        broker.get("db-password", false, &ctx).await.unwrap();

        let flaky = CredentialBroker::new(
            Arc::new(FlakyStore),
            &CredentialBrokerConfig {
                vault_endpoint: "https://vault.example.com".into(),
                cache_ttl_seconds: 0, // force-expire so `get` actually calls out
                encryption_enabled: false,
            },
            None,
            test_stack(),
            metrics.clone(),
        );
        // Seed the flaky broker's own cache since it's a separate instance.
        flaky.cache.lock().unwrap().insert(
            "db-password".to_string(),
            CachedSecret {
                name: "db-password".into(),
                ciphertext: b"cached-value".to_vec(),
                fetched_at: SystemTime::now() - Duration::from_secs(10),
                ttl: Duration::from_secs(0),
            },
        );

        // First call trips the circuit breaker (failure_threshold=1) and fails outright.
        assert!(flaky.get("db-password", false, &ctx).await.is_err());
        // Second call observes the now-open circuit and falls back to the stale cache.
        let result = flaky.get("db-password", false, &ctx).await.unwrap();
        assert_eq!(result, "cached-value");
        assert!(metrics.events().iter().any(|e| e.name == "stale_credential_served"));
    }
}
