//! Narrow interface to a remote secret backend (e.g. Vault, AWS Secrets Manager).
//!
//! The contract is deliberately synchronous-in-spirit: `get_secret` and
//! `set_secret` each resolve to one outcome, with no streaming or partial
//! results. [`CredentialBroker`](crate::credential_broker::CredentialBroker)
//! wraps calls to this trait with caching, retry, and circuit breaking — this
//! trait itself does none of that.

use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SecretStoreError {
    #[error("secret {name} not found")]
    NotFound { name: String },
    #[error("transport error reaching secret backend: {0}")]
    Transport(String),
    #[error("secret backend denied access: {0}")]
    Authorization(String),
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<String, SecretStoreError>;
    async fn set_secret(&self, name: &str, value: &str) -> Result<(), SecretStoreError>;
    /// Cheap reachability probe, used by startup health checks.
    async fn health(&self) -> Result<(), SecretStoreError>;
}

/// In-memory reference implementation for tests and local development.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: tokio::sync::RwLock<std::collections::HashMap<String, String>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self { secrets: tokio::sync::RwLock::new(pairs.into_iter().collect()) }
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret(&self, name: &str) -> Result<String, SecretStoreError> {
        self.secrets
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SecretStoreError::NotFound { name: name.to_string() })
    }

    async fn set_secret(&self, name: &str, value: &str) -> Result<(), SecretStoreError> {
        self.secrets.write().await.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn health(&self) -> Result<(), SecretStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_missing_secret_returns_not_found() {
        let store = InMemorySecretStore::new();
        let err = store.get_secret("api-key").await.unwrap_err();
        assert!(matches!(err, SecretStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = InMemorySecretStore::new();
        store.set_secret("api-key", "s3kr3t").await.unwrap();
        assert_eq!(store.get_secret("api-key").await.unwrap(), "s3kr3t");
    }

    #[tokio::test]
    async fn seeded_store_is_prepopulated() {
        let store = InMemorySecretStore::seeded([("api-key".to_string(), "s3kr3t".to_string())]);
        assert_eq!(store.get_secret("api-key").await.unwrap(), "s3kr3t");
    }
}
