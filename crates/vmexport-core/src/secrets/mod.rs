//! Secret backend contract (§4.H) plus a TTL-layered cache wrapper.
//!
//! The core never encrypts or stores secrets itself — it only consumes this
//! trait. Concrete backends (a KV store, AWS Secrets Manager, Azure Key
//! Vault) are adapters outside this crate's scope.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub secret_type: String,
    pub value: HashMap<String, String>,
    pub version: u32,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

#[async_trait]
pub trait SecretBackend: Send + Sync {
    async fn get(&self, name: &str) -> crate::Result<Secret>;
    async fn set(&self, secret: Secret) -> crate::Result<()>;
    async fn delete(&self, name: &str) -> crate::Result<()>;
    async fn list(&self, filter_type: Option<&str>) -> crate::Result<Vec<String>>;
    async fn rotate(&self, name: &str, new_value: HashMap<String, String>) -> crate::Result<Secret>;
    async fn health(&self) -> HealthStatus;
}

/// A process-memory backend. Not durable; suitable for tests and
/// single-node deployments with an external secret source disabled.
#[derive(Default)]
pub struct InMemorySecretBackend {
    secrets: RwLock<HashMap<String, Secret>>,
}

impl InMemorySecretBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretBackend for InMemorySecretBackend {
    async fn get(&self, name: &str) -> crate::Result<Secret> {
        self.secrets
            .read()
            .expect("secret lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| crate::Error::not_found(format!("secret {}", name)))
    }

    async fn set(&self, secret: Secret) -> crate::Result<()> {
        self.secrets.write().expect("secret lock poisoned").insert(secret.name.clone(), secret);
        Ok(())
    }

    async fn delete(&self, name: &str) -> crate::Result<()> {
        self.secrets.write().expect("secret lock poisoned").remove(name);
        Ok(())
    }

    async fn list(&self, filter_type: Option<&str>) -> crate::Result<Vec<String>> {
        Ok(self
            .secrets
            .read()
            .expect("secret lock poisoned")
            .values()
            .filter(|s| filter_type.map(|t| s.secret_type == t).unwrap_or(true))
            .map(|s| s.name.clone())
            .collect())
    }

    async fn rotate(&self, name: &str, new_value: HashMap<String, String>) -> crate::Result<Secret> {
        let mut secrets = self.secrets.write().expect("secret lock poisoned");
        let secret = secrets.get_mut(name).ok_or_else(|| crate::Error::not_found(format!("secret {}", name)))?;
        secret.value = new_value;
        secret.version += 1;
        secret.updated = Utc::now();
        Ok(secret.clone())
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

struct CacheEntry {
    secret: Secret,
    cached_at: Instant,
}

/// Read-mostly TTL cache in front of any [`SecretBackend`]. Reads take a
/// shared lock; writes (set/delete/rotate/invalidate) take an exclusive one
/// that blocks readers, matching the policy in §5.
pub struct CachedSecretBackend<B: SecretBackend> {
    inner: B,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl<B: SecretBackend> CachedSecretBackend<B> {
    pub fn new(inner: B, ttl: Duration) -> Self {
        Self { inner, ttl, cache: RwLock::new(HashMap::new()) }
    }

    fn cached(&self, name: &str) -> Option<Secret> {
        let cache = self.cache.read().expect("cache lock poisoned");
        cache.get(name).and_then(|entry| {
            if entry.cached_at.elapsed() < self.ttl {
                Some(entry.secret.clone())
            } else {
                None
            }
        })
    }

    pub fn invalidate(&self, name: &str) {
        self.cache.write().expect("cache lock poisoned").remove(name);
    }

    pub fn invalidate_all(&self) {
        self.cache.write().expect("cache lock poisoned").clear();
    }
}

#[async_trait]
impl<B: SecretBackend> SecretBackend for CachedSecretBackend<B> {
    async fn get(&self, name: &str) -> crate::Result<Secret> {
        if let Some(secret) = self.cached(name) {
            return Ok(secret);
        }
        let secret = self.inner.get(name).await?;
        self.cache
            .write()
            .expect("cache lock poisoned")
            .insert(name.to_string(), CacheEntry { secret: secret.clone(), cached_at: Instant::now() });
        Ok(secret)
    }

    async fn set(&self, secret: Secret) -> crate::Result<()> {
        let name = secret.name.clone();
        self.inner.set(secret).await?;
        self.invalidate(&name);
        Ok(())
    }

    async fn delete(&self, name: &str) -> crate::Result<()> {
        self.inner.delete(name).await?;
        self.invalidate(name);
        Ok(())
    }

    async fn list(&self, filter_type: Option<&str>) -> crate::Result<Vec<String>> {
        self.inner.list(filter_type).await
    }

    async fn rotate(&self, name: &str, new_value: HashMap<String, String>) -> crate::Result<Secret> {
        let secret = self.inner.rotate(name, new_value).await?;
        self.invalidate(name);
        Ok(secret)
    }

    async fn health(&self) -> HealthStatus {
        self.inner.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(name: &str) -> Secret {
        let now = Utc::now();
        Secret {
            name: name.to_string(),
            secret_type: "credential".to_string(),
            value: HashMap::from([("password".to_string(), "hunter2".to_string())]),
            version: 1,
            created: now,
            updated: now,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn in_memory_backend_roundtrips() {
        let backend = InMemorySecretBackend::new();
        backend.set(secret("esxi-prod")).await.unwrap();
        let fetched = backend.get("esxi-prod").await.unwrap();
        assert_eq!(fetched.version, 1);
        backend.delete("esxi-prod").await.unwrap();
        assert!(backend.get("esxi-prod").await.is_err());
    }

    #[tokio::test]
    async fn rotate_bumps_version() {
        let backend = InMemorySecretBackend::new();
        backend.set(secret("esxi-prod")).await.unwrap();
        let rotated = backend
            .rotate("esxi-prod", HashMap::from([("password".to_string(), "new".to_string())]))
            .await
            .unwrap();
        assert_eq!(rotated.version, 2);
    }

    #[tokio::test]
    async fn cache_serves_reads_without_hitting_backend_until_invalidated() {
        let backend = CachedSecretBackend::new(InMemorySecretBackend::new(), Duration::from_secs(60));
        backend.set(secret("esxi-prod")).await.unwrap();
        let first = backend.get("esxi-prod").await.unwrap();
        assert_eq!(first.version, 1);

        // Rotate goes through the cache wrapper, which invalidates on write.
        backend
            .rotate("esxi-prod", HashMap::from([("password".to_string(), "rotated".to_string())]))
            .await
            .unwrap();
        let second = backend.get("esxi-prod").await.unwrap();
        assert_eq!(second.version, 2);
    }
}
