//! In-process shared tier backends.
//!
//! [`InMemorySharedTier`] stands in for a cluster store in single-node
//! deployments and tests. [`NoopSharedTier`] disables the shared tier
//! entirely: every lookup misses and every write is dropped.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use idemp_core::{IdempotencyError, IdempotencyResult, Timestamp};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;

use super::traits::SharedTier;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expiry: Timestamp,
}

impl StoredValue {
    fn is_live(&self, now: Timestamp) -> bool {
        now < self.expiry
    }
}

/// Shared tier held in process memory.
///
/// Values are stored serialized, so callers see the same encode/decode
/// behavior as with a networked backend. `save_if_absent` is atomic.
#[derive(Debug, Default)]
pub struct InMemorySharedTier {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl InMemorySharedTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values, expired ones included.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop expired values. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, stored| stored.is_live(now));
        before - entries.len()
    }
}

fn require_key(key: &str) -> IdempotencyResult<()> {
    if key.is_empty() {
        return Err(IdempotencyError::invalid_argument(
            "key",
            "idempotency key must not be empty",
        ));
    }
    Ok(())
}

#[async_trait]
impl SharedTier for InMemorySharedTier {
    fn name(&self) -> &str {
        "memory"
    }

    async fn contains(&self, key: &str) -> IdempotencyResult<bool> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        Ok(entries.get(key).is_some_and(|stored| stored.is_live(now)))
    }

    async fn get<T>(&self, key: &str) -> IdempotencyResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let now = Utc::now();
        let bytes = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(stored) if stored.is_live(now) => stored.bytes.clone(),
                _ => return Ok(None),
            }
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save<T>(&self, key: &str, value: &T, expiry: Timestamp) -> IdempotencyResult<()>
    where
        T: Serialize + Sync,
    {
        require_key(key)?;
        let bytes = serde_json::to_vec(value)?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), StoredValue { bytes, expiry });
        Ok(())
    }

    async fn save_if_absent<T>(
        &self,
        key: &str,
        value: &T,
        expiry: Timestamp,
    ) -> IdempotencyResult<bool>
    where
        T: Serialize + Sync,
    {
        require_key(key)?;
        let bytes = serde_json::to_vec(value)?;
        let now = Utc::now();

        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|stored| stored.is_live(now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), StoredValue { bytes, expiry });
        Ok(true)
    }

    async fn remove(&self, key: &str) -> IdempotencyResult<()> {
        require_key(key)?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn is_healthy(&self) -> IdempotencyResult<bool> {
        Ok(true)
    }
}

/// Shared tier that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSharedTier;

#[async_trait]
impl SharedTier for NoopSharedTier {
    fn name(&self) -> &str {
        "noop"
    }

    async fn contains(&self, _key: &str) -> IdempotencyResult<bool> {
        Ok(false)
    }

    async fn get<T>(&self, _key: &str) -> IdempotencyResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        Ok(None)
    }

    async fn save<T>(&self, _key: &str, _value: &T, _expiry: Timestamp) -> IdempotencyResult<()>
    where
        T: Serialize + Sync,
    {
        Ok(())
    }

    async fn remove(&self, _key: &str) -> IdempotencyResult<()> {
        Ok(())
    }

    async fn is_healthy(&self) -> IdempotencyResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_save_and_get() {
        let tier = InMemorySharedTier::new();
        let expiry = Utc::now() + Duration::seconds(60);
        tier.save("k", &"value".to_string(), expiry).await.unwrap();

        assert!(tier.contains("k").await.unwrap());
        let loaded: Option<String> = tier.get("k").await.unwrap();
        assert_eq!(loaded.as_deref(), Some("value"));
        assert!(tier.get::<String>("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_value_is_absent() {
        let tier = InMemorySharedTier::new();
        let expiry = Utc::now() - Duration::seconds(1);
        tier.save("k", &1u32, expiry).await.unwrap();

        assert!(!tier.contains("k").await.unwrap());
        assert!(tier.get::<u32>("k").await.unwrap().is_none());
        assert_eq!(tier.purge_expired().await, 1);
        assert!(tier.is_empty().await);
    }

    #[tokio::test]
    async fn test_save_if_absent_is_first_writer_wins() {
        let tier = InMemorySharedTier::new();
        let expiry = Utc::now() + Duration::seconds(60);

        assert!(tier.save_if_absent("k", &1u32, expiry).await.unwrap());
        assert!(!tier.save_if_absent("k", &2u32, expiry).await.unwrap());
        assert_eq!(tier.get::<u32>("k").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_save_if_absent_replaces_expired() {
        let tier = InMemorySharedTier::new();
        tier.save("k", &1u32, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        let expiry = Utc::now() + Duration::seconds(60);
        assert!(tier.save_if_absent("k", &2u32, expiry).await.unwrap());
        assert_eq!(tier.get::<u32>("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_type_mismatch_is_serialization_error() {
        let tier = InMemorySharedTier::new();
        let expiry = Utc::now() + Duration::seconds(60);
        tier.save("k", &"text", expiry).await.unwrap();

        let err = tier.get::<u64>("k").await.unwrap_err();
        assert!(matches!(
            err,
            IdempotencyError::Cache(idemp_core::CacheError::Serialization { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_and_empty_key() {
        let tier = InMemorySharedTier::new();
        let expiry = Utc::now() + Duration::seconds(60);
        tier.save("k", &1u32, expiry).await.unwrap();
        tier.remove("k").await.unwrap();
        tier.remove("k").await.unwrap();
        assert!(!tier.contains("k").await.unwrap());

        assert!(tier.save("", &1u32, expiry).await.unwrap_err().is_invalid_argument());
    }

    #[tokio::test]
    async fn test_noop_tier() {
        let tier = NoopSharedTier;
        let expiry = Utc::now() + Duration::seconds(60);
        tier.save("k", &1u32, expiry).await.unwrap();

        assert!(!tier.contains("k").await.unwrap());
        assert!(tier.get::<u32>("k").await.unwrap().is_none());
        assert!(tier.is_healthy().await.unwrap());
        // Default contains-then-save reports a store that never keeps anything.
        assert!(tier.save_if_absent("k", &1u32, expiry).await.unwrap());
    }
}
