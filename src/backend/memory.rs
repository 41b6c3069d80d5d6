//! In-process backend built on a Moka cache
//!
//! Useful for single-process deployments and tests. Each entry carries its
//! own time-to-live through a [`moka::Expiry`] policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use tracing::debug;

use super::CacheBackend;
use crate::{CacheConfig, CacheError};

#[derive(Clone)]
struct Entry {
    bytes: Arc<[u8]>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Moka-backed [`CacheBackend`]
#[derive(Clone)]
pub struct MemoryBackend {
    cache: Cache<String, Entry>,
}

impl MemoryBackend {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.memory_max_capacity)
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.cache.get(key).await.is_some()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.cache.get(key).await.map(|e| e.bytes.to_vec()))
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.cache.get(key).await {
                found.insert(key.clone(), entry.bytes.to_vec());
            }
        }
        Ok(found)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            // A zero time-to-live means "do not keep"; also drop any older value.
            debug!("Skipping memory SET with zero ttl for key: {}", key);
            self.cache.invalidate(key).await;
            return Ok(());
        }
        let entry = Entry {
            bytes: value.into(),
            ttl,
        };
        self.cache.insert(key.to_owned(), entry).await;
        Ok(())
    }

    async fn set_many(
        &self,
        entries: HashMap<String, Vec<u8>>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        for (key, value) in entries {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.cache.invalidate(key).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = MemoryBackend::new(100);
        backend
            .set("a", b"1".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(b"1".to_vec()));

        backend.delete("a").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_many_omits_missing_keys() {
        let backend = MemoryBackend::new(100);
        let mut entries = HashMap::new();
        entries.insert("a".to_owned(), b"1".to_vec());
        entries.insert("b".to_owned(), b"2".to_vec());
        backend
            .set_many(entries, Duration::from_secs(60))
            .await
            .unwrap();

        let found = backend
            .get_many(&["a".to_owned(), "b".to_owned(), "c".to_owned()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found.get("b"), Some(&b"2".to_vec()));
        assert!(!found.contains_key("c"));

        backend
            .delete_many(&["a".to_owned(), "b".to_owned()])
            .await
            .unwrap();
        assert!(backend.get_many(&["a".to_owned()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let backend = MemoryBackend::new(100);
        backend
            .set("short", b"x".to_vec(), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(backend.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_stored() {
        let backend = MemoryBackend::new(100);
        backend
            .set("k", b"x".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        backend.set("k", b"y".to_vec(), Duration::ZERO).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
    }
}
