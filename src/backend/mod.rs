//! Distributed cache backends
//!
//! The gateways talk to the cache only through [`CacheBackend`]. Every
//! operation reports failures as errors; a backend must never turn a
//! connectivity problem into a miss.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::CacheError;

mod memory;
mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Key/value store with per-entry time-to-live
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Fetch several keys at once. Missing keys are left out of the result.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    async fn set_many(
        &self,
        entries: HashMap<String, Vec<u8>>,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn delete_many(&self, keys: &[String]) -> Result<(), CacheError>;
}
