//! Rendered-fragment cache keyed by caller-chosen strings
//!
//! Keys are used verbatim, without hashing, so a fragment can be located and
//! evicted from outside the process that rendered it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::CacheError;
use crate::backend::CacheBackend;

#[derive(Clone)]
pub struct FragmentCache {
    backend: Arc<dyn CacheBackend>,
}

impl FragmentCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Return the fragment stored under `key`, rendering and storing it on a
    /// miss.
    pub async fn get_or_render<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        render: F,
    ) -> Result<String, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = String>,
    {
        if let Some(content) = self.lookup(key).await? {
            debug!("Fragment cache hit for key: {}", key);
            return Ok(content);
        }

        let content = render().await;
        self.backend
            .set(key, content.clone().into_bytes(), ttl)
            .await?;
        debug!("Fragment rendered and cached for key: {}", key);
        Ok(content)
    }

    /// The fragment stored under `key`, or the empty string. Never renders.
    pub async fn show_if_cached(&self, key: &str) -> Result<String, CacheError> {
        Ok(self.lookup(key).await?.unwrap_or_default())
    }

    async fn lookup(&self, key: &str) -> Result<Option<String>, CacheError> {
        let Some(bytes) = self.backend.get(key).await? else {
            return Ok(None);
        };
        match String::from_utf8(bytes) {
            Ok(content) => Ok(Some(content)),
            Err(e) => {
                warn!("Cached fragment for key {} is not UTF-8: {}", key, e);
                Ok(None)
            }
        }
    }
}
