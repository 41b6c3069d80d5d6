//! Cache configuration

use std::time::Duration;

use crate::CacheError;

/// Configuration shared by every gateway built from one registry
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live used when neither the call nor the registration sets one
    pub default_ttl: Duration,
    /// Leading component of every cache key
    pub key_prefix: String,
    /// Store alias stamped onto cache-built instances when no hint is given
    pub default_database: String,
    /// Maximum number of entries held by the in-process backend
    pub memory_max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60 * 60 * 24 * 3), // 3 days
            key_prefix: "rowcache".to_owned(),
            default_database: "default".to_owned(),
            memory_max_capacity: 10_000,
        }
    }
}

impl CacheConfig {
    /// Build a configuration from `ROWCACHE_*` environment variables.
    ///
    /// Unset variables keep their defaults; set but unparsable ones are a
    /// configuration error.
    pub fn from_env() -> Result<Self, CacheError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CacheError> {
        let mut config = Self::default();

        if let Some(secs) = lookup("ROWCACHE_DEFAULT_TTL_SECS") {
            let secs = secs.trim().parse::<u64>().map_err(|e| {
                CacheError::Configuration(format!(
                    "ROWCACHE_DEFAULT_TTL_SECS must be a number of seconds: {e}"
                ))
            })?;
            config.default_ttl = Duration::from_secs(secs);
        }

        if let Some(prefix) = lookup("ROWCACHE_KEY_PREFIX") {
            if prefix.is_empty() || prefix.contains(char::is_whitespace) {
                return Err(CacheError::Configuration(format!(
                    "ROWCACHE_KEY_PREFIX must be non-empty without whitespace, got {prefix:?}"
                )));
            }
            config.key_prefix = prefix;
        }

        if let Some(alias) = lookup("ROWCACHE_DEFAULT_DATABASE") {
            config.default_database = alias;
        }

        if let Some(capacity) = lookup("ROWCACHE_MEMORY_MAX_CAPACITY") {
            config.memory_max_capacity = capacity.trim().parse::<u64>().map_err(|e| {
                CacheError::Configuration(format!(
                    "ROWCACHE_MEMORY_MAX_CAPACITY must be an integer: {e}"
                ))
            })?;
        }

        Ok(config)
    }
}
