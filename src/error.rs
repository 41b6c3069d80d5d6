//! Cache error types

use redis::RedisError;

use crate::entity::{EntityId, PrimaryKey};

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A cache entry could not be turned back into an instance.
    ///
    /// Gateways recover from this by purging the entry; it never reaches a
    /// caller of `get`.
    #[error("Corrupt cache entry: {0}")]
    Decode(#[from] DecodeError),

    #[error("Cache backend error: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    #[error("Store error: {0}")]
    Store(Box<dyn std::error::Error + Send + Sync>),

    #[error("{entity} matching primary key {pk} does not exist")]
    NotFound { entity: EntityId, pk: PrimaryKey },

    #[error("{parent} has no {relation}")]
    RelatedNotFound { parent: EntityId, relation: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{entity} has no field named {field:?}")]
    UnknownField { entity: EntityId, field: String },
}

impl CacheError {
    /// True for every "does not exist" condition, whether raised for a
    /// direct lookup or for a relation accessor.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::RelatedNotFound { .. })
    }
}

/// Reasons a cache entry fails to decode
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("field {0:?} is not cached for this entity type")]
    UnexpectedField(String),

    #[error("field {0:?} is missing")]
    MissingField(String),
}

/// Errors reported by a [`Store`](crate::Store)
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} matching primary key {pk} does not exist")]
    NotFound { entity: EntityId, pk: PrimaryKey },

    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, pk } => CacheError::NotFound { entity, pk },
            StoreError::Backend(e) => CacheError::Store(e),
        }
    }
}
