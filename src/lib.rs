//! rowcache - Read-through row cache for relational stores
//!
//! This library caches single records by primary key in a shared key/value
//! cache:
//! - Reads try the cache first and fill it from the store on a miss
//! - Writes evict affected entries once the writing unit of work commits
//! - Reverse one-to-one relations are cached under the related type's key
//! - Relations marked always-fetch load together with their parent in one
//!   round trip
//!
//! Backends for Redis and for an in-process Moka cache are included.

pub mod auth;
pub mod backend;
pub mod codec;
mod config;
pub mod entity;
mod error;
pub mod fragment;
mod key;
mod model_cache;
mod registry;
mod relation_cache;
mod signals;
mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
mod unit_of_work;

pub use auth::{CachedAuthentication, SESSION_USER_KEY};
pub use backend::{CacheBackend, MemoryBackend, RedisBackend};
pub use config::CacheConfig;
pub use entity::{
    AsPrimaryKey, EntityId, EntityType, Field, FieldKind, FieldValues, Instance, PrimaryKey,
    RelationSlot,
};
pub use error::{CacheError, DecodeError, StoreError};
pub use fragment::FragmentCache;
pub use key::KeyDeriver;
pub use model_cache::{CachedModel, GetOptions};
pub use registry::{RowCache, RowCacheBuilder};
pub use relation_cache::{CachedRelation, Lookup, Relation, RelationOptions};
pub use signals::{Invalidator, Signal, WriteListener};
pub use store::Store;
pub use unit_of_work::UnitOfWork;

// Re-export async_trait for convenience
pub use async_trait::async_trait;
