//! Read-through gateway for single records
//!
//! `get` tries the cache first and falls back to the store on a miss, then
//! fills the cache with what it loaded:
//! - a corrupt entry is purged and treated as a miss
//! - store "not found" propagates unchanged and is never cached
//! - cache or store failures propagate and leave the cache untouched
//!
//! Types with always-fetch relations read the parent and every related entry
//! in one multi-key round trip. Unless every key hits, they load everything
//! with one eager store query and refill all keys at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::CacheError;
use crate::codec;
use crate::entity::{AsPrimaryKey, EntityType, FieldValues, Instance, PrimaryKey, RelationSlot};
use crate::error::{DecodeError, StoreError};
use crate::registry::Shared;
use crate::relation_cache::Relation;
use crate::signals;
use crate::unit_of_work::UnitOfWork;

/// Per-call options for [`CachedModel::get_with`]
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    ttl: Option<Duration>,
    using: Option<String>,
    create: Option<FieldValues>,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time-to-live for entries written by this call
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Store alias to load from on a miss
    pub fn using(mut self, alias: impl Into<String>) -> Self {
        self.using = Some(alias.into());
        self
    }

    /// Create the record with `defaults` if the store does not have it
    pub fn create(mut self, defaults: FieldValues) -> Self {
        self.create = Some(defaults);
        self
    }
}

/// Cache gateway for one entity type
#[derive(Clone)]
pub struct CachedModel {
    entity: Arc<EntityType>,
    ttl: Option<Duration>,
    shared: Arc<Shared>,
}

impl CachedModel {
    pub(crate) fn new(entity: Arc<EntityType>, ttl: Option<Duration>, shared: Arc<Shared>) -> Self {
        Self {
            entity,
            ttl,
            shared,
        }
    }

    pub fn entity(&self) -> &Arc<EntityType> {
        &self.entity
    }

    pub fn key(&self, pk: impl AsPrimaryKey) -> String {
        self.shared.keys.key(&self.entity, pk)
    }

    pub async fn get(&self, pk: impl AsPrimaryKey) -> Result<Instance, CacheError> {
        self.get_with(pk, &GetOptions::default()).await
    }

    pub async fn get_with(
        &self,
        pk: impl AsPrimaryKey,
        options: &GetOptions,
    ) -> Result<Instance, CacheError> {
        let ttl = options
            .ttl
            .or(self.ttl)
            .unwrap_or(self.shared.config.default_ttl);
        get_instance(&self.shared, &self.entity, pk.as_primary_key(), options, ttl).await
    }

    /// Like [`get`](Self::get), but a missing key yields `None` without any
    /// cache or store traffic.
    pub async fn get_cached<P: AsPrimaryKey>(
        &self,
        pk: Option<P>,
    ) -> Result<Option<Instance>, CacheError> {
        match pk {
            Some(pk) => self.get(pk).await.map(Some),
            None => Ok(None),
        }
    }

    /// Evict the entries for `pks` in one batched delete.
    ///
    /// With a unit of work the eviction waits for its commit and is dropped
    /// on rollback; without one it happens immediately.
    pub async fn invalidate<P: AsPrimaryKey>(
        &self,
        uow: Option<&mut UnitOfWork>,
        pks: impl IntoIterator<Item = P>,
    ) -> Result<(), CacheError> {
        let keys = self.shared.keys.keys(&self.entity, pks);
        signals::evict(&self.shared.backend, uow, keys).await
    }
}

pub(crate) async fn get_instance(
    shared: &Shared,
    entity: &Arc<EntityType>,
    pk: PrimaryKey,
    options: &GetOptions,
    ttl: Duration,
) -> Result<Instance, CacheError> {
    let relations = shared.always_fetch(entity.id());
    if !relations.is_empty() {
        return get_with_related(shared, entity, pk, relations, options, ttl).await;
    }

    let key = shared.keys.key(entity, &pk);
    let db = options
        .using
        .as_deref()
        .unwrap_or(&shared.config.default_database);

    if let Some(bytes) = shared.backend.get(&key).await? {
        match codec::decode(entity, &bytes, pk.clone(), db) {
            Ok(instance) => {
                debug!("Cache hit for key: {}", key);
                return Ok(instance);
            }
            Err(e) => {
                warn!(
                    "Failed to deserialize cached value for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                shared.backend.delete(&key).await?;
            }
        }
    } else {
        debug!("Cache miss for key: {}", key);
    }

    fill(shared, entity, &pk, &key, options, ttl).await
}

/// Load one record from the store and write it to the cache.
async fn fill(
    shared: &Shared,
    entity: &Arc<EntityType>,
    pk: &PrimaryKey,
    key: &str,
    options: &GetOptions,
    ttl: Duration,
) -> Result<Instance, CacheError> {
    let using = options.using.as_deref();
    let instance = match &options.create {
        Some(defaults) => shared.store.get_or_create(entity, pk, defaults, using).await?,
        None => shared.store.get(entity, pk, using).await?,
    };

    let bytes = codec::encode(&instance)?;
    shared.backend.set(key, bytes, ttl).await?;
    debug!("Cache filled from store for key: {}", key);

    Ok(instance)
}

async fn get_with_related(
    shared: &Shared,
    entity: &Arc<EntityType>,
    pk: PrimaryKey,
    relations: &[Arc<Relation>],
    options: &GetOptions,
    ttl: Duration,
) -> Result<Instance, CacheError> {
    let parent_key = shared.keys.key(entity, &pk);
    let related_keys: Vec<String> = relations
        .iter()
        .map(|r| shared.keys.key(r.related(), &pk))
        .collect();
    let all_keys: Vec<String> = std::iter::once(parent_key.clone())
        .chain(related_keys.iter().cloned())
        .collect();
    let db = options
        .using
        .as_deref()
        .unwrap_or(&shared.config.default_database);

    let mut found = shared.backend.get_many(&all_keys).await?;
    if found.len() == all_keys.len() {
        match stitch(entity, &pk, relations, &all_keys, &mut found, db) {
            Ok(instance) => {
                debug!(
                    "Cache hit for key {} and {} related keys",
                    parent_key,
                    relations.len()
                );
                return Ok(instance);
            }
            Err(e) => {
                warn!(
                    "Failed to deserialize cached values for key {}: {}. Deleting {} entries.",
                    parent_key,
                    e,
                    all_keys.len()
                );
                shared.backend.delete_many(&all_keys).await?;
            }
        }
    } else {
        debug!(
            "Partial cache miss for key {} ({} of {} keys present)",
            parent_key,
            found.len(),
            all_keys.len()
        );
    }

    let using = options.using.as_deref();
    let mut parent = match shared
        .store
        .get_with_related(entity, &pk, relations, using)
        .await
    {
        Ok(parent) => parent,
        Err(StoreError::NotFound { .. }) if options.create.is_some() => {
            // A newly created record has no related rows yet; leave the
            // relations unresolved so the accessors look them up lazily.
            return fill(shared, entity, &pk, &parent_key, options, ttl).await;
        }
        Err(e) => return Err(e.into()),
    };

    let mut entries = HashMap::with_capacity(all_keys.len());
    entries.insert(parent_key.clone(), codec::encode(&parent)?);

    for (relation, key) in relations.iter().zip(related_keys) {
        let slot = match parent.related(relation.name()) {
            Some(Some(related)) => {
                entries.insert(key, codec::encode(related)?);
                RelationSlot::Present(Box::new(related.detached()))
            }
            // Absence is only remembered on this instance, never in the cache.
            Some(None) => RelationSlot::Absent,
            None => continue,
        };
        parent.memoize_related(relation.name(), slot);
    }

    let written = entries.len();
    shared.backend.set_many(entries, ttl).await?;
    debug!(
        "Cache filled from store for key {} ({} entries)",
        parent_key, written
    );

    Ok(parent)
}

/// Build the parent from a complete batch and attach every related instance.
fn stitch(
    entity: &Arc<EntityType>,
    pk: &PrimaryKey,
    relations: &[Arc<Relation>],
    keys: &[String],
    found: &mut HashMap<String, Vec<u8>>,
    db: &str,
) -> Result<Instance, DecodeError> {
    let mut bytes_for = |key: &String| found.remove(key).unwrap_or_default();

    let mut parent = codec::decode(entity, &bytes_for(&keys[0]), pk.clone(), db)?;
    for (relation, key) in relations.iter().zip(&keys[1..]) {
        let related = codec::decode(relation.related(), &bytes_for(key), pk.clone(), db)?;
        parent.memoize_related(relation.name(), RelationSlot::Present(Box::new(related)));
    }
    Ok(parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheConfig;
    use crate::registry::RowCache;
    use crate::relation_cache::RelationOptions;
    use crate::testing::{Fixture, always_related, foo, to_load};
    use serde_json::Value;

    fn foo_cache(fixture: &Fixture) -> (RowCache, Arc<EntityType>) {
        let foo = foo();
        let mut builder = RowCache::builder(
            Arc::clone(&fixture.backend),
            Arc::clone(&fixture.store),
            CacheConfig::default(),
        );
        builder.cache_model(&foo, None);
        let cache = builder.build();
        fixture.db.connect(cache.listener());
        (cache, foo)
    }

    fn always_fetch_cache(fixture: &Fixture) -> (RowCache, Arc<EntityType>, Arc<EntityType>) {
        let to_load = to_load();
        let always_related = always_related(&to_load);
        let mut builder = RowCache::builder(
            Arc::clone(&fixture.backend),
            Arc::clone(&fixture.store),
            CacheConfig::default(),
        );
        builder.cache_model(&to_load, None);
        builder
            .cache_relation(
                &to_load,
                &always_related,
                "always_related",
                RelationOptions {
                    always_fetch: true,
                    ..RelationOptions::default()
                },
            )
            .unwrap();
        let cache = builder.build();
        fixture.db.connect(cache.listener());
        (cache, to_load, always_related)
    }

    async fn create(fixture: &Fixture, instance: Instance) -> Instance {
        let mut uow = UnitOfWork::begin();
        let saved = fixture.db.save(&mut uow, &instance);
        uow.commit().await.unwrap();
        saved
    }

    #[tokio::test]
    async fn test_cached_get() {
        let fixture = Fixture::plain();
        let (cache, foo) = foo_cache(&fixture);
        let model = cache.model(foo.id()).unwrap();
        let saved = create(
            &fixture,
            Instance::new(foo.clone(), 1_i64).with("bar", "bees").unwrap(),
        )
        .await;

        let first = model.get(1_i64).await.unwrap();
        assert_eq!(fixture.db.queries(), 1);

        let second = model.get(1_i64).await.unwrap();
        assert_eq!(fixture.db.queries(), 1);
        assert_eq!(first, saved);
        assert_eq!(second, first);
        assert!(!second.state().adding);
        assert_eq!(second.state().db.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_update() {
        let fixture = Fixture::plain();
        let (cache, foo) = foo_cache(&fixture);
        let model = cache.model(foo.id()).unwrap();
        let mut saved = create(
            &fixture,
            Instance::new(foo.clone(), 1_i64).with("bar", "bees").unwrap(),
        )
        .await;
        model.get(1_i64).await.unwrap();

        saved.set("bar", "quux").unwrap();
        let mut uow = UnitOfWork::begin();
        fixture.db.save(&mut uow, &saved);
        uow.commit().await.unwrap();

        let fresh = model.get(1_i64).await.unwrap();
        assert_eq!(fresh.get("bar"), Some(&Value::from("quux")));
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_delete() {
        let fixture = Fixture::plain();
        let (cache, foo) = foo_cache(&fixture);
        let model = cache.model(foo.id()).unwrap();
        let saved = create(
            &fixture,
            Instance::new(foo.clone(), 1_i64).with("bar", "bees").unwrap(),
        )
        .await;
        model.get(1_i64).await.unwrap();

        let mut uow = UnitOfWork::begin();
        fixture.db.delete(&mut uow, &saved);
        uow.commit().await.unwrap();

        let err = model.get(1_i64).await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound { .. }));
        assert!(!fixture.memory.contains(&model.key(1_i64)).await);
    }

    #[tokio::test]
    async fn test_aborted_unit_of_work_keeps_entry() {
        let fixture = Fixture::plain();
        let (cache, foo) = foo_cache(&fixture);
        let model = cache.model(foo.id()).unwrap();
        let mut saved = create(
            &fixture,
            Instance::new(foo.clone(), 1_i64).with("bar", "bees").unwrap(),
        )
        .await;
        model.get(1_i64).await.unwrap();

        saved.set("bar", "quux").unwrap();
        let mut uow = UnitOfWork::begin();
        fixture.db.save(&mut uow, &saved);
        assert!(fixture.memory.contains(&model.key(1_i64)).await);
        uow.rollback();

        assert!(fixture.memory.contains(&model.key(1_i64)).await);
        let queries = fixture.db.queries();
        model.get(1_i64).await.unwrap();
        assert_eq!(fixture.db.queries(), queries);
    }

    #[tokio::test]
    async fn test_corrupt_entry_falls_back_to_store_once() {
        let fixture = Fixture::plain();
        let (cache, foo) = foo_cache(&fixture);
        let model = cache.model(foo.id()).unwrap();
        create(&fixture, Instance::new(foo.clone(), 1_i64).with("bar", "bees").unwrap()).await;

        fixture
            .backend
            .set(&model.key(1_i64), b"\x80garbage".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let deletes = fixture.instrumented.deletes();

        let instance = model.get(1_i64).await.unwrap();
        assert_eq!(instance.get("bar"), Some(&Value::from("bees")));
        assert_eq!(fixture.db.queries(), 1);
        assert_eq!(fixture.instrumented.deletes(), deletes + 1);

        // The purged key was refilled with a valid entry.
        model.get(1_i64).await.unwrap();
        assert_eq!(fixture.db.queries(), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_cached() {
        let fixture = Fixture::plain();
        let (cache, foo) = foo_cache(&fixture);
        let model = cache.model(foo.id()).unwrap();

        assert!(model.get(9_i64).await.unwrap_err().is_not_found());
        assert!(!fixture.memory.contains(&model.key(9_i64)).await);
        assert!(model.get(9_i64).await.is_err());
        assert_eq!(fixture.db.queries(), 2);
    }

    #[tokio::test]
    async fn test_backend_failure_propagates_without_fill() {
        let fixture = Fixture::plain();
        let (cache, foo) = foo_cache(&fixture);
        let model = cache.model(foo.id()).unwrap();
        create(&fixture, Instance::new(foo.clone(), 1_i64)).await;

        fixture.instrumented.fail_reads(true);
        let err = model.get(1_i64).await.unwrap_err();
        assert!(matches!(err, CacheError::Backend(_)));
        assert_eq!(fixture.db.queries(), 0);
        assert!(!fixture.memory.contains(&model.key(1_i64)).await);
    }

    #[tokio::test]
    async fn test_get_cached_without_key() {
        let fixture = Fixture::plain();
        let (cache, foo) = foo_cache(&fixture);
        let model = cache.model(foo.id()).unwrap();

        assert!(model.get_cached(None::<i64>).await.unwrap().is_none());
        assert_eq!(fixture.instrumented.reads(), 0);
    }

    #[tokio::test]
    async fn test_get_or_create_and_options() {
        let fixture = Fixture::plain();
        let (cache, foo) = foo_cache(&fixture);
        let model = cache.model(foo.id()).unwrap();

        let mut defaults = FieldValues::new();
        defaults.insert("bar".to_owned(), Value::from("made"));
        let options = GetOptions::new()
            .create(defaults)
            .using("replica")
            .ttl(Duration::from_secs(5));

        let created = model.get_with(4_i64, &options).await.unwrap();
        assert_eq!(created.get("bar"), Some(&Value::from("made")));

        let cached = model.get_with(4_i64, &options).await.unwrap();
        assert_eq!(cached.state().db.as_deref(), Some("replica"));
        assert_eq!(fixture.db.queries(), 1);
    }

    #[tokio::test]
    async fn test_manual_invalidate() {
        let fixture = Fixture::plain();
        let (cache, foo) = foo_cache(&fixture);
        let model = cache.model(foo.id()).unwrap();
        create(&fixture, Instance::new(foo.clone(), 1_i64)).await;
        create(&fixture, Instance::new(foo.clone(), 2_i64)).await;
        model.get(1_i64).await.unwrap();
        model.get(2_i64).await.unwrap();

        let mut uow = UnitOfWork::begin();
        model.invalidate(Some(&mut uow), [1_i64, 2_i64]).await.unwrap();
        assert!(fixture.memory.contains(&model.key(1_i64)).await);
        uow.commit().await.unwrap();
        assert!(!fixture.memory.contains(&model.key(1_i64)).await);
        assert!(!fixture.memory.contains(&model.key(2_i64)).await);

        model.get(1_i64).await.unwrap();
        model.invalidate(None, [1_i64]).await.unwrap();
        assert!(!fixture.memory.contains(&model.key(1_i64)).await);
    }

    #[tokio::test]
    async fn test_always_fetch_all_hit_uses_no_queries() {
        let fixture = Fixture::plain();
        let (cache, to_load, always_related) = always_fetch_cache(&fixture);
        let model = cache.model(to_load.id()).unwrap();
        create(&fixture, Instance::new(to_load.clone(), 1_i64).with("name", "bees").unwrap()).await;
        let related = create(
            &fixture,
            Instance::new(always_related.clone(), 1_i64).with("value", 3).unwrap(),
        )
        .await;

        model.get(1_i64).await.unwrap();
        assert_eq!(fixture.db.queries(), 1);

        let mut cached = model.get(1_i64).await.unwrap();
        assert_eq!(fixture.db.queries(), 1);
        fixture.memory.clear();

        let relation = cache.relation(to_load.id(), "always_related").unwrap();
        assert_eq!(relation.get(&mut cached).await.unwrap(), &related);
        assert_eq!(fixture.db.queries(), 1);
    }

    #[tokio::test]
    async fn test_always_fetch_relation_miss_reloads_everything() {
        let fixture = Fixture::plain();
        let (cache, to_load, always_related) = always_fetch_cache(&fixture);
        let model = cache.model(to_load.id()).unwrap();
        create(&fixture, Instance::new(to_load.clone(), 1_i64).with("name", "bees").unwrap()).await;
        let related = create(&fixture, Instance::new(always_related.clone(), 1_i64)).await;
        model.get(1_i64).await.unwrap();

        let related_model_key = cache.key(&always_related, 1_i64);
        fixture.backend.delete(&related_model_key).await.unwrap();
        fixture.db.reset_queries();

        let mut cached = model.get(1_i64).await.unwrap();
        assert_eq!(fixture.db.queries(), 1);
        assert!(fixture.memory.contains(&related_model_key).await);
        assert!(fixture.memory.contains(&model.key(1_i64)).await);

        let relation = cache.relation(to_load.id(), "always_related").unwrap();
        assert_eq!(relation.get(&mut cached).await.unwrap(), &related);
        assert_eq!(fixture.db.queries(), 1);
    }

    #[tokio::test]
    async fn test_always_fetch_missing_relation_memoized_locally() {
        let fixture = Fixture::plain();
        let (cache, to_load, _) = always_fetch_cache(&fixture);
        let model = cache.model(to_load.id()).unwrap();
        create(&fixture, Instance::new(to_load.clone(), 1_i64)).await;

        let writes = fixture.instrumented.writes();
        let mut cached = model.get(1_i64).await.unwrap();
        assert_eq!(fixture.db.queries(), 1);
        assert_eq!(fixture.instrumented.writes(), writes + 1);

        let relation = cache.relation(to_load.id(), "always_related").unwrap();
        let err = relation.get(&mut cached).await.unwrap_err();
        assert!(matches!(err, CacheError::RelatedNotFound { .. }));
        assert_eq!(fixture.db.queries(), 1);
        assert!(matches!(
            cached.cached_related("always_related"),
            RelationSlot::Absent
        ));
    }

    #[tokio::test]
    async fn test_always_fetch_create_caches_parent_alone() {
        let fixture = Fixture::plain();
        let (cache, to_load, always_related) = always_fetch_cache(&fixture);
        let model = cache.model(to_load.id()).unwrap();
        let related_key = cache.key(&always_related, 1_i64);

        let mut defaults = FieldValues::new();
        defaults.insert("name".to_owned(), Value::from("made"));
        let options = GetOptions::new().create(defaults);

        // One eager lookup that finds nothing, then the insert.
        let created = model.get_with(1_i64, &options).await.unwrap();
        assert_eq!(created.get("name"), Some(&Value::from("made")));
        assert_eq!(fixture.db.queries(), 2);
        assert!(fixture.memory.contains(&model.key(1_i64)).await);
        assert!(!fixture.memory.contains(&related_key).await);
        assert!(matches!(
            created.cached_related("always_related"),
            RelationSlot::Unresolved
        ));

        // The absent relation is never cached, so each read costs one eager query.
        let again = model.get_with(1_i64, &options).await.unwrap();
        assert_eq!(again, created);
        assert_eq!(fixture.db.queries(), 3);
        assert!(matches!(
            again.cached_related("always_related"),
            RelationSlot::Absent
        ));

        model.get_with(1_i64, &options).await.unwrap();
        assert_eq!(fixture.db.queries(), 4);
        assert!(!fixture.memory.contains(&related_key).await);
    }

    #[tokio::test]
    async fn test_always_fetch_corrupt_batch_purges_all_keys() {
        let fixture = Fixture::plain();
        let (cache, to_load, always_related) = always_fetch_cache(&fixture);
        let model = cache.model(to_load.id()).unwrap();
        create(&fixture, Instance::new(to_load.clone(), 1_i64)).await;
        create(&fixture, Instance::new(always_related.clone(), 1_i64)).await;
        model.get(1_i64).await.unwrap();

        let related_key = cache.key(&always_related, 1_i64);
        fixture
            .backend
            .set(&related_key, b"[1,2,3]".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        fixture.db.reset_queries();

        let mut cached = model.get(1_i64).await.unwrap();
        assert_eq!(fixture.db.queries(), 1);
        assert!(fixture.memory.contains(&related_key).await);

        let relation = cache.relation(to_load.id(), "always_related").unwrap();
        assert!(relation.get(&mut cached).await.is_ok());
        assert_eq!(fixture.db.queries(), 1);
    }
}
