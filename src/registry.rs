//! Process-wide cache registry
//!
//! Every cached model and relation is declared once at startup through a
//! [`RowCacheBuilder`]. The resulting [`RowCache`] is read-only: it hands out
//! per-type gateways and the [`WriteListener`] stores report writes to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::backend::CacheBackend;
use crate::entity::{AsPrimaryKey, EntityId, EntityType};
use crate::key::KeyDeriver;
use crate::model_cache::CachedModel;
use crate::relation_cache::{CachedRelation, Relation, RelationOptions};
use crate::signals::{Invalidator, Signal, WriteListener};
use crate::store::Store;
use crate::{CacheConfig, CacheError};

/// State shared by every gateway of one registry
pub(crate) struct Shared {
    pub(crate) backend: Arc<dyn CacheBackend>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) keys: KeyDeriver,
    pub(crate) config: CacheConfig,
    always_fetch: HashMap<EntityId, Vec<Arc<Relation>>>,
}

impl Shared {
    /// Relations loaded together with `entity`, in declaration order
    pub(crate) fn always_fetch(&self, entity: &EntityId) -> &[Arc<Relation>] {
        self.always_fetch.get(entity).map_or(&[], Vec::as_slice)
    }
}

pub struct RowCacheBuilder {
    backend: Arc<dyn CacheBackend>,
    store: Arc<dyn Store>,
    config: CacheConfig,
    keys: KeyDeriver,
    models: HashMap<EntityId, (Arc<EntityType>, Option<Duration>)>,
    relations: HashMap<(EntityId, String), Arc<Relation>>,
    always_fetch: HashMap<EntityId, Vec<Arc<Relation>>>,
    invalidator: Invalidator,
}

impl RowCacheBuilder {
    /// Cache instances of `entity` by primary key.
    ///
    /// `ttl` overrides the configured default for this type. Declaring the
    /// same type again is a no-op.
    pub fn cache_model(&mut self, entity: &Arc<EntityType>, ttl: Option<Duration>) -> &mut Self {
        if self.models.contains_key(entity.id()) {
            debug!("Model {} is already cached", entity.id());
            return self;
        }
        self.models
            .insert(entity.id().clone(), (Arc::clone(entity), ttl));

        for signal in [Signal::PostSave, Signal::PostDelete] {
            self.invalidator.connect(entity.id(), signal, entity);
        }
        self
    }

    /// Cache the one-to-one relation `related_name` from `parent` to `related`.
    ///
    /// The link must be `related`'s primary key, since the cached instance is
    /// looked up with the parent's primary key. Anything else is rejected
    /// here rather than at first access. Declaring the same relation again is
    /// a no-op.
    pub fn cache_relation(
        &mut self,
        parent: &Arc<EntityType>,
        related: &Arc<EntityType>,
        related_name: &str,
        options: RelationOptions,
    ) -> Result<&mut Self, CacheError> {
        let link = related.link_to(parent.id(), related_name).ok_or_else(|| {
            CacheError::Configuration(format!(
                "{} has no one-to-one relation to {} named {:?}",
                related.id(),
                parent.id(),
                related_name
            ))
        })?;

        if link.field != related.primary_key().name {
            return Err(CacheError::Configuration(format!(
                "cached relations must be the primary key: {}.{} is not the primary key of {}",
                related.id(),
                link.field,
                related.id()
            )));
        }

        let key = (parent.id().clone(), related_name.to_owned());
        if self.relations.contains_key(&key) {
            debug!("Relation {}.{} is already cached", parent.id(), related_name);
            return Ok(self);
        }

        let relation = Arc::new(Relation::new(
            related_name,
            Arc::clone(parent),
            Arc::clone(related),
            link.field.clone(),
            options.clone(),
        ));

        if options.always_fetch {
            self.always_fetch
                .entry(parent.id().clone())
                .or_default()
                .push(Arc::clone(&relation));
        }
        self.relations.insert(key, relation);

        for signal in [Signal::PostSave, Signal::PostDelete] {
            self.invalidator.connect(related.id(), signal, related);
        }
        Ok(self)
    }

    pub fn build(self) -> RowCache {
        let shared = Arc::new(Shared {
            backend: self.backend,
            store: self.store,
            keys: self.keys,
            config: self.config,
            always_fetch: self.always_fetch,
        });

        let models = self
            .models
            .into_iter()
            .map(|(id, (entity, ttl))| (id, CachedModel::new(entity, ttl, Arc::clone(&shared))))
            .collect();

        let relations = self
            .relations
            .into_iter()
            .map(|(key, relation)| (key, CachedRelation::new(relation, Arc::clone(&shared))))
            .collect();

        RowCache {
            shared,
            models,
            relations,
            invalidator: Arc::new(self.invalidator),
        }
    }
}

/// Registry of cached models and relations
pub struct RowCache {
    shared: Arc<Shared>,
    models: HashMap<EntityId, CachedModel>,
    relations: HashMap<(EntityId, String), CachedRelation>,
    invalidator: Arc<Invalidator>,
}

impl RowCache {
    pub fn builder(
        backend: Arc<dyn CacheBackend>,
        store: Arc<dyn Store>,
        config: CacheConfig,
    ) -> RowCacheBuilder {
        let keys = KeyDeriver::new(config.key_prefix.clone());
        RowCacheBuilder {
            invalidator: Invalidator::new(Arc::clone(&backend), keys.clone()),
            backend,
            store,
            config,
            keys,
            models: HashMap::new(),
            relations: HashMap::new(),
            always_fetch: HashMap::new(),
        }
    }

    /// Gateway for a type declared with [`RowCacheBuilder::cache_model`]
    pub fn model(&self, entity: &EntityId) -> Result<&CachedModel, CacheError> {
        self.models.get(entity).ok_or_else(|| {
            CacheError::Configuration(format!("model {entity} is not cached"))
        })
    }

    /// Gateway for a relation declared with [`RowCacheBuilder::cache_relation`]
    pub fn relation(
        &self,
        parent: &EntityId,
        related_name: &str,
    ) -> Result<&CachedRelation, CacheError> {
        self.relations
            .get(&(parent.clone(), related_name.to_owned()))
            .ok_or_else(|| {
                CacheError::Configuration(format!(
                    "relation {parent}.{related_name} is not cached"
                ))
            })
    }

    /// Listener stores must notify after every save and delete
    pub fn listener(&self) -> Arc<dyn WriteListener> {
        Arc::clone(&self.invalidator) as Arc<dyn WriteListener>
    }

    pub fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }

    pub fn key(&self, entity: &EntityType, pk: impl AsPrimaryKey) -> String {
        self.shared.keys.key(entity, pk)
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.shared.backend
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Relations of `entity` fetched in the same round trip, in declaration order
    pub fn always_fetch(&self, entity: &EntityId) -> &[Arc<Relation>] {
        self.shared.always_fetch(entity)
    }
}
