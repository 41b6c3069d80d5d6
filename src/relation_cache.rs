//! Cached reverse one-to-one relations
//!
//! A relation is cached under the related type's own key. Because the link
//! is the related type's primary key, the related record shares its primary
//! key with the parent, and the lookup needs nothing but the parent.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::CacheError;
use crate::entity::{AsPrimaryKey, EntityType, Instance, RelationSlot};
use crate::model_cache::{GetOptions, get_instance};
use crate::registry::Shared;
use crate::signals;
use crate::unit_of_work::UnitOfWork;

/// Options for [`RowCacheBuilder::cache_relation`](crate::RowCacheBuilder::cache_relation)
#[derive(Debug, Clone, Default)]
pub struct RelationOptions {
    /// Time-to-live of related entries; the configured default when `None`
    pub ttl: Option<Duration>,
    /// Load the relation together with every read of the parent
    pub always_fetch: bool,
}

/// A declared cached relation
#[derive(Debug)]
pub struct Relation {
    name: String,
    parent: Arc<EntityType>,
    related: Arc<EntityType>,
    field: String,
    ttl: Option<Duration>,
    always_fetch: bool,
}

impl Relation {
    pub(crate) fn new(
        name: impl Into<String>,
        parent: Arc<EntityType>,
        related: Arc<EntityType>,
        field: String,
        options: RelationOptions,
    ) -> Self {
        Self {
            name: name.into(),
            parent,
            related,
            field,
            ttl: options.ttl,
            always_fetch: options.always_fetch,
        }
    }

    /// Accessor name on the parent
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> &Arc<EntityType> {
        &self.parent
    }

    pub fn related(&self) -> &Arc<EntityType> {
        &self.related
    }

    /// Field on the related type pointing back at the parent
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn always_fetch(&self) -> bool {
        self.always_fetch
    }
}

/// Outcome of a relation lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound => None,
        }
    }
}

/// Cache gateway for one relation
#[derive(Clone)]
pub struct CachedRelation {
    relation: Arc<Relation>,
    shared: Arc<Shared>,
}

impl CachedRelation {
    pub(crate) fn new(relation: Arc<Relation>, shared: Arc<Shared>) -> Self {
        Self { relation, shared }
    }

    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    /// Resolve the related instance of `instance`.
    ///
    /// A value loaded or assigned through the ordinary relation path wins.
    /// Otherwise the first lookup goes through the cache and its outcome,
    /// absence included, is remembered on `instance`. Absence is never
    /// written to the cache. Errors leave `instance` unresolved.
    pub async fn resolve<'a>(
        &self,
        instance: &'a mut Instance,
    ) -> Result<Lookup<&'a Instance>, CacheError> {
        let name = self.relation.name();

        if instance.related(name).is_some() {
            return Ok(match instance.related(name).flatten() {
                Some(related) => Lookup::Found(related),
                None => Lookup::NotFound,
            });
        }

        if matches!(instance.cached_related(name), RelationSlot::Unresolved) {
            let slot = self.load(instance).await?;
            instance.memoize_related(name, slot);
        }

        Ok(match instance.cached_related(name) {
            RelationSlot::Present(related) => Lookup::Found(related),
            _ => Lookup::NotFound,
        })
    }

    /// Like [`resolve`](Self::resolve), with absence reported as
    /// [`CacheError::RelatedNotFound`].
    pub async fn get<'a>(&self, instance: &'a mut Instance) -> Result<&'a Instance, CacheError> {
        match self.resolve(instance).await? {
            Lookup::Found(related) => Ok(related),
            Lookup::NotFound => Err(CacheError::RelatedNotFound {
                parent: self.relation.parent().id().clone(),
                relation: self.relation.name().to_owned(),
            }),
        }
    }

    /// Evict the cached related entry of `instance`.
    pub async fn clear(
        &self,
        uow: Option<&mut UnitOfWork>,
        instance: &Instance,
    ) -> Result<(), CacheError> {
        self.clear_pk(uow, [instance]).await
    }

    /// Evict the cached related entries of the parents with `pks`.
    pub async fn clear_pk<P: AsPrimaryKey>(
        &self,
        uow: Option<&mut UnitOfWork>,
        pks: impl IntoIterator<Item = P>,
    ) -> Result<(), CacheError> {
        let keys = self.shared.keys.keys(self.relation.related(), pks);
        signals::evict(&self.shared.backend, uow, keys).await
    }

    async fn load(&self, instance: &Instance) -> Result<RelationSlot, CacheError> {
        let mut options = GetOptions::new();
        if let Some(db) = &instance.state().db {
            options = options.using(db.clone());
        }
        let ttl = self
            .relation
            .ttl()
            .unwrap_or(self.shared.config.default_ttl);

        match get_instance(
            &self.shared,
            self.relation.related(),
            instance.pk().clone(),
            &options,
            ttl,
        )
        .await
        {
            Ok(related) => Ok(RelationSlot::Present(Box::new(related))),
            Err(CacheError::NotFound { .. }) => {
                debug!(
                    "No {} for {} {}",
                    self.relation.name(),
                    instance.entity().id(),
                    instance.pk()
                );
                Ok(RelationSlot::Absent)
            }
            Err(e) => Err(e),
        }
    }
}
