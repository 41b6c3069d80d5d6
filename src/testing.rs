//! In-memory doubles for the store and the cache backend

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::CacheError;
use crate::backend::{CacheBackend, MemoryBackend};
use crate::entity::{EntityId, EntityType, Field, FieldValues, Instance, PrimaryKey};
use crate::error::StoreError;
use crate::relation_cache::Relation;
use crate::signals::{Signal, WriteListener};
use crate::store::Store;
use crate::unit_of_work::UnitOfWork;

const DEFAULT_DB: &str = "default";

/// Store double keeping rows in a map.
///
/// Every [`Store`] call counts as one query. Writes go through [`save`] and
/// [`delete`], which notify the connected listener the way a real store's
/// hooks would.
///
/// [`save`]: MemoryStore::save
/// [`delete`]: MemoryStore::delete
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<(EntityId, PrimaryKey), Instance>>,
    queries: AtomicUsize,
    listener: OnceLock<Arc<dyn WriteListener>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report writes to `listener`. Only the first listener is kept.
    pub fn connect(&self, listener: Arc<dyn WriteListener>) {
        let _ = self.listener.set(listener);
    }

    /// Insert or update a row and return the persisted copy.
    pub fn save(&self, uow: &mut UnitOfWork, instance: &Instance) -> Instance {
        let mut saved = instance.detached();
        let db = saved.state().db.clone().unwrap_or_else(|| DEFAULT_DB.to_owned());
        saved.mark_persisted(db);

        self.rows().insert(
            (saved.entity().id().clone(), saved.pk().clone()),
            saved.clone(),
        );
        self.notify(uow, Signal::PostSave, &saved);
        saved
    }

    /// Delete a row. Returns false if it did not exist.
    pub fn delete(&self, uow: &mut UnitOfWork, instance: &Instance) -> bool {
        let removed = self
            .rows()
            .remove(&(instance.entity().id().clone(), instance.pk().clone()))
            .is_some();
        if removed {
            self.notify(uow, Signal::PostDelete, instance);
        }
        removed
    }

    /// Number of store reads so far
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn reset_queries(&self) {
        self.queries.store(0, Ordering::SeqCst);
    }

    fn notify(&self, uow: &mut UnitOfWork, signal: Signal, instance: &Instance) {
        if let Some(listener) = self.listener.get() {
            listener.post_write(uow, signal, instance);
        }
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<(EntityId, PrimaryKey), Instance>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, entity: &EntityType, pk: &PrimaryKey, using: Option<&str>) -> Option<Instance> {
        self.rows()
            .get(&(entity.id().clone(), pk.clone()))
            .map(|row| {
                let mut found = row.detached();
                found.mark_persisted(using.unwrap_or(DEFAULT_DB));
                found
            })
    }
}

fn not_found(entity: &EntityType, pk: &PrimaryKey) -> StoreError {
    StoreError::NotFound {
        entity: entity.id().clone(),
        pk: pk.clone(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(
        &self,
        entity: &Arc<EntityType>,
        pk: &PrimaryKey,
        using: Option<&str>,
    ) -> Result<Instance, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.find(entity, pk, using)
            .ok_or_else(|| not_found(entity, pk))
    }

    async fn get_or_create(
        &self,
        entity: &Arc<EntityType>,
        pk: &PrimaryKey,
        defaults: &FieldValues,
        using: Option<&str>,
    ) -> Result<Instance, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(found) = self.find(entity, pk, using) {
            return Ok(found);
        }

        let mut created = Instance::new(Arc::clone(entity), pk.clone());
        for (field, value) in defaults {
            created
                .set(field, value.clone())
                .map_err(|e| StoreError::Backend(Box::new(e)))?;
        }
        created.mark_persisted(using.unwrap_or(DEFAULT_DB));
        self.rows()
            .insert((entity.id().clone(), pk.clone()), created.clone());
        Ok(created)
    }

    async fn get_with_related(
        &self,
        entity: &Arc<EntityType>,
        pk: &PrimaryKey,
        relations: &[Arc<Relation>],
        using: Option<&str>,
    ) -> Result<Instance, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let mut parent = self
            .find(entity, pk, using)
            .ok_or_else(|| not_found(entity, pk))?;
        for relation in relations {
            let related = self.find(relation.related(), pk, using);
            parent.set_related(relation.name(), related);
        }
        Ok(parent)
    }
}

/// [`MemoryBackend`] wrapper counting calls, with injectable read failures
pub struct InstrumentedBackend {
    inner: MemoryBackend,
    reads: AtomicUsize,
    writes: AtomicUsize,
    deletes: AtomicUsize,
    fail_reads: AtomicBool,
}

impl InstrumentedBackend {
    pub fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Make every following `get` and `get_many` fail until turned off.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<(), CacheError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("injected read failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for InstrumentedBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.read()?;
        self.inner.get(key).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        self.read()?;
        self.inner.get_many(keys).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, ttl).await
    }

    async fn set_many(
        &self,
        entries: HashMap<String, Vec<u8>>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set_many(entries, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), CacheError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_many(keys).await
    }
}

/// A store double and an instrumented in-memory backend, with typed handles
/// next to the trait objects the registry takes.
pub struct Fixture {
    pub memory: MemoryBackend,
    pub instrumented: Arc<InstrumentedBackend>,
    pub backend: Arc<dyn CacheBackend>,
    pub db: Arc<MemoryStore>,
    pub store: Arc<dyn Store>,
}

impl Fixture {
    pub fn plain() -> Self {
        let memory = MemoryBackend::new(1_000);
        let instrumented = Arc::new(InstrumentedBackend::new(memory.clone()));
        let db = Arc::new(MemoryStore::new());
        Self {
            backend: Arc::clone(&instrumented) as Arc<dyn CacheBackend>,
            store: Arc::clone(&db) as Arc<dyn Store>,
            memory,
            instrumented,
            db,
        }
    }
}

fn build(builder: crate::entity::EntityTypeBuilder) -> Arc<EntityType> {
    match builder.build() {
        Ok(entity) => entity,
        Err(e) => panic!("invalid test schema: {e}"),
    }
}

/// `tests.foo`: integer key `id` and a text field `bar`
pub fn foo() -> Arc<EntityType> {
    build(
        EntityType::builder("tests", "foo")
            .primary_key("id")
            .field(Field::stored("bar").with_default("")),
    )
}

/// `tests.bazz`: keyed by its one-to-one link to `foo`, reachable as `bazz`
pub fn bazz(foo: &Arc<EntityType>) -> Arc<EntityType> {
    build(
        EntityType::builder("tests", "bazz")
            .primary_key("foo")
            .field(Field::stored("value").with_default(0))
            .one_to_one("foo", foo.id(), "bazz"),
    )
}

/// `tests.another`: one-to-one to `foo` through a non-key field
pub fn another(foo: &Arc<EntityType>) -> Arc<EntityType> {
    build(
        EntityType::builder("tests", "another")
            .primary_key("id")
            .field(Field::stored("foo"))
            .one_to_one("foo", foo.id(), "another"),
    )
}

/// `tests.to_load`: parent type of an always-fetched relation
pub fn to_load() -> Arc<EntityType> {
    build(
        EntityType::builder("tests", "to_load")
            .primary_key("id")
            .field(Field::stored("name").with_default("")),
    )
}

/// `tests.always_related`: keyed by its link to `to_load`, reachable as
/// `always_related`
pub fn always_related(to_load: &Arc<EntityType>) -> Arc<EntityType> {
    build(
        EntityType::builder("tests", "always_related")
            .primary_key("to_load")
            .field(Field::stored("value").with_default(0))
            .one_to_one("to_load", to_load.id(), "always_related"),
    )
}
