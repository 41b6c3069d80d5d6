//! Invalidation hooks
//!
//! Stores report every save and delete to a [`WriteListener`]. The
//! [`Invalidator`] answers by scheduling eviction of the affected cache keys
//! on the writer's unit of work, so the eviction happens only after commit.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use tracing::debug;

use crate::CacheError;
use crate::backend::CacheBackend;
use crate::entity::{EntityId, EntityType, Instance};
use crate::key::KeyDeriver;
use crate::unit_of_work::UnitOfWork;

/// Write notifications emitted by a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    PostSave,
    PostDelete,
}

/// Receiver of store write notifications
pub trait WriteListener: Send + Sync + 'static {
    /// Called by the store after `instance` was saved or deleted inside `uow`.
    fn post_write(&self, uow: &mut UnitOfWork, signal: Signal, instance: &Instance);
}

/// Evict `keys` now, or after `uow` commits when one is given.
pub(crate) async fn evict(
    backend: &Arc<dyn CacheBackend>,
    uow: Option<&mut UnitOfWork>,
    keys: Vec<String>,
) -> Result<(), CacheError> {
    if keys.is_empty() {
        return Ok(());
    }
    match uow {
        Some(uow) => {
            schedule_eviction(backend, uow, keys);
            Ok(())
        }
        None => {
            backend.delete_many(&keys).await?;
            debug!("Evicted cache keys: {:?}", keys);
            Ok(())
        }
    }
}

fn schedule_eviction(backend: &Arc<dyn CacheBackend>, uow: &mut UnitOfWork, keys: Vec<String>) {
    debug!("Scheduling eviction of {} keys on commit", keys.len());
    let backend = Arc::clone(backend);
    uow.on_commit(move || {
        async move {
            backend.delete_many(&keys).await?;
            debug!("Evicted cache keys: {:?}", keys);
            Ok(())
        }
        .boxed()
    });
}

/// Subscription table mapping a written type to the cached types it evicts
pub struct Invalidator {
    backend: Arc<dyn CacheBackend>,
    keys: KeyDeriver,
    receivers: HashMap<(EntityId, Signal), Vec<Arc<EntityType>>>,
}

impl Invalidator {
    pub(crate) fn new(backend: Arc<dyn CacheBackend>, keys: KeyDeriver) -> Self {
        Self {
            backend,
            keys,
            receivers: HashMap::new(),
        }
    }

    /// Evict `evict`'s entry whenever `sender` emits `signal`.
    ///
    /// Returns false, changing nothing, if this subscription already exists.
    pub(crate) fn connect(
        &mut self,
        sender: &EntityId,
        signal: Signal,
        evict: &Arc<EntityType>,
    ) -> bool {
        let receivers = self.receivers.entry((sender.clone(), signal)).or_default();
        if receivers.iter().any(|e| e.id() == evict.id()) {
            return false;
        }
        debug!("Connected {:?} of {} to eviction of {}", signal, sender, evict.id());
        receivers.push(Arc::clone(evict));
        true
    }

    pub fn is_connected(&self, sender: &EntityId, signal: Signal, evict: &EntityId) -> bool {
        self.receivers
            .get(&(sender.clone(), signal))
            .is_some_and(|r| r.iter().any(|e| e.id() == evict))
    }
}

impl WriteListener for Invalidator {
    fn post_write(&self, uow: &mut UnitOfWork, signal: Signal, instance: &Instance) {
        let sender = instance.entity().id();
        let Some(receivers) = self.receivers.get(&(sender.clone(), signal)) else {
            return;
        };

        let keys: Vec<String> = receivers
            .iter()
            .map(|entity| self.keys.key(entity, instance))
            .collect();
        debug!("{:?} for {} {}", signal, sender, instance.pk());
        schedule_eviction(&self.backend, uow, keys);
    }
}
