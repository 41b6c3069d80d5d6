//! Transactional boundary for deferred cache work
//!
//! A [`UnitOfWork`] collects callbacks that must only run once the store has
//! durably committed. Writers schedule cache evictions here instead of
//! evicting straight away; evicting before commit would let a concurrent
//! reader refill the cache with the pre-commit row.
//!
//! Each unit of work belongs to one request and is used through `&mut`, so it
//! needs no locking.

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::CacheError;

type CommitCallback = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), CacheError>> + Send>;

#[derive(Default)]
pub struct UnitOfWork {
    on_commit: Vec<CommitCallback>,
}

impl UnitOfWork {
    pub fn begin() -> Self {
        Self::default()
    }

    /// Queue `callback` to run after a successful commit, in scheduling order.
    pub fn on_commit<F>(&mut self, callback: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), CacheError>> + Send + 'static,
    {
        self.on_commit.push(Box::new(callback));
    }

    /// Number of callbacks waiting for commit
    pub fn pending(&self) -> usize {
        self.on_commit.len()
    }

    /// Run every queued callback. Call this once the store has committed.
    ///
    /// All callbacks run even if one fails; the first failure is returned.
    pub async fn commit(self) -> Result<(), CacheError> {
        debug!("Unit of work committed, running {} callbacks", self.on_commit.len());
        let mut first_err = None;
        for callback in self.on_commit {
            if let Err(e) = callback().await {
                warn!("Commit callback failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Discard every queued callback. Dropping the unit of work does the same.
    pub fn rollback(self) {
        debug!(
            "Unit of work rolled back, discarding {} callbacks",
            self.on_commit.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(
        counter: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<(), CacheError>> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_commit_runs_callbacks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut uow = UnitOfWork::begin();
        uow.on_commit(counting(&counter));
        uow.on_commit(counting(&counter));
        assert_eq!(uow.pending(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        uow.commit().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rollback_discards_callbacks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut uow = UnitOfWork::begin();
        uow.on_commit(counting(&counter));
        uow.rollback();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_callback_does_not_stop_others() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut uow = UnitOfWork::begin();
        uow.on_commit(|| async { Err(CacheError::Configuration("boom".to_owned())) }.boxed());
        uow.on_commit(counting(&counter));

        let err = uow.commit().await.unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
