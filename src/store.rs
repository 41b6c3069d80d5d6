//! Contract for the backing relational store
//!
//! The cache never writes to the store. It only reads single records by
//! primary key, optionally creating them, and loads a record together with
//! its one-to-one relations in one query.

use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::{EntityType, FieldValues, Instance, PrimaryKey};
use crate::error::StoreError;
use crate::relation_cache::Relation;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Load one record by primary key from the store alias `using`
    /// (`None` means the store's default).
    ///
    /// The returned instance is marked as persisted.
    async fn get(
        &self,
        entity: &Arc<EntityType>,
        pk: &PrimaryKey,
        using: Option<&str>,
    ) -> Result<Instance, StoreError>;

    /// Load one record, inserting it with `defaults` if it does not exist.
    async fn get_or_create(
        &self,
        entity: &Arc<EntityType>,
        pk: &PrimaryKey,
        defaults: &FieldValues,
        using: Option<&str>,
    ) -> Result<Instance, StoreError>;

    /// Load one record and each of `relations` in a single query.
    ///
    /// Every relation must come back materialized on the parent through
    /// [`Instance::set_related`], as `None` when the related row is absent.
    async fn get_with_related(
        &self,
        entity: &Arc<EntityType>,
        pk: &PrimaryKey,
        relations: &[Arc<Relation>],
        using: Option<&str>,
    ) -> Result<Instance, StoreError>;
}
