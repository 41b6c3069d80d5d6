//! Cache entry encoding
//!
//! An entry is a JSON object mapping every cached field (see
//! [`Field::is_cached`](crate::entity::Field::is_cached)) to its value. The
//! primary key is never written; it is part of the cache key instead.
//!
//! Bump [`FORMAT_VERSION`] whenever this layout changes incompatibly so old
//! entries are simply never read again.

use std::sync::Arc;

use serde_json::Value;

use crate::entity::{EntityType, FieldValues, Instance, PrimaryKey};
use crate::error::DecodeError;

pub const FORMAT_VERSION: &str = "v1";

pub fn encode(instance: &Instance) -> Result<Vec<u8>, serde_json::Error> {
    let data: FieldValues = instance
        .entity()
        .fields()
        .iter()
        .filter(|f| f.is_cached())
        .map(|f| {
            let value = instance.get(&f.name).cloned().unwrap_or(Value::Null);
            (f.name.clone(), value)
        })
        .collect();

    serde_json::to_vec(&data)
}

/// Rebuild an instance of `entity` from an entry.
///
/// The result is marked as persisted in `db`, exactly like a freshly
/// queried instance, so later saves update rather than insert.
pub fn decode(
    entity: &Arc<EntityType>,
    bytes: &[u8],
    pk: PrimaryKey,
    db: &str,
) -> Result<Instance, DecodeError> {
    let data: FieldValues = serde_json::from_slice(bytes)?;

    if let Some(missing) = entity
        .fields()
        .iter()
        .find(|f| f.is_cached() && !data.contains_key(&f.name))
    {
        return Err(DecodeError::MissingField(missing.name.clone()));
    }

    let mut instance = Instance::new(Arc::clone(entity), pk);
    for (name, value) in data {
        match entity.field(&name) {
            Some(field) if field.is_cached() => {}
            _ => return Err(DecodeError::UnexpectedField(name)),
        }
        instance
            .set(&name, value)
            .map_err(|_| DecodeError::UnexpectedField(name.clone()))?;
    }

    instance.mark_persisted(db);
    Ok(instance)
}
