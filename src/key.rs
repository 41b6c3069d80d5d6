//! Cache key derivation
//!
//! Keys have the form `{prefix}:{version}:{namespace}.{name}:{pk}`. Namespace
//! and name are validated identifiers, so they never contain `.` or `:`, and
//! integer keys never start with the `s:` marker used for text keys. That
//! makes the mapping from (type, primary key) to key injective.

use crate::codec::FORMAT_VERSION;
use crate::entity::{AsPrimaryKey, EntityType, PrimaryKey};

#[derive(Debug, Clone)]
pub struct KeyDeriver {
    prefix: String,
}

impl KeyDeriver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, entity: &EntityType, pk: impl AsPrimaryKey) -> String {
        let id = entity.id();
        match pk.as_primary_key() {
            PrimaryKey::Int(n) => format!(
                "{}:{}:{}.{}:{}",
                self.prefix, FORMAT_VERSION, id.namespace, id.name, n
            ),
            PrimaryKey::Text(s) => format!(
                "{}:{}:{}.{}:s:{}",
                self.prefix, FORMAT_VERSION, id.namespace, id.name, s
            ),
        }
    }

    pub fn keys<P: AsPrimaryKey>(
        &self,
        entity: &EntityType,
        pks: impl IntoIterator<Item = P>,
    ) -> Vec<String> {
        pks.into_iter().map(|pk| self.key(entity, pk)).collect()
    }
}
