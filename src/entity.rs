//! Entity metadata and in-memory instances
//!
//! An [`EntityType`] describes a record schema: a namespace/name pair, one
//! primary-key field, the other fields in declaration order, and the
//! one-to-one links the type holds. An [`Instance`] is one live record of a
//! type, carrying its values plus the local relation state used by the
//! relation gateway.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::CacheError;

/// Values of an instance keyed by field name
pub type FieldValues = BTreeMap<String, Value>;

/// Unique identity of an entity type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    pub namespace: String,
    pub name: String,
}

impl EntityId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Primary-key value of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimaryKey {
    Int(i64),
    Text(String),
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for PrimaryKey {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for PrimaryKey {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&PrimaryKey> for Value {
    fn from(pk: &PrimaryKey) -> Self {
        match pk {
            PrimaryKey::Int(n) => Value::from(*n),
            PrimaryKey::Text(s) => Value::from(s.as_str()),
        }
    }
}

/// Anything that identifies a record: a primary key or the instance itself
pub trait AsPrimaryKey {
    fn as_primary_key(&self) -> PrimaryKey;
}

impl AsPrimaryKey for PrimaryKey {
    fn as_primary_key(&self) -> PrimaryKey {
        self.clone()
    }
}

impl AsPrimaryKey for Instance {
    fn as_primary_key(&self) -> PrimaryKey {
        self.pk.clone()
    }
}

impl AsPrimaryKey for i64 {
    fn as_primary_key(&self) -> PrimaryKey {
        PrimaryKey::Int(*self)
    }
}

impl AsPrimaryKey for i32 {
    fn as_primary_key(&self) -> PrimaryKey {
        PrimaryKey::Int(i64::from(*self))
    }
}

impl AsPrimaryKey for u32 {
    fn as_primary_key(&self) -> PrimaryKey {
        PrimaryKey::Int(i64::from(*self))
    }
}

impl AsPrimaryKey for str {
    fn as_primary_key(&self) -> PrimaryKey {
        PrimaryKey::Text(self.to_owned())
    }
}

impl AsPrimaryKey for String {
    fn as_primary_key(&self) -> PrimaryKey {
        PrimaryKey::Text(self.clone())
    }
}

impl<T: AsPrimaryKey + ?Sized> AsPrimaryKey for &T {
    fn as_primary_key(&self) -> PrimaryKey {
        (**self).as_primary_key()
    }
}

/// How a field is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A concrete column, copied into cache entries
    Stored,
    /// A concrete column whose value is never cached (file handles and the like)
    File,
    /// Computed or reverse-side field with no column of its own
    Virtual,
}

/// One field of an entity type
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub primary_key: bool,
    /// Value given to new instances and to non-cached fields of cache-built ones
    pub default: Value,
}

impl Field {
    pub fn stored(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Stored,
            primary_key: false,
            default: Value::Null,
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self {
            kind: FieldKind::File,
            ..Self::stored(name)
        }
    }

    pub fn virtual_field(name: impl Into<String>) -> Self {
        Self {
            kind: FieldKind::Virtual,
            ..Self::stored(name)
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }

    pub fn is_concrete(&self) -> bool {
        self.kind != FieldKind::Virtual
    }

    /// Whether this field's value belongs in a cache entry
    pub fn is_cached(&self) -> bool {
        !self.primary_key && self.kind == FieldKind::Stored
    }
}

/// A one-to-one link held by an entity type
#[derive(Debug, Clone)]
pub struct OneToOne {
    /// Field on the declaring type that stores the target's primary key
    pub field: String,
    /// Type the link points at
    pub target: EntityId,
    /// Name of the reverse accessor on the target type
    pub related_name: String,
}

/// A record schema
#[derive(Debug)]
pub struct EntityType {
    id: EntityId,
    fields: Vec<Field>,
    links: Vec<OneToOne>,
}

impl EntityType {
    pub fn builder(namespace: impl Into<String>, name: impl Into<String>) -> EntityTypeBuilder {
        EntityTypeBuilder {
            id: EntityId::new(namespace, name),
            fields: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// All fields in declaration order, primary key included
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_key(&self) -> &Field {
        // The builder refuses types without exactly one primary key.
        self.fields
            .iter()
            .find(|f| f.primary_key)
            .unwrap_or(&self.fields[0])
    }

    pub fn links(&self) -> &[OneToOne] {
        &self.links
    }

    /// The link whose reverse accessor on `target` is called `related_name`
    pub fn link_to(&self, target: &EntityId, related_name: &str) -> Option<&OneToOne> {
        self.links
            .iter()
            .find(|l| &l.target == target && l.related_name == related_name)
    }
}

pub struct EntityTypeBuilder {
    id: EntityId,
    fields: Vec<Field>,
    links: Vec<OneToOne>,
}

impl EntityTypeBuilder {
    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        self.fields.push(Field {
            primary_key: true,
            ..Field::stored(name)
        });
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Declare a one-to-one link stored in `field`.
    ///
    /// The field itself must also be declared, either as the primary key or
    /// as a regular field.
    pub fn one_to_one(
        mut self,
        field: impl Into<String>,
        target: &EntityId,
        related_name: impl Into<String>,
    ) -> Self {
        self.links.push(OneToOne {
            field: field.into(),
            target: target.clone(),
            related_name: related_name.into(),
        });
        self
    }

    pub fn build(self) -> Result<Arc<EntityType>, CacheError> {
        for part in [&self.id.namespace, &self.id.name] {
            if !is_identifier(part) {
                return Err(CacheError::Configuration(format!(
                    "entity type {} must be named with ASCII identifiers, got {part:?}",
                    self.id
                )));
            }
        }

        let pk_count = self.fields.iter().filter(|f| f.primary_key).count();
        if pk_count != 1 {
            return Err(CacheError::Configuration(format!(
                "entity type {} must declare exactly one primary key, found {pk_count}",
                self.id
            )));
        }

        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(CacheError::Configuration(format!(
                    "entity type {} declares field {:?} twice",
                    self.id, field.name
                )));
            }
        }

        if let Some(link) = self
            .links
            .iter()
            .find(|l| !self.fields.iter().any(|f| f.name == l.field))
        {
            return Err(CacheError::UnknownField {
                entity: self.id.clone(),
                field: link.field.clone(),
            });
        }

        Ok(Arc::new(EntityType {
            id: self.id,
            fields: self.fields,
            links: self.links,
        }))
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Persistence state of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceState {
    /// True until the instance is known to exist in the store
    pub adding: bool,
    /// Store alias the instance belongs to
    pub db: Option<String>,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self {
            adding: true,
            db: None,
        }
    }
}

/// Locally memoized outcome of a cached relation lookup
#[derive(Debug, Clone, Default)]
pub enum RelationSlot {
    #[default]
    Unresolved,
    Present(Box<Instance>),
    Absent,
}

/// A live record of an [`EntityType`]
#[derive(Debug, Clone)]
pub struct Instance {
    entity: Arc<EntityType>,
    pk: PrimaryKey,
    values: FieldValues,
    state: InstanceState,
    /// Values set through the ordinary relation path (assignment, eager load)
    related: BTreeMap<String, Option<Box<Instance>>>,
    /// Values resolved through the relation cache
    cached_related: BTreeMap<String, RelationSlot>,
}

impl Instance {
    /// A new, not yet persisted instance with every field at its default
    pub fn new(entity: Arc<EntityType>, pk: impl Into<PrimaryKey>) -> Self {
        let pk = pk.into();
        let pk_name = entity.primary_key().name.clone();
        let values = entity
            .fields()
            .iter()
            .map(|f| {
                let value = if f.name == pk_name {
                    Value::from(&pk)
                } else {
                    f.default.clone()
                };
                (f.name.clone(), value)
            })
            .collect();

        Self {
            entity,
            pk,
            values,
            state: InstanceState::default(),
            related: BTreeMap::new(),
            cached_related: BTreeMap::new(),
        }
    }

    pub fn entity(&self) -> &Arc<EntityType> {
        &self.entity
    }

    pub fn pk(&self) -> &PrimaryKey {
        &self.pk
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn values(&self) -> &FieldValues {
        &self.values
    }

    /// Set a field value. The primary key cannot be changed this way.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), CacheError> {
        match self.entity.field(field) {
            Some(f) if !f.primary_key => {
                self.values.insert(field.to_owned(), value.into());
                Ok(())
            }
            _ => Err(CacheError::UnknownField {
                entity: self.entity.id().clone(),
                field: field.to_owned(),
            }),
        }
    }

    /// Builder-style [`set`](Self::set)
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Result<Self, CacheError> {
        self.set(field, value)?;
        Ok(self)
    }

    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    /// Record that this instance exists in the store under `db`.
    pub fn mark_persisted(&mut self, db: impl Into<String>) {
        self.state.adding = false;
        self.state.db = Some(db.into());
    }

    /// The value of the ordinary relation accessor, if it was materialized.
    ///
    /// `None` means never loaded; `Some(None)` means known to be absent.
    pub fn related(&self, name: &str) -> Option<Option<&Instance>> {
        self.related.get(name).map(|r| r.as_deref())
    }

    /// Assign (or clear, with `None`) the ordinary relation value.
    pub fn set_related(&mut self, name: impl Into<String>, related: Option<Instance>) {
        self.related.insert(name.into(), related.map(Box::new));
    }

    pub fn cached_related(&self, name: &str) -> &RelationSlot {
        static UNRESOLVED: RelationSlot = RelationSlot::Unresolved;
        self.cached_related.get(name).unwrap_or(&UNRESOLVED)
    }

    pub(crate) fn memoize_related(&mut self, name: &str, slot: RelationSlot) {
        self.cached_related.insert(name.to_owned(), slot);
    }

    /// Copy of this instance without any local relation state
    pub fn detached(&self) -> Self {
        Self {
            entity: Arc::clone(&self.entity),
            pk: self.pk.clone(),
            values: self.values.clone(),
            state: self.state.clone(),
            related: BTreeMap::new(),
            cached_related: BTreeMap::new(),
        }
    }
}

/// Instances compare by type, primary key and field values.
impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.entity.id() == other.entity.id() && self.pk == other.pk && self.values == other.values
    }
}
