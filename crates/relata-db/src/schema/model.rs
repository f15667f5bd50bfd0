//! Immutable model schemas and relation descriptors.

use std::fmt;
use std::sync::{Arc, Weak};

use relata_core::{RelataError, RelataResult};
use relata_signals::SignalTable;

use super::registry::ModelRegistry;
use crate::fields::FieldDef;
use crate::signals::SignalArgs;

/// The kind of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// To-one: the owner stores the key columns.
    ForeignKey,
    /// To-many: the target stores key columns pointing back at the owner.
    Reverse,
    /// To-many through an association model.
    ManyToMany,
}

impl RelationKind {
    /// Returns `true` for collection relations.
    pub const fn is_to_many(self) -> bool {
        matches!(self, Self::Reverse | Self::ManyToMany)
    }
}

/// A pair of field names joined by equality: `target.remote = owner.local`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPair {
    /// The field on the side the join starts from.
    pub local: String,
    /// The field on the joined side.
    pub remote: String,
}

/// How a many-to-many relation crosses its association model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughDef {
    /// The association model name.
    pub model: String,
    /// `through.remote = owner.local` pairs.
    pub owner_columns: Vec<ColumnPair>,
    /// `target.remote = through.local` pairs.
    pub target_columns: Vec<ColumnPair>,
    /// The foreign key on the association model that points at the owner.
    pub owner_relation: String,
    /// The foreign key on the association model that points at the target.
    pub target_relation: String,
}

/// A resolved relation on a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    /// The accessor name on the owning model.
    pub name: String,
    /// The relation kind.
    pub kind: RelationKind,
    /// The target model name.
    pub target: String,
    /// The name of the counterpart relation on the target, if any.
    pub related_name: Option<String>,
    /// Join columns for foreign-key and reverse relations.
    pub columns: Vec<ColumnPair>,
    /// The association for many-to-many relations.
    pub through: Option<ThroughDef>,
    /// Whether the key columns accept NULL.
    pub nullable: bool,
}

/// The normalized, immutable schema of one model.
///
/// Schemas are created by
/// [`ModelRegistryBuilder::build`](super::ModelRegistryBuilder::build) and
/// shared as `Arc<ModelSchema>`. Each schema owns the signal table for its
/// model.
pub struct ModelSchema {
    pub(crate) name: String,
    pub(crate) table: String,
    pub(crate) database: String,
    pub(crate) fields: Vec<FieldDef>,
    pub(crate) pk: Vec<String>,
    pub(crate) relations: Vec<RelationDef>,
    pub(crate) unique_together: Vec<Vec<String>>,
    pub(crate) indexes: Vec<Vec<String>>,
    pub(crate) ordering: Vec<String>,
    pub(crate) is_abstract: bool,
    pub(crate) is_through: bool,
    pub(crate) signals: SignalTable<SignalArgs>,
    pub(crate) registry: Weak<ModelRegistry>,
}

impl fmt::Debug for ModelSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSchema")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("pk", &self.pk)
            .field("fields", &self.fields.iter().map(|f| &f.name).collect::<Vec<_>>())
            .field("relations", &self.relations.iter().map(|r| &r.name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PartialEq for ModelSchema {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.registry.ptr_eq(&other.registry)
    }
}

impl ModelSchema {
    /// Returns the model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the database alias.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns every stored field, including foreign-key columns.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Returns the field named `name`.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Returns the primary-key field names, in declaration order.
    pub fn pk_fields(&self) -> &[String] {
        &self.pk
    }

    /// Returns `true` for composite primary keys.
    pub fn has_composite_pk(&self) -> bool {
        self.pk.len() > 1
    }

    /// Returns every relation, including reverse and association ones.
    pub fn relations(&self) -> &[RelationDef] {
        &self.relations
    }

    /// Returns the relation named `name`.
    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Returns the UNIQUE constraints over several fields.
    pub fn unique_together(&self) -> &[Vec<String>] {
        &self.unique_together
    }

    /// Returns the multi-field indexes.
    pub fn indexes(&self) -> &[Vec<String>] {
        &self.indexes
    }

    /// Returns the default ordering.
    pub fn ordering(&self) -> &[String] {
        &self.ordering
    }

    /// Returns `true` for abstract models.
    pub const fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Returns `true` for many-to-many association models.
    pub const fn is_through(&self) -> bool {
        self.is_through
    }

    /// Returns the model's signal table.
    pub const fn signals(&self) -> &SignalTable<SignalArgs> {
        &self.signals
    }

    /// Returns the registry this schema belongs to.
    pub fn registry(&self) -> RelataResult<Arc<ModelRegistry>> {
        self.registry.upgrade().ok_or_else(|| {
            RelataError::Definition(format!("the registry of {} has been dropped", self.name))
        })
    }

    /// Returns the stored column of a field.
    pub fn column(&self, field: &str) -> RelataResult<&str> {
        self.field(field)
            .map(|f| f.column.as_str())
            .ok_or_else(|| RelataError::Definition(format!("{} has no field '{field}'", self.name)))
    }

    /// Returns the stored columns of the primary key.
    pub fn pk_columns(&self) -> RelataResult<Vec<String>> {
        self.pk.iter().map(|f| self.column(f).map(str::to_string)).collect()
    }
}
