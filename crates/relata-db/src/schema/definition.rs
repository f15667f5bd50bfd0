//! Declarative model definitions.
//!
//! A [`ModelDefinition`] is what application code writes: fields, relation
//! declarations, constraints and metadata. Definitions are plain data; the
//! [`ModelRegistryBuilder`](super::ModelRegistryBuilder) validates them and
//! produces immutable [`ModelSchema`](super::ModelSchema)s.

use crate::fields::FieldDef;
use crate::value::Value;

/// A table-level constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// A composite primary key over two or more fields.
    PrimaryKey(Vec<String>),
    /// A UNIQUE constraint over several fields.
    UniqueTogether(Vec<String>),
    /// A (non-unique) index over several fields.
    Index(Vec<String>),
}

impl Constraint {
    /// Returns the field names the constraint covers.
    pub fn fields(&self) -> &[String] {
        match self {
            Self::PrimaryKey(f) | Self::UniqueTogether(f) | Self::Index(f) => f,
        }
    }
}

/// A to-one relation declaration.
///
/// ```
/// use relata_db::schema::ForeignKey;
///
/// let fk = ForeignKey::new("author", "Author").related_name("books").nullable();
/// assert_eq!(fk.to, "Author");
/// ```
#[derive(Debug, Clone)]
pub struct ForeignKey {
    /// The relation name on the owning model.
    pub name: String,
    /// The target model name.
    pub to: String,
    /// The name of the reverse collection on the target.
    pub related_name: Option<String>,
    /// Column name override for single-column keys.
    pub column: Option<String>,
    /// Explicit `(local field, target primary-key field)` mapping.
    pub names: Vec<(String, String)>,
    /// Whether the relation may be empty.
    pub nullable: bool,
    /// A declared default; relations never accept one.
    pub default: Option<Value>,
}

impl ForeignKey {
    /// Declares a relation named `name` pointing at model `to`.
    pub fn new(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            to: to.into(),
            related_name: None,
            column: None,
            names: Vec::new(),
            nullable: false,
            default: None,
        }
    }

    /// Sets the reverse accessor name.
    #[must_use]
    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        self.related_name = Some(name.into());
        self
    }

    /// Sets the stored column name of a single-column key.
    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Maps local column names onto the target's primary-key fields.
    #[must_use]
    pub fn names<L: Into<String>, R: Into<String>>(mut self, names: impl IntoIterator<Item = (L, R)>) -> Self {
        self.names = names.into_iter().map(|(l, r)| (l.into(), r.into())).collect();
        self
    }

    /// Allows the relation to be empty.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Declares a default. Building the registry rejects it.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// A many-to-many relation declaration.
#[derive(Debug, Clone)]
pub struct ManyToMany {
    /// The relation name on the owning model.
    pub name: String,
    /// The target model name.
    pub to: String,
    /// An explicit through model; synthesized when omitted.
    pub through: Option<String>,
    /// The name of the reverse collection on the target.
    pub related_name: Option<String>,
}

impl ManyToMany {
    /// Declares a many-to-many relation named `name` pointing at model `to`.
    pub fn new(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            to: to.into(),
            through: None,
            related_name: None,
        }
    }

    /// Uses `model` as the association table.
    #[must_use]
    pub fn through(mut self, model: impl Into<String>) -> Self {
        self.through = Some(model.into());
        self
    }

    /// Sets the reverse accessor name.
    #[must_use]
    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        self.related_name = Some(name.into());
        self
    }
}

/// A model declaration.
///
/// ```
/// use relata_db::fields::FieldDef;
/// use relata_db::schema::{ForeignKey, ModelDefinition};
///
/// let book = ModelDefinition::new("Book")
///     .table("books")
///     .field(FieldDef::integer("id").primary_key().autoincrement())
///     .field(FieldDef::string("title", 100))
///     .foreign_key(ForeignKey::new("author", "Author").nullable())
///     .ordering(["-year"]);
/// assert_eq!(book.name(), "Book");
/// ```
#[derive(Debug, Clone)]
pub struct ModelDefinition {
    pub(crate) name: String,
    pub(crate) table: Option<String>,
    pub(crate) database: Option<String>,
    pub(crate) is_abstract: bool,
    pub(crate) bases: Vec<String>,
    pub(crate) fields: Vec<FieldDef>,
    pub(crate) foreign_keys: Vec<ForeignKey>,
    pub(crate) many_to_many: Vec<ManyToMany>,
    pub(crate) constraints: Vec<Constraint>,
    pub(crate) ordering: Vec<String>,
}

impl ModelDefinition {
    /// Starts a definition for the model `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            database: None,
            is_abstract: false,
            bases: Vec::new(),
            fields: Vec::new(),
            foreign_keys: Vec::new(),
            many_to_many: Vec::new(),
            constraints: Vec::new(),
            ordering: Vec::new(),
        }
    }

    /// Returns the model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the table name. Defaults to the lowercased model name plus `s`.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Sets the database alias. Defaults to `Settings::default_database`.
    #[must_use]
    pub fn database(mut self, alias: impl Into<String>) -> Self {
        self.database = Some(alias.into());
        self
    }

    /// Marks the model abstract: it only contributes to models extending it.
    #[must_use]
    pub const fn abstract_model(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Inherits from abstract models, in order; later bases win.
    #[must_use]
    pub fn extends<S: Into<String>>(mut self, bases: impl IntoIterator<Item = S>) -> Self {
        self.bases.extend(bases.into_iter().map(Into::into));
        self
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds a to-one relation.
    #[must_use]
    pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Adds a many-to-many relation.
    #[must_use]
    pub fn many_to_many(mut self, m2m: ManyToMany) -> Self {
        self.many_to_many.push(m2m);
        self
    }

    /// Adds a table constraint.
    #[must_use]
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Declares a composite primary key.
    #[must_use]
    pub fn primary_key<S: Into<String>>(self, fields: impl IntoIterator<Item = S>) -> Self {
        let fields = fields.into_iter().map(Into::into).collect();
        self.constraint(Constraint::PrimaryKey(fields))
    }

    /// Declares a UNIQUE constraint over several fields.
    #[must_use]
    pub fn unique_together<S: Into<String>>(self, fields: impl IntoIterator<Item = S>) -> Self {
        let fields = fields.into_iter().map(Into::into).collect();
        self.constraint(Constraint::UniqueTogether(fields))
    }

    /// Sets the default ordering (`-` prefix for descending).
    #[must_use]
    pub fn ordering<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.ordering = fields.into_iter().map(Into::into).collect();
        self
    }
}
