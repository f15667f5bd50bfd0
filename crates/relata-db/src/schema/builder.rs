//! The schema graph builder.
//!
//! [`ModelRegistryBuilder`] collects [`ModelDefinition`]s and turns them into
//! a [`ModelRegistry`] of immutable [`ModelSchema`]s. Building runs these
//! passes, failing with [`RelataError::Definition`] on the first violation:
//!
//! 1. merge abstract bases into each model (most-derived definition wins);
//! 2. resolve exactly one primary key per concrete model;
//! 3. synthesize or validate many-to-many association models;
//! 4. materialize foreign-key columns, mirroring the target key types;
//! 5. validate constraints and database aliases;
//! 6. wire forward, reverse and many-to-many relations on both sides.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use relata_core::{RelataError, RelataResult, Settings};
use relata_signals::SignalTable;

use super::definition::{Constraint, ForeignKey, ManyToMany, ModelDefinition};
use super::model::{ColumnPair, ModelSchema, RelationDef, RelationKind, ThroughDef};
use super::registry::ModelRegistry;
use crate::fields::FieldDef;

fn definition_error(msg: impl Into<String>) -> RelataError {
    RelataError::Definition(msg.into())
}

/// Returns the default table name for a model.
pub(crate) fn default_table_name(model: &str) -> String {
    format!("{}s", model.to_lowercase())
}

/// Collects model definitions and builds a [`ModelRegistry`].
///
/// ```
/// use relata_core::Settings;
/// use relata_db::fields::FieldDef;
/// use relata_db::schema::{ForeignKey, ModelDefinition, ModelRegistryBuilder};
///
/// let registry = ModelRegistryBuilder::new(&Settings::default())
///     .register(
///         ModelDefinition::new("Author")
///             .field(FieldDef::integer("id").primary_key().autoincrement())
///             .field(FieldDef::string("name", 100)),
///     )
///     .register(
///         ModelDefinition::new("Book")
///             .field(FieldDef::integer("id").primary_key().autoincrement())
///             .foreign_key(ForeignKey::new("author", "Author").related_name("books")),
///     )
///     .build()
///     .unwrap();
///
/// let author = registry.get("Author").unwrap();
/// assert!(author.relation("books").is_some());
/// ```
#[derive(Debug)]
pub struct ModelRegistryBuilder {
    settings: Settings,
    definitions: Vec<ModelDefinition>,
}

/// A model after inheritance merging.
#[derive(Debug, Clone)]
struct Merged {
    name: String,
    table: String,
    database: Option<String>,
    is_abstract: bool,
    is_through: bool,
    fields: Vec<FieldDef>,
    foreign_keys: Vec<ForeignKey>,
    many_to_many: Vec<ManyToMany>,
    constraints: Vec<Constraint>,
    ordering: Vec<String>,
}

impl Merged {
    fn empty(def: &ModelDefinition) -> Self {
        Self {
            name: def.name.clone(),
            table: def.table.clone().unwrap_or_else(|| default_table_name(&def.name)),
            database: None,
            is_abstract: def.is_abstract,
            is_through: false,
            fields: Vec::new(),
            foreign_keys: Vec::new(),
            many_to_many: Vec::new(),
            constraints: Vec::new(),
            ordering: Vec::new(),
        }
    }

    fn member_names(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.foreign_keys.iter().map(|f| f.name.as_str()))
            .chain(self.many_to_many.iter().map(|m| m.name.as_str()))
    }

    fn check_free(&self, name: &str, kind: &str) -> RelataResult<()> {
        if self.fields.iter().any(|f| f.name == name && kind != "field")
            || self.foreign_keys.iter().any(|f| f.name == name && kind != "foreign key")
            || self.many_to_many.iter().any(|m| m.name == name && kind != "many-to-many")
        {
            return Err(definition_error(format!(
                "{}: '{name}' is redefined as a {kind}",
                self.name
            )));
        }
        Ok(())
    }

    fn overlay_field(&mut self, field: &FieldDef) -> RelataResult<()> {
        self.check_free(&field.name, "field")?;
        if let Some(existing) = self.fields.iter_mut().find(|f| f.name == field.name) {
            if !existing.field_type.is_compatible_with(&field.field_type) {
                return Err(definition_error(format!(
                    "{}: invalid redefinition of field '{}' from {} to {}",
                    self.name,
                    field.name,
                    existing.field_type.name(),
                    field.field_type.name()
                )));
            }
            *existing = field.clone();
        } else {
            self.fields.push(field.clone());
        }
        Ok(())
    }

    fn overlay(&mut self, other: &Self) -> RelataResult<()> {
        for field in &other.fields {
            self.overlay_field(field)?;
        }
        for fk in &other.foreign_keys {
            self.check_free(&fk.name, "foreign key")?;
            self.foreign_keys.retain(|f| f.name != fk.name);
            self.foreign_keys.push(fk.clone());
        }
        for m2m in &other.many_to_many {
            self.check_free(&m2m.name, "many-to-many")?;
            self.many_to_many.retain(|m| m.name != m2m.name);
            self.many_to_many.push(m2m.clone());
        }
        for constraint in &other.constraints {
            if !self.constraints.contains(constraint) {
                self.constraints.push(constraint.clone());
            }
        }
        if !other.ordering.is_empty() {
            self.ordering.clone_from(&other.ordering);
        }
        if other.database.is_some() {
            self.database.clone_from(&other.database);
        }
        Ok(())
    }
}

/// Per-model output of the column materialization pass.
struct Materialized {
    fields: Vec<FieldDef>,
    /// `(relation, column pairs)` for each foreign key, in declaration order.
    foreign_keys: Vec<(ForeignKey, Vec<ColumnPair>)>,
}

/// Where each many-to-many relation stores its rows.
struct Association {
    owner: String,
    relation: ManyToMany,
    through: String,
    owner_fk: String,
    target_fk: String,
}

impl ModelRegistryBuilder {
    /// Creates a builder using `settings` for database aliases and tuning.
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
            definitions: Vec::new(),
        }
    }

    /// Registers a model definition.
    #[must_use]
    pub fn register(mut self, definition: ModelDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Validates every definition and builds the registry.
    pub fn build(self) -> RelataResult<Arc<ModelRegistry>> {
        let mut by_name: HashMap<&str, &ModelDefinition> = HashMap::new();
        for def in &self.definitions {
            if def.name.trim().is_empty() {
                return Err(definition_error("model name cannot be empty"));
            }
            if by_name.insert(def.name.as_str(), def).is_some() {
                return Err(definition_error(format!("model '{}' is defined twice", def.name)));
            }
        }

        // Pass 1: inheritance.
        let mut merged: Vec<Merged> = Vec::with_capacity(self.definitions.len());
        for def in &self.definitions {
            merged.push(merge(def, &by_name, &mut Vec::new())?);
        }

        // Pass 2: primary keys.
        let mut pks: HashMap<String, Vec<String>> = HashMap::new();
        for model in merged.iter_mut().filter(|m| !m.is_abstract) {
            let pk = resolve_pk(model)?;
            pks.insert(model.name.clone(), pk);
        }

        // Pass 3: association models.
        let associations = resolve_associations(&mut merged, &mut pks)?;

        // Pass 4: foreign-key columns.
        let index: HashMap<String, Merged> =
            merged.iter().map(|m| (m.name.clone(), m.clone())).collect();
        let mut materialized: HashMap<String, Materialized> = HashMap::new();
        for model in merged.iter().filter(|m| !m.is_abstract) {
            materialized.insert(model.name.clone(), materialize(model, &index, &pks)?);
        }

        // Pass 5: constraints and metadata.
        let mut parts: Vec<SchemaParts> = Vec::with_capacity(merged.len());
        for model in &merged {
            let database = model
                .database
                .clone()
                .unwrap_or_else(|| self.settings.default_database.clone());
            if !model.is_abstract && self.settings.database(&database).is_none() {
                return Err(definition_error(format!(
                    "{} uses database alias '{database}', which is not configured",
                    model.name
                )));
            }

            let (fields, foreign_keys) = match materialized.remove(&model.name) {
                Some(m) => (m.fields, m.foreign_keys),
                None => (model.fields.clone(), Vec::new()),
            };
            let relations = foreign_keys
                .iter()
                .map(|(fk, columns)| RelationDef {
                    name: fk.name.clone(),
                    kind: RelationKind::ForeignKey,
                    target: fk.to.clone(),
                    related_name: (!model.is_through).then(|| reverse_name(&model.name, fk)),
                    columns: columns.clone(),
                    through: None,
                    nullable: fk.nullable,
                })
                .collect();

            let mut unique_together = Vec::new();
            let mut indexes = Vec::new();
            for constraint in model.constraints.iter().filter(|_| !model.is_abstract) {
                let columns = constraint_fields(model, constraint, &fields, &foreign_keys)?;
                match constraint {
                    Constraint::UniqueTogether(_) => unique_together.push(columns),
                    Constraint::Index(_) => indexes.push(columns),
                    Constraint::PrimaryKey(_) => {}
                }
            }

            parts.push(SchemaParts {
                name: model.name.clone(),
                table: model.table.clone(),
                database,
                pk: pks.get(&model.name).cloned().unwrap_or_default(),
                fields,
                relations,
                unique_together,
                indexes,
                ordering: model.ordering.clone(),
                is_abstract: model.is_abstract,
                is_through: model.is_through,
                reverse_sources: foreign_keys,
            });
        }

        // Pass 6: reverse and many-to-many relations.
        wire_reverse_relations(&mut parts)?;
        wire_associations(&mut parts, &associations)?;

        let settings = self.settings;
        let registry = Arc::new_cyclic(|weak| {
            let mut order = Vec::with_capacity(parts.len());
            let mut models = HashMap::with_capacity(parts.len());
            for part in parts {
                order.push(part.name.clone());
                let schema = Arc::new(ModelSchema {
                    name: part.name.clone(),
                    table: part.table,
                    database: part.database,
                    fields: part.fields,
                    pk: part.pk,
                    relations: part.relations,
                    unique_together: part.unique_together,
                    indexes: part.indexes,
                    ordering: part.ordering,
                    is_abstract: part.is_abstract,
                    is_through: part.is_through,
                    signals: SignalTable::new(),
                    registry: weak.clone(),
                });
                models.insert(part.name, schema);
            }
            ModelRegistry {
                models,
                order,
                settings,
                path_cache: RwLock::new(HashMap::new()),
            }
        });

        tracing::info!(models = registry.order.len(), "model registry built");
        Ok(registry)
    }
}

fn resolve_associations(
    merged: &mut Vec<Merged>,
    pks: &mut HashMap<String, Vec<String>>,
) -> RelataResult<Vec<Association>> {
    let tables: HashMap<String, String> =
        merged.iter().map(|m| (m.name.clone(), m.table.clone())).collect();
    let mut associations = Vec::new();
    let mut synthesized = Vec::new();

    for owner in merged.iter().filter(|m| !m.is_abstract) {
        for m2m in &owner.many_to_many {
            let target = merged
                .iter()
                .find(|m| m.name == m2m.to)
                .ok_or_else(|| {
                    definition_error(format!(
                        "{}.{} points at unknown model '{}'",
                        owner.name, m2m.name, m2m.to
                    ))
                })?;
            if target.is_abstract {
                return Err(definition_error(format!(
                    "{}.{} cannot point at abstract model '{}'",
                    owner.name, m2m.name, m2m.to
                )));
            }

            let association = match &m2m.through {
                Some(through) => explicit_association(owner, m2m, through, merged)?,
                None => {
                    let (model, association) = synthesize_through(owner, m2m, &tables);
                    if merged.iter().any(|m| m.name == model.name)
                        || synthesized.iter().any(|m: &Merged| m.name == model.name)
                    {
                        return Err(definition_error(format!(
                            "cannot synthesize association model '{}' for {}.{}: the name is taken",
                            model.name, owner.name, m2m.name
                        )));
                    }
                    synthesized.push(model);
                    association
                }
            };
            associations.push(association);
        }
    }

    for model in synthesized {
        pks.insert(model.name.clone(), vec!["id".to_string()]);
        merged.push(model);
    }
    for association in &associations {
        if let Some(model) = merged.iter_mut().find(|m| m.name == association.through) {
            model.is_through = true;
        }
    }
    Ok(associations)
}

fn merge(
    def: &ModelDefinition,
    all: &HashMap<&str, &ModelDefinition>,
    stack: &mut Vec<String>,
) -> RelataResult<Merged> {
    if stack.contains(&def.name) {
        return Err(definition_error(format!(
            "inheritance cycle through '{}'",
            def.name
        )));
    }
    stack.push(def.name.clone());

    let mut merged = Merged::empty(def);
    for base_name in &def.bases {
        let base = all.get(base_name.as_str()).ok_or_else(|| {
            definition_error(format!("{} extends unknown model '{base_name}'", def.name))
        })?;
        if !base.is_abstract {
            return Err(definition_error(format!(
                "{} cannot extend concrete model '{base_name}'; only abstract models can be inherited",
                def.name
            )));
        }
        let base = merge(base, all, stack)?;
        merged.overlay(&base)?;
    }

    let own = Merged {
        name: def.name.clone(),
        table: merged.table.clone(),
        database: def.database.clone(),
        is_abstract: def.is_abstract,
        is_through: false,
        fields: def.fields.clone(),
        foreign_keys: def.foreign_keys.clone(),
        many_to_many: def.many_to_many.clone(),
        constraints: def.constraints.clone(),
        ordering: def.ordering.clone(),
    };
    for name in own.member_names() {
        if own.member_names().filter(|n| *n == name).count() > 1 {
            return Err(definition_error(format!(
                "{}: '{name}' is declared more than once",
                def.name
            )));
        }
    }
    merged.overlay(&own)?;

    stack.pop();
    Ok(merged)
}

fn resolve_pk(model: &mut Merged) -> RelataResult<Vec<String>> {
    let field_pks: Vec<String> = model
        .fields
        .iter()
        .filter(|f| f.primary_key)
        .map(|f| f.name.clone())
        .collect();
    let constraint_pks: Vec<Vec<String>> = model
        .constraints
        .iter()
        .filter_map(|c| match c {
            Constraint::PrimaryKey(fields) => Some(fields.clone()),
            _ => None,
        })
        .collect();

    match (field_pks.len(), constraint_pks.len()) {
        (1, 0) => Ok(field_pks),
        (0, 1) => {
            let names = &constraint_pks[0];
            if names.len() < 2 {
                return Err(definition_error(format!(
                    "{}: a composite primary key needs at least two fields",
                    model.name
                )));
            }
            for name in names {
                let field = model
                    .fields
                    .iter_mut()
                    .find(|f| f.name == *name)
                    .ok_or_else(|| {
                        definition_error(format!(
                            "{}: primary key names unknown field '{name}'",
                            model.name
                        ))
                    })?;
                field.primary_key = true;
            }
            Ok(names.clone())
        }
        (0, 0) => Err(definition_error(format!(
            "{} has no primary key",
            model.name
        ))),
        _ => Err(definition_error(format!(
            "{} declares more than one primary key",
            model.name
        ))),
    }
}

fn synthesize_through(
    owner: &Merged,
    m2m: &ManyToMany,
    tables: &HashMap<String, String>,
) -> (Merged, Association) {
    let name = format!("{}{}", owner.name, m2m.to);
    let owner_table = &owner.table;
    let target_table = tables
        .get(&m2m.to)
        .cloned()
        .unwrap_or_else(|| default_table_name(&m2m.to));

    let (owner_fk, target_fk) = if owner.name == m2m.to {
        let base = owner.name.to_lowercase();
        (format!("from_{base}"), format!("to_{base}"))
    } else {
        (owner.name.to_lowercase(), m2m.to.to_lowercase())
    };

    let model = Merged {
        name: name.clone(),
        table: format!("{owner_table}_{target_table}"),
        database: owner.database.clone(),
        is_abstract: false,
        is_through: true,
        fields: vec![FieldDef::integer("id").primary_key().autoincrement()],
        foreign_keys: vec![
            ForeignKey::new(owner_fk.clone(), owner.name.clone()),
            ForeignKey::new(target_fk.clone(), m2m.to.clone()),
        ],
        many_to_many: Vec::new(),
        constraints: Vec::new(),
        ordering: Vec::new(),
    };
    let association = Association {
        owner: owner.name.clone(),
        relation: m2m.clone(),
        through: name,
        owner_fk,
        target_fk,
    };
    (model, association)
}

fn explicit_association(
    owner: &Merged,
    m2m: &ManyToMany,
    through: &str,
    merged: &[Merged],
) -> RelataResult<Association> {
    let model = merged
        .iter()
        .find(|m| m.name == through && !m.is_abstract)
        .ok_or_else(|| {
            definition_error(format!(
                "{}.{} uses unknown through model '{through}'",
                owner.name, m2m.name
            ))
        })?;

    let missing = || {
        definition_error(format!(
            "through model '{through}' must have foreign keys to both {} and {}",
            owner.name, m2m.to
        ))
    };
    let to_owner: Vec<&ForeignKey> = model
        .foreign_keys
        .iter()
        .filter(|fk| fk.to == owner.name)
        .collect();
    let (owner_fk, target_fk) = if owner.name == m2m.to {
        match to_owner.as_slice() {
            [first, second, ..] => (first.name.clone(), second.name.clone()),
            _ => return Err(missing()),
        }
    } else {
        let owner_fk = to_owner.first().ok_or_else(missing)?;
        let target_fk = model
            .foreign_keys
            .iter()
            .find(|fk| fk.to == m2m.to)
            .ok_or_else(missing)?;
        (owner_fk.name.clone(), target_fk.name.clone())
    };

    Ok(Association {
        owner: owner.name.clone(),
        relation: m2m.clone(),
        through: through.to_string(),
        owner_fk,
        target_fk,
    })
}

fn materialize(
    model: &Merged,
    index: &HashMap<String, Merged>,
    pks: &HashMap<String, Vec<String>>,
) -> RelataResult<Materialized> {
    let mut fields = model.fields.clone();
    let mut foreign_keys = Vec::with_capacity(model.foreign_keys.len());

    for fk in &model.foreign_keys {
        if fk.default.is_some() {
            return Err(definition_error(format!(
                "{}.{}: relations cannot declare a default value",
                model.name, fk.name
            )));
        }
        let target = index.get(&fk.to).ok_or_else(|| {
            definition_error(format!(
                "{}.{} points at unknown model '{}'",
                model.name, fk.name, fk.to
            ))
        })?;
        if target.is_abstract {
            return Err(definition_error(format!(
                "{}.{} cannot point at abstract model '{}'",
                model.name, fk.name, fk.to
            )));
        }
        let target_pk = pks.get(&fk.to).cloned().unwrap_or_default();
        let target_field = |name: &str| {
            target.fields.iter().find(|f| f.name == name).ok_or_else(|| {
                definition_error(format!("{} has no primary-key field '{name}'", target.name))
            })
        };

        let mut pairs = Vec::with_capacity(target_pk.len());
        if !fk.names.is_empty() {
            let covered: HashSet<&str> = fk.names.iter().map(|(_, r)| r.as_str()).collect();
            let exact = fk.names.len() == target_pk.len()
                && covered.len() == target_pk.len()
                && target_pk.iter().all(|pk| covered.contains(pk.as_str()));
            if !exact {
                return Err(definition_error(format!(
                    "{}.{}: names must map each primary-key field of {} exactly once",
                    model.name, fk.name, fk.to
                )));
            }
            for pk in &target_pk {
                let (local, _) = fk
                    .names
                    .iter()
                    .find(|(_, r)| r == pk)
                    .ok_or_else(|| definition_error(format!("{}.{}: unmapped key '{pk}'", model.name, fk.name)))?;
                let source = target_field(pk)?;
                attach_fk_column(&mut fields, model, fk, local, local, source, false)?;
                pairs.push(ColumnPair {
                    local: local.clone(),
                    remote: pk.clone(),
                });
            }
        } else if let [pk] = target_pk.as_slice() {
            let column = fk.column.clone().unwrap_or_else(|| fk.name.clone());
            let source = target_field(pk)?;
            attach_fk_column(&mut fields, model, fk, &fk.name, &column, source, false)?;
            pairs.push(ColumnPair {
                local: fk.name.clone(),
                remote: pk.clone(),
            });
        } else {
            if fk.column.is_some() {
                return Err(definition_error(format!(
                    "{}.{}: {} has a composite key; map its columns with names()",
                    model.name, fk.name, fk.to
                )));
            }
            for pk in &target_pk {
                let local = format!("{}_{pk}", fk.name);
                let source = target_field(pk)?;
                attach_fk_column(&mut fields, model, fk, &local, &local, source, true)?;
                pairs.push(ColumnPair {
                    local,
                    remote: pk.clone(),
                });
            }
        }
        foreign_keys.push((fk.clone(), pairs));
    }

    Ok(Materialized {
        fields,
        foreign_keys,
    })
}

fn attach_fk_column(
    fields: &mut Vec<FieldDef>,
    model: &Merged,
    fk: &ForeignKey,
    name: &str,
    column: &str,
    source: &FieldDef,
    shadow: bool,
) -> RelataResult<()> {
    if let Some(existing) = fields.iter_mut().find(|f| f.name == name) {
        // An explicitly mapped column may reuse a declared field of the same type.
        if shadow || fk.names.is_empty() || !existing.field_type.is_compatible_with(&source.field_type) {
            return Err(definition_error(format!(
                "{}.{}: column '{name}' clashes with an existing field",
                model.name, fk.name
            )));
        }
        existing.relation = Some(fk.name.clone());
        return Ok(());
    }

    let mut field = FieldDef::new(name, source.field_type.clone()).column(column);
    field.nullable = fk.nullable;
    field.relation = Some(fk.name.clone());
    field.shadow = shadow;
    field.transform.clone_from(&source.transform);
    fields.push(field);
    Ok(())
}

fn constraint_fields(
    model: &Merged,
    constraint: &Constraint,
    fields: &[FieldDef],
    foreign_keys: &[(ForeignKey, Vec<ColumnPair>)],
) -> RelataResult<Vec<String>> {
    let mut columns = Vec::new();
    for name in constraint.fields() {
        if fields.iter().any(|f| f.name == *name) {
            columns.push(name.clone());
        } else if let Some((_, pairs)) = foreign_keys.iter().find(|(fk, _)| fk.name == *name) {
            columns.extend(pairs.iter().map(|p| p.local.clone()));
        } else {
            return Err(definition_error(format!(
                "{}: constraint names unknown field '{name}'",
                model.name
            )));
        }
    }
    Ok(columns)
}

fn reverse_name(owner: &str, fk: &ForeignKey) -> String {
    fk.related_name
        .clone()
        .unwrap_or_else(|| format!("{}s", owner.to_lowercase()))
}

struct SchemaParts {
    name: String,
    table: String,
    database: String,
    pk: Vec<String>,
    fields: Vec<FieldDef>,
    relations: Vec<RelationDef>,
    unique_together: Vec<Vec<String>>,
    indexes: Vec<Vec<String>>,
    ordering: Vec<String>,
    is_abstract: bool,
    is_through: bool,
    reverse_sources: Vec<(ForeignKey, Vec<ColumnPair>)>,
}

fn add_relation(parts: &mut [SchemaParts], model: &str, relation: RelationDef) -> RelataResult<()> {
    let part = parts
        .iter_mut()
        .find(|p| p.name == model)
        .ok_or_else(|| definition_error(format!("unknown model '{model}'")))?;
    if part.fields.iter().any(|f| f.name == relation.name)
        || part.relations.iter().any(|r| r.name == relation.name)
    {
        return Err(definition_error(format!(
            "{}: reverse accessor '{}' for {} clashes with an existing member; set related_name",
            model, relation.name, relation.target
        )));
    }
    part.relations.push(relation);
    Ok(())
}

fn wire_reverse_relations(parts: &mut [SchemaParts]) -> RelataResult<()> {
    let mut pending = Vec::new();
    for part in parts.iter().filter(|p| !p.is_through) {
        for (fk, pairs) in &part.reverse_sources {
            pending.push((
                fk.to.clone(),
                RelationDef {
                    name: reverse_name(&part.name, fk),
                    kind: RelationKind::Reverse,
                    target: part.name.clone(),
                    related_name: Some(fk.name.clone()),
                    columns: pairs
                        .iter()
                        .map(|p| ColumnPair {
                            local: p.remote.clone(),
                            remote: p.local.clone(),
                        })
                        .collect(),
                    through: None,
                    nullable: fk.nullable,
                },
            ));
        }
    }
    for (model, relation) in pending {
        add_relation(parts, &model, relation)?;
    }
    Ok(())
}

fn wire_associations(parts: &mut [SchemaParts], associations: &[Association]) -> RelataResult<()> {
    for assoc in associations {
        let through = parts
            .iter()
            .find(|p| p.name == assoc.through)
            .ok_or_else(|| definition_error(format!("unknown through model '{}'", assoc.through)))?;
        let pairs_of = |fk_name: &str| {
            through
                .reverse_sources
                .iter()
                .find(|(fk, _)| fk.name == fk_name)
                .map(|(_, pairs)| pairs.clone())
                .ok_or_else(|| {
                    definition_error(format!("{} has no foreign key '{fk_name}'", assoc.through))
                })
        };
        // Pairs on the through model read `owner.remote = through.local`.
        let owner_pairs = pairs_of(&assoc.owner_fk)?;
        let target_pairs = pairs_of(&assoc.target_fk)?;
        let flip = |pairs: &[ColumnPair]| -> Vec<ColumnPair> {
            pairs
                .iter()
                .map(|p| ColumnPair {
                    local: p.remote.clone(),
                    remote: p.local.clone(),
                })
                .collect()
        };

        let m2m = &assoc.relation;
        let reverse = m2m
            .related_name
            .clone()
            .unwrap_or_else(|| format!("{}s", assoc.owner.to_lowercase()));

        let forward = RelationDef {
            name: m2m.name.clone(),
            kind: RelationKind::ManyToMany,
            target: m2m.to.clone(),
            related_name: Some(reverse.clone()),
            columns: Vec::new(),
            through: Some(ThroughDef {
                model: assoc.through.clone(),
                owner_columns: flip(&owner_pairs),
                target_columns: target_pairs.clone(),
                owner_relation: assoc.owner_fk.clone(),
                target_relation: assoc.target_fk.clone(),
            }),
            nullable: true,
        };
        let backward = RelationDef {
            name: reverse,
            kind: RelationKind::ManyToMany,
            target: assoc.owner.clone(),
            related_name: Some(m2m.name.clone()),
            columns: Vec::new(),
            through: Some(ThroughDef {
                model: assoc.through.clone(),
                owner_columns: flip(&target_pairs),
                target_columns: owner_pairs,
                owner_relation: assoc.target_fk.clone(),
                target_relation: assoc.owner_fk.clone(),
            }),
            nullable: true,
        };

        add_relation(parts, &assoc.owner, forward)?;
        add_relation(parts, &m2m.to, backward)?;
    }
    Ok(())
}
