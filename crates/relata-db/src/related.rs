//! Managers for to-many relations of one instance.
//!
//! `instance.relation("books")` returns a [`RelationManager`] that queries
//! and changes the collection. Reverse foreign keys are changed by updating
//! the children's key columns; many-to-many collections by inserting and
//! deleting association rows. Loaded collections on the owner are kept in
//! step with each change, and the owner itself is not marked dirty.

use std::collections::HashSet;
use std::sync::Arc;

use relata_core::logging::query_span;
use relata_core::{RelataError, RelataResult};
use relata_signals::SignalKind;
use tracing::Instrument;

use crate::executor::{run_execute, run_fetch_all, DbExecutor};
use crate::fields::FieldDef;
use crate::instance::{Instance, InstanceState};
use crate::query::compiler::{
    ColumnRef, CompareOp, DeleteQuery, InsertQuery, Query, SelectColumn, SetExpr, SqlCompiler,
    UpdateQuery, WhereNode,
};
use crate::query::loader::key_predicate;
use crate::query::{LookupKind, Q, QuerySet};
use crate::schema::{ModelRegistry, ModelSchema, RelationDef, RelationKind, ThroughDef};
use crate::signals::{emit, SignalArgs};
use crate::value::Value;

impl Instance {
    /// Returns the manager of a to-many relation.
    pub fn relation(&self, name: &str) -> RelataResult<RelationManager> {
        let relation = self.schema().relation(name).cloned().ok_or_else(|| {
            RelataError::Model(format!("{} has no relation '{name}'", self.model()))
        })?;
        if !relation.kind.is_to_many() {
            return Err(RelataError::RelationshipInstance(format!(
                "{}.{name} is a to-one relation; use set_related(\"{name}\")",
                self.model()
            )));
        }
        let registry = self.schema().registry()?;
        let target = registry.get(&relation.target)?;
        Ok(RelationManager {
            owner: self.clone(),
            relation,
            target,
            registry,
        })
    }
}

/// Queries and changes one instance's to-many relation.
#[derive(Debug, Clone)]
pub struct RelationManager {
    owner: Instance,
    relation: RelationDef,
    target: Arc<ModelSchema>,
    registry: Arc<ModelRegistry>,
}

impl RelationManager {
    /// Returns the relation name.
    pub fn name(&self) -> &str {
        &self.relation.name
    }

    /// Returns the model on the other side.
    pub const fn target(&self) -> &Arc<ModelSchema> {
        &self.target
    }

    fn ensure_owner_saved(&self) -> RelataResult<()> {
        let unsaved = matches!(self.owner.state(), InstanceState::Transient | InstanceState::Deleted);
        let key = self.owner.pk_values();
        if unsaved || key.iter().any(Value::is_null) {
            return Err(RelataError::RelationshipInstance(format!(
                "{} must be saved before its '{}' relation can be used",
                self.owner.model(),
                self.relation.name
            )));
        }
        Ok(())
    }

    fn through(&self) -> RelataResult<(&ThroughDef, Arc<ModelSchema>)> {
        let through = self.relation.through.as_ref().ok_or_else(|| {
            RelataError::Definition(format!(
                "{}.{} has no association model",
                self.owner.model(),
                self.relation.name
            ))
        })?;
        Ok((through, self.registry.get(&through.model)?))
    }

    fn reverse_name(&self) -> RelataResult<&str> {
        self.relation.related_name.as_deref().ok_or_else(|| {
            RelataError::Definition(format!(
                "{}.{} has no reverse name",
                self.owner.model(),
                self.relation.name
            ))
        })
    }

    /// Returns a queryset over the related rows.
    pub fn queryset(&self) -> RelataResult<QuerySet> {
        self.ensure_owner_saved()?;
        let all = self.registry.objects(self.target.name())?.all();
        let reverse = self.reverse_name()?;
        let q = match self.relation.kind {
            RelationKind::Reverse => Q::filter(reverse, LookupKind::Exact, &self.owner),
            _ => Q::and_(self.owner.schema().pk_fields().iter().map(|pk| {
                Q::filter(format!("{reverse}__{pk}"), LookupKind::Exact, self.owner.value_of(pk))
            })),
        };
        Ok(all.filter(q))
    }

    /// Loads the related rows and caches them on the owner.
    pub async fn all(&self, db: &dyn DbExecutor) -> RelataResult<Vec<Instance>> {
        let items = self.queryset()?.all(db).await?;
        self.owner.clear_many(&self.relation.name);
        self.owner.init_many(&self.relation.name);
        for item in &items {
            self.owner.push_many(&self.relation.name, item);
        }
        Ok(items)
    }

    fn check_children(&self, children: &[Instance]) -> RelataResult<Vec<Vec<Value>>> {
        let mut keys = Vec::with_capacity(children.len());
        for child in children {
            if child.model() != self.target.name() {
                return Err(RelataError::RelationshipInstance(format!(
                    "{}.{} holds {} instances, got {}",
                    self.owner.model(),
                    self.relation.name,
                    self.target.name(),
                    child.model()
                )));
            }
            let key = child.pk_values();
            if matches!(child.state(), InstanceState::Transient | InstanceState::Deleted)
                || key.iter().any(Value::is_null)
            {
                return Err(RelataError::ModelPersistence(format!(
                    "save the {} before adding it to {}.{}",
                    child.model(),
                    self.owner.model(),
                    self.relation.name
                )));
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn signal_args(&self, related: &[Instance]) -> SignalArgs {
        let mut args = SignalArgs::for_instance(&self.owner);
        args.related = related.to_vec();
        args.relation = Some(self.relation.name.clone());
        args
    }

    fn target_pk_refs(&self) -> RelataResult<Vec<ColumnRef>> {
        Ok(self
            .target
            .pk_columns()?
            .into_iter()
            .map(|c| ColumnRef::new(self.target.table(), c))
            .collect())
    }

    /// The owner's key as stored in the target's key columns.
    fn owner_columns(&self) -> RelataResult<Vec<(String, Value)>> {
        self.relation
            .columns
            .iter()
            .map(|pair| {
                let field = self.target.field(&pair.remote).ok_or_else(|| {
                    RelataError::Definition(format!("{} has no field '{}'", self.target.name(), pair.remote))
                })?;
                Ok((field.column.clone(), field.to_db(self.owner.value_of(&pair.local))?))
            })
            .collect()
    }

    /// Matches the target rows whose key points at the owner.
    fn owned_by(&self) -> RelataResult<WhereNode> {
        Ok(WhereNode::And(
            self.owner_columns()?
                .into_iter()
                .map(|(column, value)| WhereNode::Compare {
                    column: ColumnRef::new(self.target.table(), column),
                    op: CompareOp::Eq,
                    value,
                })
                .collect(),
        ))
    }

    /// Rows of the association model linking the owner.
    fn links_of_owner(&self, through: &ThroughDef, model: &ModelSchema) -> RelataResult<WhereNode> {
        let mut parts = Vec::with_capacity(through.owner_columns.len());
        for pair in &through.owner_columns {
            let field = through_field(model, &pair.remote)?;
            parts.push(WhereNode::Compare {
                column: ColumnRef::new(model.table(), &field.column),
                op: CompareOp::Eq,
                value: field.to_db(self.owner.value_of(&pair.local))?,
            });
        }
        Ok(WhereNode::And(parts))
    }

    fn link_columns(through: &ThroughDef, model: &ModelSchema) -> RelataResult<Vec<ColumnRef>> {
        through
            .target_columns
            .iter()
            .map(|pair| Ok(ColumnRef::new(model.table(), model.column(&pair.local)?)))
            .collect()
    }

    /// The association key of one child, in storage form.
    fn link_key(through: &ThroughDef, model: &ModelSchema, child: &Instance) -> RelataResult<Vec<Value>> {
        through
            .target_columns
            .iter()
            .map(|pair| through_field(model, &pair.local)?.to_db(child.value_of(&pair.remote)))
            .collect()
    }

    fn link_keys(through: &ThroughDef, model: &ModelSchema, children: &[Instance]) -> RelataResult<Vec<Vec<Value>>> {
        children
            .iter()
            .map(|child| Self::link_key(through, model, child))
            .collect()
    }

    /// Adds `children` to the relation.
    ///
    /// For a reverse foreign key the children are re-pointed at the owner;
    /// for many-to-many, missing association rows are inserted.
    pub async fn add(&self, db: &dyn DbExecutor, children: &[Instance]) -> RelataResult<()> {
        self.ensure_owner_saved()?;
        let child_keys = self.check_children(children)?;
        if children.is_empty() {
            return Ok(());
        }
        let compiler = SqlCompiler::new(db.backend_type());

        async {
            emit(SignalKind::PreRelationAdd, self.signal_args(children)).await?;
            match self.relation.kind {
                RelationKind::Reverse => {
                    let update = UpdateQuery {
                        table: self.target.table().to_string(),
                        assignments: self
                            .owner_columns()?
                            .into_iter()
                            .map(|(column, value)| (column, SetExpr::Value(value)))
                            .collect(),
                        where_clause: Some(key_predicate(self.target_pk_refs()?, child_keys)),
                    };
                    let (sql, params) = compiler.compile_update(&update);
                    run_execute(db, &sql, &params).await?;

                    let forward = self.reverse_name()?;
                    for child in children {
                        for pair in &self.relation.columns {
                            child.set_persisted(&pair.remote, self.owner.value_of(&pair.local));
                        }
                        child.leave_collections(&self.relation.name, &self.owner);
                        child.attach_one(forward, Some(self.owner.clone()));
                    }
                }
                _ => {
                    let (through, model) = self.through()?;
                    let link_columns = Self::link_columns(through, &model)?;
                    let link_keys = Self::link_keys(through, &model, children)?;
                    let mut existing_query = Query::new(model.table());
                    existing_query.select = link_columns
                        .iter()
                        .map(|c| SelectColumn::Column {
                            column: c.clone(),
                            label: c.column.clone(),
                        })
                        .collect();
                    existing_query.where_clause = Some(WhereNode::And(vec![
                        self.links_of_owner(through, &model)?,
                        key_predicate(link_columns.clone(), link_keys.clone()),
                    ]));
                    let (sql, params) = compiler.compile_select(&existing_query);
                    let mut seen: HashSet<String> = run_fetch_all(db, &sql, &params)
                        .await?
                        .iter()
                        .map(|row| {
                            let key = link_columns
                                .iter()
                                .map(|c| row.get_value(&c.column).cloned().unwrap_or(Value::Null))
                                .collect();
                            Value::List(key).key_repr()
                        })
                        .collect();

                    let mut columns = Vec::new();
                    let mut owner_values = Vec::new();
                    for pair in &through.owner_columns {
                        let field = through_field(&model, &pair.remote)?;
                        columns.push(field.column.clone());
                        owner_values.push(field.to_db(self.owner.value_of(&pair.local))?);
                    }
                    columns.extend(link_columns.iter().map(|c| c.column.clone()));
                    let mut rows = Vec::new();
                    for key in link_keys {
                        if !seen.insert(Value::List(key.clone()).key_repr()) {
                            continue;
                        }
                        let mut row = owner_values.clone();
                        row.extend(key);
                        rows.push(row);
                    }
                    if !rows.is_empty() {
                        let insert = InsertQuery {
                            table: model.table().to_string(),
                            columns,
                            rows,
                            returning: Vec::new(),
                        };
                        let (sql, params) = compiler.compile_insert(&insert);
                        run_execute(db, &sql, &params).await?;
                    }

                    let reverse = self.reverse_name()?;
                    for child in children {
                        if child.is_relation_loaded(reverse) {
                            child.push_many(reverse, &self.owner);
                        }
                    }
                }
            }

            if self.owner.is_relation_loaded(&self.relation.name) {
                for child in children {
                    self.owner.push_many(&self.relation.name, child);
                }
            }
            emit(SignalKind::PostRelationAdd, self.signal_args(children)).await
        }
        .instrument(query_span(self.owner.model(), "relation_add"))
        .await
    }

    fn null_assignments(&self) -> RelataResult<Vec<(String, SetExpr)>> {
        self.relation
            .columns
            .iter()
            .map(|pair| Ok((self.target.column(&pair.remote)?.to_string(), SetExpr::Value(Value::Null))))
            .collect()
    }

    fn ensure_removable(&self) -> RelataResult<()> {
        if self.relation.kind == RelationKind::Reverse && !self.relation.nullable {
            return Err(RelataError::RelationshipInstance(format!(
                "cannot remove from {}.{}: the key on {} is not nullable; delete the rows instead",
                self.owner.model(),
                self.relation.name,
                self.target.name()
            )));
        }
        Ok(())
    }

    /// Clears the in-memory side of a removal.
    fn forget(&self, children: &[Instance]) -> RelataResult<()> {
        let reverse = self.reverse_name()?;
        for child in children {
            self.owner.remove_many(&self.relation.name, child);
            match self.relation.kind {
                RelationKind::Reverse => {
                    for pair in &self.relation.columns {
                        child.set_persisted(&pair.remote, Value::Null);
                    }
                    child.attach_one(reverse, None);
                }
                _ => child.remove_many(reverse, &self.owner),
            }
        }
        Ok(())
    }

    /// Removes `children` from the relation.
    ///
    /// Reverse foreign keys are set to NULL, which fails with
    /// [`RelataError::RelationshipInstance`] when the key is not nullable.
    pub async fn remove(&self, db: &dyn DbExecutor, children: &[Instance]) -> RelataResult<()> {
        self.ensure_owner_saved()?;
        self.ensure_removable()?;
        let child_keys = self.check_children(children)?;
        if children.is_empty() {
            return Ok(());
        }
        let compiler = SqlCompiler::new(db.backend_type());

        async {
            emit(SignalKind::PreRelationRemove, self.signal_args(children)).await?;
            let (sql, params) = match self.relation.kind {
                RelationKind::Reverse => {
                    compiler.compile_update(&UpdateQuery {
                        table: self.target.table().to_string(),
                        assignments: self.null_assignments()?,
                        where_clause: Some(WhereNode::And(vec![
                            self.owned_by()?,
                            key_predicate(self.target_pk_refs()?, child_keys),
                        ])),
                    })
                }
                _ => {
                    let (through, model) = self.through()?;
                    compiler.compile_delete(&DeleteQuery {
                        table: model.table().to_string(),
                        where_clause: Some(WhereNode::And(vec![
                            self.links_of_owner(through, &model)?,
                            key_predicate(
                                Self::link_columns(through, &model)?,
                                Self::link_keys(through, &model, children)?,
                            ),
                        ])),
                    })
                }
            };
            run_execute(db, &sql, &params).await?;
            self.forget(children)?;
            emit(SignalKind::PostRelationRemove, self.signal_args(children)).await
        }
        .instrument(query_span(self.owner.model(), "relation_remove"))
        .await
    }

    /// Removes every member of the relation.
    ///
    /// Receivers get the loaded members as `related`, or nothing when the
    /// collection was never loaded, and `clear = true` in the context.
    pub async fn clear(&self, db: &dyn DbExecutor) -> RelataResult<()> {
        self.ensure_owner_saved()?;
        self.ensure_removable()?;
        let loaded = self.owner.related_many(&self.relation.name)?;
        let compiler = SqlCompiler::new(db.backend_type());

        async {
            emit(
                SignalKind::PreRelationRemove,
                self.signal_args(&loaded).with("clear", true),
            )
            .await?;
            let (sql, params) = match self.relation.kind {
                RelationKind::Reverse => {
                    compiler.compile_update(&UpdateQuery {
                        table: self.target.table().to_string(),
                        assignments: self.null_assignments()?,
                        where_clause: Some(self.owned_by()?),
                    })
                }
                _ => {
                    let (through, model) = self.through()?;
                    compiler.compile_delete(&DeleteQuery {
                        table: model.table().to_string(),
                        where_clause: Some(self.links_of_owner(through, &model)?),
                    })
                }
            };
            run_execute(db, &sql, &params).await?;
            self.forget(&loaded)?;
            self.owner.clear_many(&self.relation.name);
            emit(
                SignalKind::PostRelationRemove,
                self.signal_args(&loaded).with("clear", true),
            )
            .await
        }
        .instrument(query_span(self.owner.model(), "relation_clear"))
        .await
    }
}

fn through_field<'a>(model: &'a ModelSchema, name: &str) -> RelataResult<&'a FieldDef> {
    model
        .field(name)
        .ok_or_else(|| RelataError::Definition(format!("{} has no field '{name}'", model.name())))
}
