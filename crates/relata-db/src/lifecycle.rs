//! Persisting instances.
//!
//! Each operation runs `pre_<event>` to completion, issues its statement,
//! then runs `post_<event>` before returning. Receivers see the live
//! instance, so a change made in `pre_update` is part of the UPDATE.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use relata_core::logging::query_span;
use relata_core::{RelataError, RelataResult, ValidationError};
use relata_signals::SignalKind;
use tracing::Instrument;

use crate::executor::{run_execute, run_fetch_all, run_insert_returning, DbExecutor};
use crate::instance::{Arg, Instance, InstanceState};
use crate::query::compiler::{
    ColumnRef, CompareOp, DeleteQuery, InsertQuery, Query, Row, SelectColumn, SetExpr, SqlCompiler,
    UpdateQuery, WhereNode,
};
use crate::schema::{ModelSchema, RelationKind};
use crate::signals::{emit, SignalArgs};
use crate::value::Value;

/// Matches one row of `schema` by primary key.
pub(crate) fn pk_predicate(schema: &ModelSchema, alias: &str, pk: &[Value]) -> RelataResult<WhereNode> {
    let columns = schema.pk_columns()?;
    Ok(WhereNode::And(
        columns
            .into_iter()
            .zip(pk)
            .map(|(column, value)| WhereNode::Compare {
                column: ColumnRef::new(alias, column),
                op: CompareOp::Eq,
                value: value.clone(),
            })
            .collect(),
    ))
}

/// Converts a driver row into field values; `label` maps a stored column to
/// its label in the row. Columns missing from the row are skipped.
pub(crate) fn row_to_fields(
    schema: &ModelSchema,
    row: &Row,
    label: impl Fn(&str) -> String,
) -> RelataResult<HashMap<String, Value>> {
    let mut values = HashMap::with_capacity(schema.fields().len());
    for field in schema.fields() {
        if let Some(raw) = row.get_value(&label(&field.column)) {
            values.insert(field.name.clone(), field.from_db(raw.clone())?);
        }
    }
    Ok(values)
}

/// Projects every column of `schema`, labelled by column name.
pub(crate) fn select_all(schema: &ModelSchema, alias: &str) -> Vec<SelectColumn> {
    schema
        .fields()
        .iter()
        .map(|f| SelectColumn::Column {
            column: ColumnRef::new(alias, &f.column),
            label: f.column.clone(),
        })
        .collect()
}

impl Instance {
    pub(crate) fn ensure_persisted(&self, operation: &str) -> RelataResult<Vec<Value>> {
        match self.state() {
            InstanceState::Transient | InstanceState::Deleted => {
                return Err(RelataError::ModelPersistence(format!(
                    "cannot {operation} {}: it is not saved",
                    self.model()
                )))
            }
            InstanceState::Saved | InstanceState::Dirty => {}
        }
        let pk = self.pk_values();
        if pk.iter().any(Value::is_null) {
            return Err(RelataError::ModelPersistence(format!(
                "cannot {operation} {}: it has no primary key value",
                self.model()
            )));
        }
        Ok(pk)
    }

    /// Copies primary keys of attached related instances into the key columns.
    pub(crate) fn sync_foreign_keys(&self) -> RelataResult<()> {
        let schema = Arc::clone(self.schema());
        for rel in schema.relations().iter().filter(|r| r.kind == RelationKind::ForeignKey) {
            let Some(other) = self.cached_one(&rel.name) else {
                continue;
            };
            if matches!(other.state(), InstanceState::Transient | InstanceState::Deleted)
                || !other.has_pk()
            {
                return Err(RelataError::ModelPersistence(format!(
                    "{}.{} refers to an unsaved {}; save it first",
                    self.model(),
                    rel.name,
                    rel.target
                )));
            }
            for pair in &rel.columns {
                self.set_raw(&pair.local, other.value_of(&pair.remote));
            }
        }
        Ok(())
    }

    /// Fails when a required field holds no value.
    pub(crate) fn check_required(&self) -> RelataResult<()> {
        let mut errors = BTreeMap::new();
        for field in self.schema().fields() {
            if field.is_required() && self.value_of(&field.name).is_null() {
                errors.insert(
                    field.name.clone(),
                    vec![ValidationError::new("This field is required.", "required")],
                );
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::with_field_errors(errors).into())
        }
    }

    /// Returns the `(column, stored value)` pairs an INSERT writes.
    pub(crate) fn insert_values(&self) -> RelataResult<Vec<(String, Value)>> {
        let mut out = Vec::new();
        for field in self.schema().fields() {
            if !self.has_value(&field.name) {
                continue;
            }
            let value = self.value_of(&field.name);
            if field.autoincrement && value.is_null() {
                continue;
            }
            out.push((field.column.clone(), field.to_db(value)?));
        }
        Ok(out)
    }

    /// Stores primary-key values returned by an INSERT.
    pub(crate) fn apply_returned(&self, row: &Row) -> RelataResult<()> {
        let schema = Arc::clone(self.schema());
        for name in schema.pk_fields() {
            let field = schema.field(name).ok_or_else(|| {
                RelataError::Definition(format!("{} has no field '{name}'", schema.name()))
            })?;
            if let Some(raw) = row.get_value(&field.column) {
                self.set_raw(name, field.from_db(raw.clone())?);
            }
        }
        Ok(())
    }

    /// Inserts the instance.
    ///
    /// Fails validation before any SQL when a required field is missing, and
    /// with [`RelataError::ModelPersistence`] when an attached related instance
    /// is unsaved.
    pub async fn save(&self, db: &dyn DbExecutor) -> RelataResult<()> {
        let schema = Arc::clone(self.schema());
        async {
            self.fill_defaults()?;
            emit(SignalKind::PreSave, SignalArgs::for_instance(self)).await?;
            self.sync_foreign_keys()?;
            self.check_required()?;

            let (columns, row): (Vec<String>, Vec<Value>) = self.insert_values()?.into_iter().unzip();
            let insert = InsertQuery {
                table: schema.table().to_string(),
                columns,
                rows: vec![row],
                returning: schema.pk_columns()?,
            };
            let (sql, params) = SqlCompiler::new(db.backend_type()).compile_insert(&insert);
            let returned = run_insert_returning(db, &sql, &params).await?;
            if let Some(row) = returned.first() {
                self.apply_returned(row)?;
            }
            self.mark_saved();

            emit(SignalKind::PostSave, SignalArgs::for_instance(self)).await
        }
        .instrument(query_span(schema.name(), "save"))
        .await
    }

    /// Applies `overrides` and writes every stored non-key column.
    pub async fn update<I>(&self, db: &dyn DbExecutor, overrides: I) -> RelataResult<()>
    where
        I: IntoIterator<Item = (String, Arg)>,
    {
        let schema = Arc::clone(self.schema());
        self.ensure_persisted("update")?;
        self.apply(overrides)?;
        async {
            let fields = self.dirty_fields();
            emit(
                SignalKind::PreUpdate,
                SignalArgs::for_instance(self).with("fields", fields),
            )
            .await?;
            self.sync_foreign_keys()?;
            self.check_required()?;

            let mut assignments = Vec::new();
            for field in schema.fields().iter().filter(|f| !f.primary_key) {
                if self.has_value(&field.name) {
                    let value = field.to_db(self.value_of(&field.name))?;
                    assignments.push((field.column.clone(), SetExpr::Value(value)));
                }
            }
            if !assignments.is_empty() {
                let update = UpdateQuery {
                    table: schema.table().to_string(),
                    where_clause: Some(pk_predicate(&schema, schema.table(), &self.pk_values())?),
                    assignments,
                };
                let (sql, params) = SqlCompiler::new(db.backend_type()).compile_update(&update);
                run_execute(db, &sql, &params).await?;
            }
            self.mark_saved();

            emit(SignalKind::PostUpdate, SignalArgs::for_instance(self)).await
        }
        .instrument(query_span(schema.name(), "update"))
        .await
    }

    /// Inserts a transient instance, updates a saved one.
    pub async fn upsert<I>(&self, db: &dyn DbExecutor, overrides: I) -> RelataResult<()>
    where
        I: IntoIterator<Item = (String, Arg)>,
    {
        if self.state() == InstanceState::Transient {
            self.apply(overrides)?;
            self.save(db).await
        } else {
            self.update(db, overrides).await
        }
    }

    /// Deletes the row and clears this instance from loaded relations.
    pub async fn delete(&self, db: &dyn DbExecutor) -> RelataResult<()> {
        let schema = Arc::clone(self.schema());
        let pk = self.ensure_persisted("delete")?;
        async {
            emit(SignalKind::PreDelete, SignalArgs::for_instance(self)).await?;

            let delete = DeleteQuery {
                table: schema.table().to_string(),
                where_clause: Some(pk_predicate(&schema, schema.table(), &pk)?),
            };
            let (sql, params) = SqlCompiler::new(db.backend_type()).compile_delete(&delete);
            run_execute(db, &sql, &params).await?;
            self.mark_deleted();
            self.detach_from_holders();

            emit(SignalKind::PostDelete, SignalArgs::for_instance(self)).await
        }
        .instrument(query_span(schema.name(), "delete"))
        .await
    }

    /// Re-reads every column by primary key and drops cached relations.
    pub async fn load(&self, db: &dyn DbExecutor) -> RelataResult<()> {
        let schema = Arc::clone(self.schema());
        let pk = self.pk_values();
        if pk.iter().any(Value::is_null) {
            return Err(RelataError::ModelPersistence(format!(
                "cannot load {}: it has no primary key value",
                self.model()
            )));
        }

        let mut query = Query::new(schema.table());
        query.select = select_all(&schema, schema.table());
        query.where_clause = Some(pk_predicate(&schema, schema.table(), &pk)?);
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_select(&query);
        let rows = run_fetch_all(db, &sql, &params)
            .instrument(query_span(schema.name(), "load"))
            .await?;
        let row = rows.first().ok_or_else(|| {
            RelataError::NoMatch(format!("{} with pk {} does not exist", schema.name(), self.pk()))
        })?;

        for (name, value) in row_to_fields(&schema, row, str::to_string)? {
            self.set_persisted(&name, value);
        }
        self.clear_relations();
        self.mark_saved();
        Ok(())
    }
}
