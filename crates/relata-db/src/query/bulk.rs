//! Bulk operations.
//!
//! `bulk_create` and `bulk_update` write many instances with one statement
//! per batch instead of one per instance, and emit a single
//! `bulk_post_update` with every instance touched instead of per-instance
//! save/update signals. `get_or_create` and `update_or_create` combine a
//! lookup with an insert or update.

use std::sync::Arc;

use relata_core::logging::query_span;
use relata_core::{RelataError, RelataResult};
use relata_signals::SignalKind;
use tracing::Instrument;

use super::compiler::{ColumnRef, InsertQuery, SetExpr, SqlCompiler, UpdateQuery};
use super::loader::key_predicate;
use super::lookups::Q;
use super::queryset::{Manager, QuerySet};
use crate::executor::{run_execute, run_insert_returning, DbExecutor};
use crate::instance::{Arg, Instance, InstanceState};
use crate::schema::RelationKind;
use crate::signals::{emit, SignalArgs};
use crate::value::Value;

/// Options for [`QuerySet::bulk_create`].
#[derive(Debug, Clone, Default)]
pub struct BulkCreateOptions {
    /// Rows per INSERT; `None` uses `Settings::bulk_batch_size`.
    pub batch_size: Option<usize>,
}

/// Options for [`QuerySet::bulk_update`].
#[derive(Debug, Clone, Default)]
pub struct BulkUpdateOptions {
    /// Rows per UPDATE; `None` uses `Settings::bulk_batch_size`.
    pub batch_size: Option<usize>,
}

/// Splits `items` into runs sharing the same key, then into chunks of at
/// most `size`, keeping the original order.
fn batches<T, K: PartialEq>(items: Vec<(K, T)>, size: usize) -> Vec<(K, Vec<T>)> {
    let mut out: Vec<(K, Vec<T>)> = Vec::new();
    for (key, item) in items {
        match out.last_mut() {
            Some((last, chunk)) if *last == key && chunk.len() < size => chunk.push(item),
            _ => out.push((key, vec![item])),
        }
    }
    out
}

impl QuerySet {
    fn batch_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.registry().settings().bulk_batch_size)
            .max(1)
    }

    fn check_model(&self, instances: &[Instance]) -> RelataResult<()> {
        match instances.iter().find(|i| i.model() != self.model()) {
            Some(other) => Err(RelataError::Model(format!(
                "cannot write a {} through a {} queryset",
                other.model(),
                self.model()
            ))),
            None => Ok(()),
        }
    }

    /// Inserts transient instances with multi-row INSERTs.
    ///
    /// Generated primary keys are read back with RETURNING and assigned in
    /// insertion order. Instances are grouped by the set of columns they
    /// carry, so a batch never mixes rows with and without an explicit key.
    pub async fn bulk_create(
        &self,
        db: &dyn DbExecutor,
        instances: &[Instance],
        options: &BulkCreateOptions,
    ) -> RelataResult<()> {
        if instances.is_empty() {
            return Ok(());
        }
        self.check_model(instances)?;
        let schema = Arc::clone(self.schema());
        let size = self.batch_size(options.batch_size);

        let mut rows = Vec::with_capacity(instances.len());
        for instance in instances {
            if instance.state() != InstanceState::Transient {
                return Err(RelataError::ModelPersistence(format!(
                    "bulk_create() takes unsaved instances; {} {} is already persisted",
                    instance.model(),
                    instance.pk()
                )));
            }
            instance.fill_defaults()?;
            instance.sync_foreign_keys()?;
            instance.check_required()?;
            let (columns, values): (Vec<String>, Vec<Value>) = instance.insert_values()?.into_iter().unzip();
            rows.push((columns, (instance, values)));
        }

        async {
            let compiler = SqlCompiler::new(db.backend_type());
            let returning = schema.pk_columns()?;
            // Rows without any column need DEFAULT VALUES, one per statement.
            let size = if rows.iter().any(|(columns, _)| columns.is_empty()) { 1 } else { size };
            for (columns, chunk) in batches(rows, size) {
                let insert = InsertQuery {
                    table: schema.table().to_string(),
                    columns,
                    rows: chunk.iter().map(|(_, values)| values.clone()).collect(),
                    returning: returning.clone(),
                };
                let (sql, params) = compiler.compile_insert(&insert);
                let returned = run_insert_returning(db, &sql, &params).await?;
                for ((instance, _), row) in chunk.iter().zip(&returned) {
                    instance.apply_returned(row)?;
                }
                for (instance, _) in &chunk {
                    instance.mark_saved();
                }
            }

            let mut args = SignalArgs::new(&schema).with("operation", "create");
            args.instances = instances.to_vec();
            emit(SignalKind::BulkPostUpdate, args).await
        }
        .instrument(query_span(schema.name(), "bulk_create"))
        .await
    }

    /// Writes `fields` of saved instances with one CASE-keyed UPDATE per
    /// batch, returning the number of rows changed.
    ///
    /// Foreign keys are named by relation; their key columns are written.
    pub async fn bulk_update(
        &self,
        db: &dyn DbExecutor,
        instances: &[Instance],
        fields: &[&str],
        options: &BulkUpdateOptions,
    ) -> RelataResult<u64> {
        if fields.is_empty() {
            return Err(RelataError::QueryDefinition(
                "bulk_update() needs at least one field".to_string(),
            ));
        }
        if instances.is_empty() {
            return Ok(0);
        }
        self.check_model(instances)?;
        let schema = Arc::clone(self.schema());

        let mut targets = Vec::new();
        for name in fields {
            match schema.relation(name) {
                Some(rel) if rel.kind == RelationKind::ForeignKey => {
                    targets.extend(rel.columns.iter().map(|p| p.local.clone()));
                }
                Some(_) => {
                    return Err(RelataError::QueryDefinition(format!(
                        "bulk_update() cannot write collection '{name}'"
                    )))
                }
                None => match schema.field(name) {
                    Some(f) if f.primary_key => {
                        return Err(RelataError::QueryDefinition(format!(
                            "bulk_update() cannot change primary key field '{name}'"
                        )))
                    }
                    Some(f) if !f.shadow => targets.push(f.name.clone()),
                    _ => {
                        return Err(RelataError::QueryDefinition(format!(
                            "{} has no field '{name}'",
                            schema.name()
                        )))
                    }
                },
            }
        }

        let mut keyed = Vec::with_capacity(instances.len());
        for instance in instances {
            let pk = instance.ensure_persisted("bulk_update")?;
            instance.sync_foreign_keys()?;
            if let Some(missing) = targets.iter().find(|name| !instance.has_value(name)) {
                return Err(RelataError::ModelPersistence(format!(
                    "bulk_update() cannot write '{missing}' of {} {}: the field was not loaded",
                    instance.model(),
                    instance.pk()
                )));
            }
            keyed.push(((), (instance, pk)));
        }

        async {
            let compiler = SqlCompiler::new(db.backend_type());
            let key_columns: Vec<ColumnRef> = schema
                .pk_columns()?
                .into_iter()
                .map(|c| ColumnRef::new(schema.table(), c))
                .collect();
            let mut affected = 0;

            for ((), chunk) in batches(keyed, self.batch_size(options.batch_size)) {
                let mut assignments = Vec::with_capacity(targets.len());
                for name in &targets {
                    let field = schema.field(name).ok_or_else(|| {
                        RelataError::Definition(format!("{} has no field '{name}'", schema.name()))
                    })?;
                    let mut branches = Vec::with_capacity(chunk.len());
                    for (instance, pk) in &chunk {
                        branches.push((pk.clone(), field.to_db(instance.value_of(name))?));
                    }
                    assignments.push((
                        field.column.clone(),
                        SetExpr::Case {
                            key_columns: key_columns.clone(),
                            branches,
                        },
                    ));
                }
                let update = UpdateQuery {
                    table: schema.table().to_string(),
                    assignments,
                    where_clause: Some(key_predicate(
                        key_columns.clone(),
                        chunk.iter().map(|(_, pk)| pk.clone()).collect(),
                    )),
                };
                let (sql, params) = compiler.compile_update(&update);
                affected += run_execute(db, &sql, &params).await?;
                for (instance, _) in &chunk {
                    instance.mark_saved();
                }
            }

            let mut args = SignalArgs::new(&schema)
                .with("operation", "update")
                .with("fields", fields.iter().map(ToString::to_string).collect::<Vec<_>>());
            args.instances = instances.to_vec();
            emit(SignalKind::BulkPostUpdate, args).await?;
            Ok(affected)
        }
        .instrument(query_span(schema.name(), "bulk_update"))
        .await
    }

    /// Loads the object matching `lookup`, or creates it from `lookup` plus
    /// `defaults`. Returns the instance and whether it was created.
    ///
    /// Lookup keys with a `__` suffix only filter; plain keys also seed the
    /// new instance.
    pub async fn get_or_create(
        &self,
        db: &dyn DbExecutor,
        lookup: Vec<(String, Arg)>,
        defaults: Vec<(String, Arg)>,
    ) -> RelataResult<(Instance, bool)> {
        let found = self
            .clone()
            .filter(Q::from_kwargs(lookup.clone()))
            .get_or_none(db)
            .await?;
        if let Some(instance) = found {
            return Ok((instance, false));
        }
        let seed = lookup.into_iter().filter(|(k, _)| !k.contains("__")).chain(defaults);
        let instance = Instance::new(self.schema(), seed)?;
        instance.save(db).await?;
        Ok((instance, true))
    }

    /// Updates the object matching `lookup` with `defaults`, or creates it
    /// from both. Returns the instance and whether it was created.
    pub async fn update_or_create(
        &self,
        db: &dyn DbExecutor,
        lookup: Vec<(String, Arg)>,
        defaults: Vec<(String, Arg)>,
    ) -> RelataResult<(Instance, bool)> {
        let found = self
            .clone()
            .filter(Q::from_kwargs(lookup.clone()))
            .get_or_none(db)
            .await?;
        match found {
            Some(instance) => {
                instance.update(db, defaults).await?;
                Ok((instance, false))
            }
            None => {
                let seed = lookup.into_iter().filter(|(k, _)| !k.contains("__")).chain(defaults);
                let instance = Instance::new(self.schema(), seed)?;
                instance.save(db).await?;
                Ok((instance, true))
            }
        }
    }
}

impl Manager {
    /// See [`QuerySet::bulk_create`].
    pub async fn bulk_create(
        &self,
        db: &dyn DbExecutor,
        instances: &[Instance],
        options: &BulkCreateOptions,
    ) -> RelataResult<()> {
        self.all().bulk_create(db, instances, options).await
    }

    /// See [`QuerySet::bulk_update`].
    pub async fn bulk_update(
        &self,
        db: &dyn DbExecutor,
        instances: &[Instance],
        fields: &[&str],
        options: &BulkUpdateOptions,
    ) -> RelataResult<u64> {
        self.all().bulk_update(db, instances, fields, options).await
    }

    /// See [`QuerySet::get_or_create`].
    pub async fn get_or_create(
        &self,
        db: &dyn DbExecutor,
        lookup: Vec<(String, Arg)>,
        defaults: Vec<(String, Arg)>,
    ) -> RelataResult<(Instance, bool)> {
        self.all().get_or_create(db, lookup, defaults).await
    }

    /// See [`QuerySet::update_or_create`].
    pub async fn update_or_create(
        &self,
        db: &dyn DbExecutor,
        lookup: Vec<(String, Arg)>,
        defaults: Vec<(String, Arg)>,
    ) -> RelataResult<(Instance, bool)> {
        self.all().update_or_create(db, lookup, defaults).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batches_split_on_key_and_size() {
        let items = vec![("a", 1), ("a", 2), ("a", 3), ("b", 4), ("a", 5)];
        let out = batches(items, 2);
        assert_eq!(
            out,
            vec![("a", vec![1, 2]), ("a", vec![3]), ("b", vec![4]), ("a", vec![5])]
        );
    }

    #[test]
    fn test_batches_empty() {
        let out: Vec<((), Vec<i32>)> = batches(Vec::new(), 10);
        assert!(out.is_empty());
    }
}
