//! QuerySet and Manager for building and executing model queries.
//!
//! A [`QuerySet`] is a lazy description of a query against one model. Builder
//! methods consume `self` and return the extended value, so a queryset held
//! elsewhere is never changed by chaining on a clone. Nothing touches the
//! database until a terminal method (`all`, `get`, `count`, `iterate`, ...)
//! compiles the description into a [`Query`] and runs it.
//!
//! Relation paths use `__` between segments: `author__team__name`. Filters
//! through to-one relations join directly; filters that cross a to-many
//! relation are evaluated in a primary-key subquery so the root rows are not
//! repeated.
//!
//! # Examples
//!
//! ```
//! use relata_core::Settings;
//! use relata_db::fields::FieldDef;
//! use relata_db::query::{DatabaseBackendType, Q};
//! use relata_db::schema::{ModelDefinition, ModelRegistryBuilder};
//!
//! let registry = ModelRegistryBuilder::new(&Settings::default())
//!     .register(
//!         ModelDefinition::new("Book")
//!             .field(FieldDef::integer("id").primary_key().autoincrement())
//!             .field(FieldDef::string("title", 100))
//!             .field(FieldDef::integer("year")),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let qs = registry
//!     .objects("Book")
//!     .unwrap()
//!     .filter(Q::kw("year__gte", 1920))
//!     .order_by(&["-year"])
//!     .limit(5);
//! let (sql, params) = qs.sql(DatabaseBackendType::SQLite).unwrap();
//! assert!(sql.contains("ORDER BY \"books\".\"year\" DESC"));
//! assert_eq!(params.len(), 1);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use relata_core::logging::query_span;
use relata_core::{RelataError, RelataResult};
use tracing::Instrument;

use super::compiler::{
    AggregateFunc, ColumnRef, CompareOp, DatabaseBackendType, DeleteQuery, Join, JoinType, OrderBy,
    Query, Row, SelectColumn, SetExpr, SqlCompiler, UpdateQuery, WhereNode, escape_like,
};
use super::loader::{default_ordering, CollectionOrder, LoadPlan, Loader, PlanNode};
use super::lookups::{LookupKind, Q};
use crate::executor::{run_execute, run_fetch_all, DbExecutor};
use crate::fields::FieldDef;
use crate::instance::{Arg, Instance};
use crate::schema::{ModelRegistry, ModelSchema, PathStep, RelationKind, ResolvedPath};
use crate::value::Value;

/// The result of `min`/`max`/`sum`/`avg`.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateResult {
    /// The value for a single requested column.
    Scalar(Value),
    /// Values keyed by column path, for several requested columns.
    Map(BTreeMap<String, Value>),
}

impl AggregateResult {
    /// Returns the value for `path`; a scalar answers any path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        match self {
            Self::Scalar(value) => Some(value),
            Self::Map(values) => values.get(path),
        }
    }

    /// Returns the scalar value, if this is a single-column result.
    pub const fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(value) => Some(value),
            Self::Map(_) => None,
        }
    }
}

/// A subscript applied to a queryset, as in `qs[2]` or `qs[5..10]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscript {
    /// A single position.
    Index(i64),
    /// A half-open window with an optional step.
    Slice {
        /// First position, inclusive.
        start: Option<i64>,
        /// Last position, exclusive.
        stop: Option<i64>,
        /// Step; any step is rejected.
        step: Option<i64>,
    },
    /// A non-integer key.
    Key(String),
}

impl From<i64> for Subscript {
    fn from(index: i64) -> Self {
        Self::Index(index)
    }
}

impl From<i32> for Subscript {
    fn from(index: i32) -> Self {
        Self::Index(i64::from(index))
    }
}

impl From<Range<i64>> for Subscript {
    fn from(range: Range<i64>) -> Self {
        Self::Slice {
            start: Some(range.start),
            stop: Some(range.end),
            step: None,
        }
    }
}

impl From<RangeFrom<i64>> for Subscript {
    fn from(range: RangeFrom<i64>) -> Self {
        Self::Slice {
            start: Some(range.start),
            stop: None,
            step: None,
        }
    }
}

impl From<RangeTo<i64>> for Subscript {
    fn from(range: RangeTo<i64>) -> Self {
        Self::Slice {
            start: None,
            stop: Some(range.end),
            step: None,
        }
    }
}

impl From<RangeFull> for Subscript {
    fn from(_: RangeFull) -> Self {
        Self::Slice {
            start: None,
            stop: None,
            step: None,
        }
    }
}

impl From<&str> for Subscript {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

/// The joins needed by one query scope, keyed by relation path.
#[derive(Debug, Clone)]
struct JoinSet {
    root_alias: String,
    joins: Vec<Join>,
    aliases: HashMap<String, String>,
    to_many: bool,
}

impl JoinSet {
    fn new(root: &ModelSchema) -> Self {
        Self {
            root_alias: root.table().to_string(),
            joins: Vec::new(),
            aliases: HashMap::new(),
            to_many: false,
        }
    }

    /// Joins every step and returns the alias of the model the last step
    /// lands on. Steps already joined are reused.
    fn join_steps(&mut self, registry: &ModelRegistry, steps: &[PathStep]) -> RelataResult<String> {
        let mut alias = self.root_alias.clone();
        let mut path = String::new();
        for step in steps {
            if !path.is_empty() {
                path.push_str("__");
            }
            path.push_str(&step.relation.name);
            self.to_many |= step.relation.kind.is_to_many();
            if let Some(existing) = self.aliases.get(&path) {
                alias = existing.clone();
                continue;
            }

            let next = format!("{}__{path}", self.root_alias);
            match (&step.relation.kind, &step.relation.through) {
                (RelationKind::ManyToMany, Some(through)) => {
                    let through_model = registry.get(&through.model)?;
                    let through_alias = format!("{next}__through");
                    let mut on = Vec::new();
                    for pair in &through.owner_columns {
                        on.push((
                            ColumnRef::new(&through_alias, through_model.column(&pair.remote)?),
                            ColumnRef::new(&alias, step.source.column(&pair.local)?),
                        ));
                    }
                    self.joins.push(Join {
                        table: through_model.table().to_string(),
                        alias: through_alias.clone(),
                        join_type: JoinType::Left,
                        on,
                    });
                    let mut on = Vec::new();
                    for pair in &through.target_columns {
                        on.push((
                            ColumnRef::new(&next, step.target.column(&pair.remote)?),
                            ColumnRef::new(&through_alias, through_model.column(&pair.local)?),
                        ));
                    }
                    self.joins.push(Join {
                        table: step.target.table().to_string(),
                        alias: next.clone(),
                        join_type: JoinType::Left,
                        on,
                    });
                }
                _ => {
                    let mut on = Vec::new();
                    for pair in &step.relation.columns {
                        on.push((
                            ColumnRef::new(&next, step.target.column(&pair.remote)?),
                            ColumnRef::new(&alias, step.source.column(&pair.local)?),
                        ));
                    }
                    self.joins.push(Join {
                        table: step.target.table().to_string(),
                        alias: next.clone(),
                        join_type: JoinType::Left,
                        on,
                    });
                }
            }
            self.aliases.insert(path.clone(), next.clone());
            alias = next;
        }
        Ok(alias)
    }

    fn absorb(&mut self, other: Self) {
        for join in other.joins {
            if !self.joins.iter().any(|j| j.alias == join.alias) {
                self.joins.push(join);
            }
        }
        self.aliases.extend(other.aliases);
        self.to_many |= other.to_many;
    }
}

fn pk_refs(schema: &ModelSchema, alias: &str) -> RelataResult<Vec<ColumnRef>> {
    Ok(schema
        .pk_columns()?
        .into_iter()
        .map(|c| ColumnRef::new(alias, c))
        .collect())
}

fn pk_select(schema: &ModelSchema, alias: &str) -> RelataResult<Vec<SelectColumn>> {
    Ok(pk_refs(schema, alias)?
        .into_iter()
        .map(|column| SelectColumn::Column {
            label: column.column.clone(),
            column,
        })
        .collect())
}

fn field_of<'a>(schema: &'a ModelSchema, name: &str) -> RelataResult<&'a FieldDef> {
    schema.field(name).ok_or_else(|| {
        RelataError::QueryDefinition(format!("{} has no field '{name}'", schema.name()))
    })
}

/// Compiles one lookup against one field column.
fn scalar_node(
    field: &FieldDef,
    column: ColumnRef,
    lookup: LookupKind,
    operand: &Arg,
    path: &str,
) -> RelataResult<WhereNode> {
    let Arg::Value(value) = operand else {
        return Err(RelataError::QueryDefinition(format!(
            "'{path}' is a field; compare it against a value, not a model instance"
        )));
    };

    let compare = |op: CompareOp| -> RelataResult<WhereNode> {
        if value.is_null() {
            return Err(RelataError::QueryDefinition(format!(
                "'{path}__{lookup}' cannot compare against NULL; use isnull"
            )));
        }
        Ok(WhereNode::Compare {
            column: column.clone(),
            op,
            value: field.to_db(value.clone())?,
        })
    };

    match lookup {
        LookupKind::Exact if value.is_null() => Ok(WhereNode::IsNull {
            column,
            negated: false,
        }),
        LookupKind::Exact => compare(CompareOp::Eq),
        LookupKind::Gt => compare(CompareOp::Gt),
        LookupKind::Gte => compare(CompareOp::Gte),
        LookupKind::Lt => compare(CompareOp::Lt),
        LookupKind::Lte => compare(CompareOp::Lte),
        LookupKind::IsNull => match value {
            Value::Bool(is_null) => Ok(WhereNode::IsNull {
                column,
                negated: !is_null,
            }),
            other => Err(RelataError::QueryDefinition(format!(
                "'{path}__isnull' takes a boolean, got {other}"
            ))),
        },
        LookupKind::In => match value {
            Value::List(items) => Ok(WhereNode::In {
                column,
                values: items
                    .iter()
                    .map(|v| field.to_db(v.clone()))
                    .collect::<RelataResult<_>>()?,
            }),
            other => Err(RelataError::QueryDefinition(format!(
                "'{path}__in' takes a list, got {other}"
            ))),
        },
        _ => {
            let text = match value {
                Value::Null => {
                    return Err(RelataError::QueryDefinition(format!(
                        "'{path}__{lookup}' cannot match NULL"
                    )))
                }
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let escaped = escape_like(&text);
            let pattern = match lookup {
                LookupKind::Contains | LookupKind::IContains => format!("%{escaped}%"),
                LookupKind::StartsWith | LookupKind::IStartsWith => format!("{escaped}%"),
                LookupKind::EndsWith | LookupKind::IEndsWith => format!("%{escaped}"),
                _ => escaped,
            };
            Ok(WhereNode::Like {
                column,
                pattern,
                case_insensitive: matches!(
                    lookup,
                    LookupKind::IExact
                        | LookupKind::IContains
                        | LookupKind::IStartsWith
                        | LookupKind::IEndsWith
                ),
            })
        }
    }
}

/// Compiles Q trees against a root model, collecting joins as it goes.
struct FilterCompiler<'a> {
    registry: &'a ModelRegistry,
    root: &'a Arc<ModelSchema>,
    joins: &'a mut JoinSet,
}

impl FilterCompiler<'_> {
    fn compile(&mut self, q: &Q) -> RelataResult<WhereNode> {
        match q {
            Q::And(children) => Ok(WhereNode::And(
                children.iter().map(|c| self.compile(c)).collect::<RelataResult<_>>()?,
            )),
            Q::Or(children) => Ok(WhereNode::Or(
                children.iter().map(|c| self.compile(c)).collect::<RelataResult<_>>()?,
            )),
            Q::Not(child) => Ok(WhereNode::Not(Box::new(self.compile(child)?))),
            Q::Filter {
                path,
                lookup,
                value,
            } => self.leaf(path, *lookup, value),
        }
    }

    fn leaf(&mut self, path: &str, lookup: LookupKind, operand: &Arg) -> RelataResult<WhereNode> {
        let resolved = self.registry.resolve_path(self.root.name(), path)?;
        let steps = &resolved.steps;

        if let Some(field_name) = &resolved.field {
            // `fk__pk` compares the key column without joining the target.
            if let Some((last, head)) = steps.split_last() {
                if last.relation.kind == RelationKind::ForeignKey {
                    if let Some(pair) = last.relation.columns.iter().find(|p| &p.remote == field_name) {
                        let alias = self.joins.join_steps(self.registry, head)?;
                        let local = field_of(&last.source, &pair.local)?;
                        let column = ColumnRef::new(alias, &local.column);
                        return scalar_node(local, column, lookup, operand, path);
                    }
                }
            }
            let alias = self.joins.join_steps(self.registry, steps)?;
            let model = resolved.last_model(self.root);
            let field = field_of(model, field_name)?;
            return scalar_node(field, ColumnRef::new(alias, &field.column), lookup, operand, path);
        }

        let Some((last, head)) = steps.split_last() else {
            return Err(RelataError::QueryDefinition(format!("empty filter path on {}", self.root.name())));
        };
        if last.relation.kind == RelationKind::ForeignKey {
            let alias = self.joins.join_steps(self.registry, head)?;
            return self.foreign_key_node(last, &alias, lookup, operand, path);
        }

        // A to-many endpoint compares the related primary key.
        if matches!(operand, Arg::Instance(_) | Arg::Instances(_)) {
            return Err(RelataError::QueryDefinition(format!(
                "'{path}' is a to-many relation; filter on its primary key value instead of a model instance"
            )));
        }
        if last.target.has_composite_pk() {
            return Err(RelataError::QueryDefinition(format!(
                "'{path}' targets {} with a composite key; filter on its fields instead",
                last.target.name()
            )));
        }
        let alias = self.joins.join_steps(self.registry, steps)?;
        let pk_name = last.target.pk_fields().first().cloned().unwrap_or_default();
        let pk = field_of(&last.target, &pk_name)?;
        scalar_node(pk, ColumnRef::new(alias, &pk.column), lookup, operand, path)
    }

    /// Compiles a lookup whose path ends on a foreign key, comparing the
    /// key columns on the owning side.
    fn foreign_key_node(
        &self,
        step: &PathStep,
        alias: &str,
        lookup: LookupKind,
        operand: &Arg,
        path: &str,
    ) -> RelataResult<WhereNode> {
        let rel = &step.relation;
        let locals: Vec<&FieldDef> = rel
            .columns
            .iter()
            .map(|p| field_of(&step.source, &p.local))
            .collect::<RelataResult<_>>()?;
        let columns: Vec<ColumnRef> = locals.iter().map(|f| ColumnRef::new(alias, &f.column)).collect();

        let key_of = |instance: &Instance| -> RelataResult<Vec<Value>> {
            if instance.model() != rel.target {
                return Err(RelataError::QueryDefinition(format!(
                    "'{path}' expects a {} instance, got {}",
                    rel.target,
                    instance.model()
                )));
            }
            let key: Vec<Value> = rel.columns.iter().map(|p| instance.value_of(&p.remote)).collect();
            if key.iter().any(Value::is_null) {
                return Err(RelataError::QueryDefinition(format!(
                    "'{path}' cannot compare against an unsaved {}",
                    rel.target
                )));
            }
            Ok(key)
        };
        let split = |value: &Value| -> RelataResult<Vec<Value>> {
            match value {
                Value::List(items) if items.len() == columns.len() && columns.len() > 1 => Ok(items.clone()),
                single if columns.len() == 1 => Ok(vec![single.clone()]),
                other => Err(RelataError::QueryDefinition(format!(
                    "'{path}' has a {}-column key; got {other}",
                    columns.len()
                ))),
            }
        };
        let matches_key = |key: Vec<Value>| -> RelataResult<WhereNode> {
            let mut parts = Vec::with_capacity(key.len());
            for ((column, field), value) in columns.iter().zip(&locals).zip(key) {
                parts.push(WhereNode::Compare {
                    column: column.clone(),
                    op: CompareOp::Eq,
                    value: field.to_db(value)?,
                });
            }
            Ok(if parts.len() == 1 { parts.remove(0) } else { WhereNode::And(parts) })
        };
        let null_check = |negated: bool| {
            let parts: Vec<WhereNode> = columns
                .iter()
                .map(|c| WhereNode::IsNull {
                    column: c.clone(),
                    negated,
                })
                .collect();
            WhereNode::And(parts)
        };

        match (lookup, operand) {
            (LookupKind::Exact, Arg::Instance(instance)) => matches_key(key_of(instance)?),
            (LookupKind::Exact, Arg::Value(Value::Null)) => Ok(null_check(false)),
            (LookupKind::Exact, Arg::Value(value)) => matches_key(split(value)?),
            (LookupKind::IsNull, Arg::Value(Value::Bool(is_null))) => Ok(null_check(!is_null)),
            (LookupKind::In, Arg::Instances(instances)) => Ok(WhereNode::TupleIn {
                columns,
                rows: instances.iter().map(|i| key_of(i)).collect::<RelataResult<_>>()?,
            }),
            (LookupKind::In, Arg::Value(Value::List(items))) => Ok(WhereNode::TupleIn {
                rows: items.iter().map(|v| split(v)).collect::<RelataResult<_>>()?,
                columns,
            }),
            (_, Arg::Instance(_) | Arg::Instances(_)) => Err(RelataError::QueryDefinition(format!(
                "'{path}__{lookup}' does not accept model instances"
            ))),
            (_, _) if locals.len() == 1 => {
                let column = columns.into_iter().next().ok_or_else(|| {
                    RelataError::QueryDefinition(format!("'{path}' has no key column"))
                })?;
                scalar_node(locals[0], column, lookup, operand, path)
            }
            _ => Err(RelataError::QueryDefinition(format!(
                "'{path}__{lookup}' is not supported on a composite foreign key"
            ))),
        }
    }
}

/// A lazy, chainable query over one model.
#[derive(Debug, Clone)]
pub struct QuerySet {
    registry: Arc<ModelRegistry>,
    schema: Arc<ModelSchema>,
    filters: Vec<Q>,
    excludes: Vec<Q>,
    order_by: Option<Vec<String>>,
    reversed: bool,
    limit: Option<usize>,
    offset: Option<usize>,
    limit_raw_sql: bool,
    select_related: Vec<String>,
    prefetch_related: Vec<String>,
    only_fields: Option<Vec<String>>,
    excluded_fields: Vec<String>,
    is_none: bool,
}

impl QuerySet {
    pub(crate) fn new(registry: Arc<ModelRegistry>, schema: Arc<ModelSchema>) -> Self {
        Self {
            registry,
            schema,
            filters: Vec::new(),
            excludes: Vec::new(),
            order_by: None,
            reversed: false,
            limit: None,
            offset: None,
            limit_raw_sql: false,
            select_related: Vec::new(),
            prefetch_related: Vec::new(),
            only_fields: None,
            excluded_fields: Vec::new(),
            is_none: false,
        }
    }

    /// Returns the queried model's name.
    pub fn model(&self) -> &str {
        self.schema.name()
    }

    /// Returns the queried model's schema.
    pub const fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    pub(crate) const fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Returns `true` once `filter` or `exclude` has been applied.
    pub fn is_narrowed(&self) -> bool {
        !self.filters.is_empty() || !self.excludes.is_empty()
    }

    // ── Builders ─────────────────────────────────────────────────────

    /// Keeps rows matching `q`. Successive calls are ANDed.
    pub fn filter(mut self, q: impl Into<Q>) -> Self {
        self.filters.push(q.into());
        self
    }

    /// Drops rows matching `q`.
    pub fn exclude(mut self, q: impl Into<Q>) -> Self {
        self.excludes.push(q.into());
        self
    }

    /// Replaces the ordering. A leading `-` sorts descending.
    pub fn order_by(mut self, fields: &[&str]) -> Self {
        self.order_by = Some(fields.iter().map(ToString::to_string).collect());
        self.reversed = false;
        self
    }

    /// Flips the effective ordering.
    pub fn reverse(mut self) -> Self {
        self.reversed = !self.reversed;
        self
    }

    /// Caps the number of root objects returned.
    pub const fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Caps the number of joined rows instead of root objects.
    ///
    /// With a to-many `select_related`, the default limit applies to distinct
    /// roots; this variant applies it to the raw joined rows, so the last
    /// root may come back with a partial collection.
    pub const fn limit_raw_sql(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self.limit_raw_sql = true;
        self
    }

    /// Skips the first `n` root objects.
    pub const fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    /// Selects a 1-indexed page of `page_size` objects.
    pub fn paginate(self, page: i64, page_size: i64) -> RelataResult<Self> {
        if page < 1 || page_size < 1 {
            return Err(RelataError::QueryDefinition(format!(
                "paginate() takes page >= 1 and page_size >= 1, got page={page}, page_size={page_size}"
            )));
        }
        let size = usize::try_from(page_size)
            .map_err(|_| RelataError::QueryDefinition(format!("page_size {page_size} is too large")))?;
        let skip = usize::try_from(page - 1)
            .ok()
            .and_then(|p| p.checked_mul(size))
            .ok_or_else(|| RelataError::QueryDefinition(format!("page {page} is too large")))?;
        Ok(self.offset(skip).limit(size))
    }

    /// Applies an index or a slice window on top of any existing window.
    pub fn subscript(self, subscript: impl Into<Subscript>) -> RelataResult<Self> {
        let non_negative = |n: i64| {
            usize::try_from(n).map_err(|_| {
                RelataError::Value(format!("negative indexing is not supported (got {n})"))
            })
        };
        match subscript.into() {
            Subscript::Index(i) => {
                let start = non_negative(i)?;
                let stop = start.checked_add(1).ok_or_else(|| {
                    RelataError::QueryDefinition(format!("index {i} is too large"))
                })?;
                self.window(start, Some(stop))
            }
            Subscript::Slice { step: Some(step), .. } => Err(RelataError::Type(format!(
                "stepped slices are not supported (step {step})"
            ))),
            Subscript::Slice { start, stop, .. } => {
                let start = start.map(non_negative).transpose()?.unwrap_or(0);
                let stop = stop.map(non_negative).transpose()?;
                self.window(start, stop)
            }
            Subscript::Key(key) => Err(RelataError::Type(format!(
                "queryset indices must be integers or slices, not '{key}'"
            ))),
        }
    }

    /// Shorthand for `subscript(start..stop)`.
    pub fn slice(self, start: i64, stop: i64) -> RelataResult<Self> {
        self.subscript(start..stop)
    }

    fn window(mut self, start: usize, stop: Option<usize>) -> RelataResult<Self> {
        let len = stop.map(|stop| stop.saturating_sub(start));
        let remaining = self.limit.map(|limit| limit.saturating_sub(start));
        self.limit = match (len, remaining) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if start > 0 || self.offset.is_some() {
            // OFFSET is bound as a signed 64-bit integer.
            let offset = self
                .offset
                .unwrap_or(0)
                .checked_add(start)
                .filter(|o| i64::try_from(*o).is_ok())
                .ok_or_else(|| {
                    RelataError::QueryDefinition(format!(
                        "offset {} + {start} is too large",
                        self.offset.unwrap_or(0)
                    ))
                })?;
            self.offset = Some(offset);
        }
        Ok(self)
    }

    /// Loads the given relation paths in the same query with LEFT joins.
    pub fn select_related(mut self, paths: &[&str]) -> Self {
        for path in paths {
            if !self.select_related.iter().any(|p| p == path) {
                self.select_related.push((*path).to_string());
            }
        }
        self
    }

    /// Loads the given relation paths with one extra query per path level.
    pub fn prefetch_related(mut self, paths: &[&str]) -> Self {
        for path in paths {
            if !self.prefetch_related.iter().any(|p| p == path) {
                self.prefetch_related.push((*path).to_string());
            }
        }
        self
    }

    /// Restricts loaded columns to `names`; `path__field` restricts a joined
    /// model. Primary keys are always loaded.
    pub fn fields(mut self, names: &[&str]) -> Self {
        self.only_fields
            .get_or_insert_with(Vec::new)
            .extend(names.iter().map(ToString::to_string));
        self
    }

    /// Leaves `names` out of the loaded columns.
    pub fn exclude_fields(mut self, names: &[&str]) -> Self {
        self.excluded_fields.extend(names.iter().map(ToString::to_string));
        self
    }

    /// Returns a queryset that matches nothing and issues no SQL.
    pub const fn none(mut self) -> Self {
        self.is_none = true;
        self
    }

    const fn is_empty_window(&self) -> bool {
        self.is_none || matches!(self.limit, Some(0))
    }

    const fn is_windowed(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    // ── Compilation ──────────────────────────────────────────────────

    fn compile_q(&self, q: &Q, joins: &mut JoinSet) -> RelataResult<WhereNode> {
        FilterCompiler {
            registry: &self.registry,
            root: &self.schema,
            joins,
        }
        .compile(q)
    }

    fn pk_subquery(&self, joins: JoinSet, node: WhereNode) -> RelataResult<WhereNode> {
        let alias = self.schema.table();
        let mut sub = Query::new(alias);
        sub.select = pk_select(&self.schema, alias)?;
        sub.joins = joins.joins;
        sub.where_clause = Some(node);
        Ok(WhereNode::InSubquery {
            columns: pk_refs(&self.schema, alias)?,
            query: Box::new(sub),
        })
    }

    /// Compiles filters and excludes into a root predicate.
    ///
    /// The returned joins are to-one only; anything crossing a to-many
    /// relation is wrapped in a primary-key subquery.
    fn predicate(&self) -> RelataResult<(JoinSet, Option<WhereNode>)> {
        let mut joins = JoinSet::new(&self.schema);
        let mut parts = Vec::new();

        if !self.filters.is_empty() {
            let mut probe = JoinSet::new(&self.schema);
            let mut nodes = Vec::with_capacity(self.filters.len());
            for q in &self.filters {
                nodes.push(self.compile_q(q, &mut probe)?);
            }
            let node = if nodes.len() == 1 { nodes.remove(0) } else { WhereNode::And(nodes) };
            if probe.to_many {
                parts.push(self.pk_subquery(probe, node)?);
            } else {
                joins.absorb(probe);
                parts.push(node);
            }
        }

        for q in &self.excludes {
            let mut probe = JoinSet::new(&self.schema);
            let node = self.compile_q(q, &mut probe)?;
            if probe.joins.is_empty() {
                parts.push(WhereNode::Not(Box::new(node)));
            } else {
                // Rows with no related match must survive the exclusion.
                parts.push(WhereNode::Not(Box::new(self.pk_subquery(probe, node)?)));
            }
        }

        let node = match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(WhereNode::And(parts)),
        };
        Ok((joins, node))
    }

    fn order_entries(&self) -> Vec<String> {
        self.order_by
            .clone()
            .unwrap_or_else(|| self.schema.ordering().to_vec())
    }

    /// For a path ending on a field of a to-many relation that this queryset
    /// loads, returns the relation path and the field.
    fn collection_path(&self, resolved: &ResolvedPath) -> Option<(String, String)> {
        let last = resolved.steps.last()?;
        if !last.relation.kind.is_to_many() {
            return None;
        }
        let field = resolved.field.clone()?;
        let relation_path = resolved
            .steps
            .iter()
            .map(|s| s.relation.name.as_str())
            .collect::<Vec<_>>()
            .join("__");
        let nested = format!("{relation_path}__");
        let loaded = self
            .select_related
            .iter()
            .chain(&self.prefetch_related)
            .any(|p| *p == relation_path || p.starts_with(&nested));
        loaded.then_some((relation_path, field))
    }

    /// Returns the orderings that apply to loaded to-many collections rather
    /// than to the root rows.
    fn collection_orders(&self) -> RelataResult<Vec<CollectionOrder>> {
        let mut orders: Vec<CollectionOrder> = Vec::new();
        for entry in &self.order_entries() {
            let (path, descending) = match entry.strip_prefix('-') {
                Some(path) => (path, true),
                None => (entry.as_str(), false),
            };
            let resolved = self.registry.resolve_path(self.schema.name(), path)?;
            let Some((relation_path, field)) = self.collection_path(&resolved) else {
                continue;
            };
            let term = (field, descending != self.reversed);
            match orders.iter_mut().find(|o| o.path == relation_path) {
                Some(order) => order.terms.push(term),
                None => orders.push(CollectionOrder {
                    path: relation_path,
                    terms: vec![term],
                }),
            }
        }
        Ok(orders)
    }

    /// Returns the effective ordering, always ending in the primary key.
    ///
    /// Entries that order a loaded to-many collection are left to
    /// [`collection_orders`](Self::collection_orders).
    fn order_terms(&self, joins: &mut JoinSet) -> RelataResult<Vec<OrderBy>> {
        let entries = self.order_entries();
        let mut terms = Vec::new();

        for entry in &entries {
            let (path, descending) = match entry.strip_prefix('-') {
                Some(path) => (path, true),
                None => (entry.as_str(), false),
            };
            let resolved = self.registry.resolve_path(self.schema.name(), path)?;
            if resolved.crosses_to_many() {
                if self.collection_path(&resolved).is_some() {
                    continue;
                }
                return Err(RelataError::QueryDefinition(format!(
                    "cannot order {} by '{path}': it crosses a to-many relation that is not loaded",
                    self.schema.name()
                )));
            }
            match &resolved.field {
                Some(field) => {
                    let alias = joins.join_steps(&self.registry, &resolved.steps)?;
                    let model = resolved.last_model(&self.schema);
                    terms.push(OrderBy {
                        column: ColumnRef::new(alias, model.column(field)?),
                        descending,
                    });
                }
                None => {
                    // Ordering by a foreign key orders by its key columns.
                    let Some((last, head)) = resolved.steps.split_last() else {
                        continue;
                    };
                    let alias = joins.join_steps(&self.registry, head)?;
                    for pair in &last.relation.columns {
                        terms.push(OrderBy {
                            column: ColumnRef::new(&alias, last.source.column(&pair.local)?),
                            descending,
                        });
                    }
                }
            }
        }

        for column in pk_refs(&self.schema, &joins.root_alias)? {
            if !terms.iter().any(|t| t.column == column) {
                terms.push(OrderBy::asc(column));
            }
        }
        if self.reversed {
            for term in &mut terms {
                term.descending = !term.descending;
            }
        }
        Ok(terms)
    }

    fn plan_select_related(&self, joins: &mut JoinSet) -> RelataResult<LoadPlan> {
        let mut nodes: Vec<PlanNode> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for path in &self.select_related {
            let resolved = self.registry.resolve_path(self.schema.name(), path)?;
            if resolved.field.is_some() {
                return Err(RelataError::QueryDefinition(format!(
                    "select_related path '{path}' must end on a relation"
                )));
            }
            let mut prefix = String::new();
            for (i, step) in resolved.steps.iter().enumerate() {
                let parent = index.get(&prefix).copied();
                if !prefix.is_empty() {
                    prefix.push_str("__");
                }
                prefix.push_str(&step.relation.name);
                if index.contains_key(&prefix) {
                    continue;
                }
                let alias = joins.join_steps(&self.registry, &resolved.steps[..=i])?;
                index.insert(prefix.clone(), nodes.len());
                nodes.push(PlanNode {
                    path: prefix.clone(),
                    parent,
                    relation: step.relation.clone(),
                    schema: Arc::clone(&step.target),
                    alias,
                });
            }
        }

        Ok(LoadPlan {
            root: Arc::clone(&self.schema),
            nodes,
        })
    }

    fn check_projection(&self, plan: &LoadPlan) -> RelataResult<()> {
        let names = self.only_fields.iter().flatten().chain(&self.excluded_fields);
        for name in names {
            let (scope, field) = match name.rsplit_once("__") {
                Some((path, field)) => {
                    let node = plan.nodes.iter().find(|n| n.path == path).ok_or_else(|| {
                        RelataError::QueryDefinition(format!(
                            "'{name}' names a relation that is not in select_related"
                        ))
                    })?;
                    (&node.schema, field)
                }
                None => (&self.schema, name.as_str()),
            };
            field_of(scope, field)?;
        }
        Ok(())
    }

    /// Projects the loaded columns of one model in the join.
    fn projection(&self, schema: &ModelSchema, alias: &str, path: Option<&str>) -> Vec<SelectColumn> {
        let scoped = |name: &String| -> Option<String> {
            match (path, name.rsplit_once("__")) {
                (None, None) => Some(name.clone()),
                (Some(path), Some((prefix, field))) if prefix == path => Some(field.to_string()),
                _ => None,
            }
        };
        let only: Vec<String> = self.only_fields.iter().flatten().filter_map(scoped).collect();
        let excluded: Vec<String> = self.excluded_fields.iter().filter_map(scoped).collect();

        schema
            .fields()
            .iter()
            .filter(|f| {
                f.primary_key
                    || ((only.is_empty() || only.contains(&f.name)) && !excluded.contains(&f.name))
            })
            .map(|f| SelectColumn::Column {
                column: ColumnRef::new(alias, &f.column),
                label: match path {
                    Some(path) => format!("{path}__{}", f.column),
                    None => f.column.clone(),
                },
            })
            .collect()
    }

    /// Builds the SELECT for loading root objects and the plan to read it.
    fn build_select(&self) -> RelataResult<(Query, LoadPlan)> {
        let root_alias = self.schema.table().to_string();
        let (mut joins, predicate) = self.predicate()?;
        let order = self.order_terms(&mut joins)?;
        let base_joins = joins.joins.clone();
        let plan = self.plan_select_related(&mut joins)?;
        self.check_projection(&plan)?;
        let joined_many = plan.nodes.iter().any(|n| n.relation.kind.is_to_many());

        let mut query = Query::new(&root_alias);
        query.select = self.projection(&self.schema, &root_alias, None);
        for node in &plan.nodes {
            query
                .select
                .extend(self.projection(&node.schema, &node.alias, Some(&node.path)));
        }
        query.joins = joins.joins;
        query.order_by.clone_from(&order);
        // Collections come back in their own model's order within each root.
        for node in plan.nodes.iter().filter(|n| n.relation.kind.is_to_many()) {
            for term in default_ordering(&node.schema, &node.alias) {
                if !query.order_by.iter().any(|o| o.column == term.column) {
                    query.order_by.push(term);
                }
            }
        }

        if self.is_windowed() && joined_many && !self.limit_raw_sql {
            let mut limited = Query::new(&root_alias);
            limited.select = pk_select(&self.schema, &root_alias)?;
            limited.joins = base_joins;
            limited.where_clause = predicate;
            limited.order_by = order;
            limited.limit = self.limit;
            limited.offset = self.offset;
            query.where_clause = Some(WhereNode::InSubquery {
                columns: pk_refs(&self.schema, &root_alias)?,
                query: Box::new(limited),
            });
        } else {
            query.where_clause = predicate;
            query.limit = self.limit;
            query.offset = self.offset;
        }
        Ok((query, plan))
    }

    /// Renders the loading SELECT for `backend`.
    pub fn sql(&self, backend: DatabaseBackendType) -> RelataResult<(String, Vec<Value>)> {
        let (query, _) = self.build_select()?;
        Ok(SqlCompiler::new(backend).compile_select(&query))
    }

    async fn fetch(&self, db: &dyn DbExecutor) -> RelataResult<Vec<Instance>> {
        if self.is_empty_window() {
            return Ok(Vec::new());
        }
        let (query, plan) = self.build_select()?;
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_select(&query);
        let rows = run_fetch_all(db, &sql, &params).await?;

        let mut loader = Loader::new(Arc::clone(&self.registry));
        let roots = loader.hydrate(&plan, &rows)?;
        if !self.prefetch_related.is_empty() {
            loader
                .prefetch(db, &roots, &self.prefetch_related, &self.select_related)
                .await?;
        }
        let orders = self.collection_orders()?;
        if !orders.is_empty() {
            loader.order_collections(&roots, &orders);
        }
        Ok(roots)
    }

    // ── Terminals ────────────────────────────────────────────────────

    /// Loads every matching object.
    pub async fn all(&self, db: &dyn DbExecutor) -> RelataResult<Vec<Instance>> {
        self.fetch(db)
            .instrument(query_span(self.schema.name(), "all"))
            .await
    }

    /// Loads exactly one object.
    ///
    /// Fails with [`RelataError::NoMatch`] when nothing matches and with
    /// [`RelataError::MultipleMatches`] when more than one object does.
    pub async fn get(&self, db: &dyn DbExecutor) -> RelataResult<Instance> {
        let mut qs = self.clone();
        qs.limit = Some(qs.limit.map_or(2, |l| l.min(2)));
        let mut found = qs
            .fetch(db)
            .instrument(query_span(self.schema.name(), "get"))
            .await?;
        match found.len() {
            0 => Err(RelataError::NoMatch(format!(
                "{} matching query does not exist",
                self.schema.name()
            ))),
            1 => Ok(found.remove(0)),
            _ => Err(RelataError::MultipleMatches(format!(
                "get() returned more than one {}",
                self.schema.name()
            ))),
        }
    }

    /// Like [`get`](Self::get), with `None` instead of `NoMatch`.
    pub async fn get_or_none(&self, db: &dyn DbExecutor) -> RelataResult<Option<Instance>> {
        match self.get(db).await {
            Ok(instance) => Ok(Some(instance)),
            Err(RelataError::NoMatch(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Loads the first object in order.
    pub async fn first(&self, db: &dyn DbExecutor) -> RelataResult<Option<Instance>> {
        let qs = self.clone().window(0, Some(1))?;
        Ok(qs
            .fetch(db)
            .instrument(query_span(self.schema.name(), "first"))
            .await?
            .into_iter()
            .next())
    }

    /// Loads the last object in order.
    pub async fn last(&self, db: &dyn DbExecutor) -> RelataResult<Option<Instance>> {
        let qs = self.clone().reverse().window(0, Some(1))?;
        Ok(qs
            .fetch(db)
            .instrument(query_span(self.schema.name(), "last"))
            .await?
            .into_iter()
            .next())
    }

    /// Returns `true` if any object matches.
    pub async fn exists(&self, db: &dyn DbExecutor) -> RelataResult<bool> {
        if self.is_empty_window() {
            return Ok(false);
        }
        let alias = self.schema.table();
        let (joins, predicate) = self.predicate()?;
        let mut query = Query::new(alias);
        query.select = pk_select(&self.schema, alias)?;
        query.joins = joins.joins;
        query.where_clause = predicate;
        query.limit = Some(1);
        query.offset = self.offset;
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_select(&query);
        let rows = run_fetch_all(db, &sql, &params)
            .instrument(query_span(self.schema.name(), "exists"))
            .await?;
        Ok(!rows.is_empty())
    }

    /// Counts matching objects.
    ///
    /// With `distinct`, each root object counts once no matter how many rows
    /// its joins produce. Without it, the joined rows of the loading query are
    /// counted, `select_related` joins included.
    pub async fn count(&self, db: &dyn DbExecutor, distinct: bool) -> RelataResult<u64> {
        if self.is_empty_window() {
            return Ok(0);
        }
        let alias = self.schema.table();
        let (mut joins, predicate) = self.predicate()?;
        let mut inner = Query::new(alias);
        if self.is_windowed() {
            inner.order_by = self.order_terms(&mut joins)?;
            inner.limit = self.limit;
            inner.offset = self.offset;
        }
        if distinct {
            inner.distinct = true;
        } else {
            self.plan_select_related(&mut joins)?;
        }
        inner.select = pk_select(&self.schema, alias)?;
        inner.joins = joins.joins;
        inner.where_clause = predicate;

        let mut outer = Query::from_subquery(inner, "counted");
        outer.select = vec![SelectColumn::CountStar {
            label: "count".to_string(),
        }];
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_select(&outer);
        let rows = run_fetch_all(db, &sql, &params)
            .instrument(query_span(self.schema.name(), "count"))
            .await?;
        let count = match rows.first() {
            Some(row) => row.get::<i64>("count")?,
            None => 0,
        };
        u64::try_from(count).map_err(|_| RelataError::Database(format!("negative count {count}")))
    }

    /// Streams matching objects, loading `iterate_chunk_size` roots per query.
    ///
    /// Each chunk is loaded with its own `select_related` joins. Fails up
    /// front when prefetches are requested, since those need the whole
    /// parent set.
    pub fn iterate<'a>(
        &self,
        db: &'a dyn DbExecutor,
    ) -> RelataResult<BoxStream<'a, RelataResult<Instance>>> {
        if !self.prefetch_related.is_empty() {
            return Err(RelataError::QueryDefinition(
                "prefetch_related() cannot be combined with iterate(); use all()".to_string(),
            ));
        }
        let chunk = self.registry.settings().iterate_chunk_size.max(1);
        let mut base = self.clone();
        base.limit_raw_sql = false;
        let start = self.offset.unwrap_or(0);
        let total = self.limit;

        let pages = stream::try_unfold(Some(0_usize), move |state| {
            let base = base.clone();
            async move {
                let Some(done) = state else {
                    return Ok::<_, RelataError>(None);
                };
                let want = match total {
                    Some(total) if done >= total => return Ok(None),
                    Some(total) => chunk.min(total - done),
                    None => chunk,
                };
                let mut qs = base;
                qs.offset = Some(start + done);
                qs.limit = Some(want);
                let batch = qs.fetch(db).await?;
                if batch.is_empty() {
                    return Ok(None);
                }
                let next = (batch.len() == want).then_some(done + batch.len());
                Ok(Some((batch, next)))
            }
        });
        Ok(pages
            .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<_, RelataError>)))
            .try_flatten()
            .boxed())
    }

    /// Returns raw rows of the given paths, labelled by path. An empty list
    /// selects every root field.
    pub async fn values(&self, db: &dyn DbExecutor, fields: &[&str]) -> RelataResult<Vec<Row>> {
        if self.is_empty_window() {
            return Ok(Vec::new());
        }
        let alias = self.schema.table();
        let (mut joins, predicate) = self.predicate()?;
        let order = self.order_terms(&mut joins)?;

        let paths: Vec<String> = if fields.is_empty() {
            self.schema
                .fields()
                .iter()
                .filter(|f| !f.shadow)
                .map(|f| f.name.clone())
                .collect()
        } else {
            fields.iter().map(ToString::to_string).collect()
        };
        let mut select = Vec::with_capacity(paths.len());
        let mut converters = Vec::with_capacity(paths.len());
        for path in &paths {
            let resolved = self.registry.resolve_path(self.schema.name(), path)?;
            let (alias, field) = match &resolved.field {
                Some(name) => {
                    let alias = joins.join_steps(&self.registry, &resolved.steps)?;
                    (alias, field_of(resolved.last_model(&self.schema), name)?.clone())
                }
                None => match resolved.steps.split_last() {
                    Some((last, head))
                        if last.relation.kind == RelationKind::ForeignKey && last.relation.columns.len() == 1 =>
                    {
                        let alias = joins.join_steps(&self.registry, head)?;
                        (alias, field_of(&last.source, &last.relation.columns[0].local)?.clone())
                    }
                    _ => {
                        return Err(RelataError::QueryDefinition(format!(
                            "values() cannot select relation '{path}'"
                        )))
                    }
                },
            };
            select.push(SelectColumn::Column {
                column: ColumnRef::new(alias, &field.column),
                label: path.clone(),
            });
            converters.push(field);
        }

        let mut query = Query::new(alias);
        query.select = select;
        query.joins = joins.joins;
        query.where_clause = predicate;
        query.order_by = order;
        query.limit = self.limit;
        query.offset = self.offset;
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_select(&query);
        let rows = run_fetch_all(db, &sql, &params)
            .instrument(query_span(self.schema.name(), "values"))
            .await?;

        rows.into_iter()
            .map(|row| {
                let values = paths
                    .iter()
                    .zip(&converters)
                    .map(|(path, field)| field.from_db(row.get_value(path).cloned().unwrap_or(Value::Null)))
                    .collect::<RelataResult<Vec<_>>>()?;
                Ok(Row::new(paths.clone(), values))
            })
            .collect()
    }

    async fn aggregate(
        &self,
        db: &dyn DbExecutor,
        func: AggregateFunc,
        columns: &[&str],
    ) -> RelataResult<AggregateResult> {
        if columns.is_empty() {
            return Err(RelataError::QueryDefinition(format!(
                "{}() needs at least one column",
                func.as_sql().to_lowercase()
            )));
        }
        let alias = self.schema.table();
        let (mut joins, predicate) = self.predicate()?;
        let mut inner = Query::new(alias);
        inner.distinct = true;
        inner.select = pk_refs(&self.schema, alias)?
            .into_iter()
            .enumerate()
            .map(|(i, column)| SelectColumn::Column {
                column,
                label: format!("__pk{i}"),
            })
            .collect();

        let mut outer_select = Vec::with_capacity(columns.len());
        let mut targets = Vec::with_capacity(columns.len());
        for (i, path) in columns.iter().enumerate() {
            let resolved = self.registry.resolve_path(self.schema.name(), path)?;
            let Some(name) = &resolved.field else {
                return Err(RelataError::QueryDefinition(format!(
                    "cannot aggregate relation '{path}'; name one of its fields"
                )));
            };
            let model = resolved.last_model(&self.schema);
            let field = field_of(model, name)?;
            let accepted = match func {
                AggregateFunc::Sum | AggregateFunc::Avg => field.field_type.is_numeric(),
                AggregateFunc::Min | AggregateFunc::Max => field.field_type.is_orderable(),
            };
            if !accepted {
                return Err(RelataError::QueryDefinition(format!(
                    "cannot {} '{path}': {} is not a {} column",
                    func.as_sql().to_lowercase(),
                    field.field_type.name(),
                    if matches!(func, AggregateFunc::Sum | AggregateFunc::Avg) { "numeric" } else { "orderable" }
                )));
            }

            let target_alias = joins.join_steps(&self.registry, &resolved.steps)?;
            // Joined rows stay distinct per related object.
            if !resolved.steps.is_empty() {
                for (j, column) in pk_refs(model, &target_alias)?.into_iter().enumerate() {
                    inner.select.push(SelectColumn::Column {
                        column,
                        label: format!("__k{i}_{j}"),
                    });
                }
            }
            let label = format!("__v{i}");
            inner.select.push(SelectColumn::Column {
                column: ColumnRef::new(&target_alias, &field.column),
                label: label.clone(),
            });
            outer_select.push(SelectColumn::Aggregate {
                func,
                column: ColumnRef::new("aggregated", label),
                label: (*path).to_string(),
            });
            targets.push(field.clone());
        }

        if self.is_windowed() {
            inner.order_by = self.order_terms(&mut joins)?;
            inner.limit = self.limit;
            inner.offset = self.offset;
        }
        inner.joins = joins.joins;
        inner.where_clause = predicate;
        if self.is_empty_window() {
            inner.where_clause = Some(WhereNode::Or(Vec::new()));
        }

        let mut outer = Query::from_subquery(inner, "aggregated");
        outer.select = outer_select;
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_select(&outer);
        let rows = run_fetch_all(db, &sql, &params)
            .instrument(query_span(self.schema.name(), "aggregate"))
            .await?;
        let row = rows.first();

        let mut values = BTreeMap::new();
        for (path, field) in columns.iter().zip(targets) {
            let raw = row.and_then(|r| r.get_value(path)).cloned().unwrap_or(Value::Null);
            let value = match func {
                AggregateFunc::Min | AggregateFunc::Max => field.from_db(raw)?,
                AggregateFunc::Sum | AggregateFunc::Avg => raw,
            };
            values.insert((*path).to_string(), value);
        }
        if values.len() == 1 {
            if let Some((_, value)) = values.pop_first() {
                return Ok(AggregateResult::Scalar(value));
            }
        }
        Ok(AggregateResult::Map(values))
    }

    /// Smallest value of each column over the matching objects.
    pub async fn min(&self, db: &dyn DbExecutor, columns: &[&str]) -> RelataResult<AggregateResult> {
        self.aggregate(db, AggregateFunc::Min, columns).await
    }

    /// Largest value of each column over the matching objects.
    pub async fn max(&self, db: &dyn DbExecutor, columns: &[&str]) -> RelataResult<AggregateResult> {
        self.aggregate(db, AggregateFunc::Max, columns).await
    }

    /// Sum of each numeric column over the matching objects.
    pub async fn sum(&self, db: &dyn DbExecutor, columns: &[&str]) -> RelataResult<AggregateResult> {
        self.aggregate(db, AggregateFunc::Sum, columns).await
    }

    /// Mean of each numeric column over the matching objects.
    pub async fn avg(&self, db: &dyn DbExecutor, columns: &[&str]) -> RelataResult<AggregateResult> {
        self.aggregate(db, AggregateFunc::Avg, columns).await
    }

    fn guard_mutation(&self, operation: &str, each: bool) -> RelataResult<()> {
        if self.is_narrowed() || each {
            return Ok(());
        }
        Err(RelataError::QueryDefinition(format!(
            "{operation}() on {} without filter() would touch every row; filter first or pass each = true",
            self.schema.name()
        )))
    }

    /// Restricts a statement on the root table to the matching rows.
    fn mutation_predicate(&self) -> RelataResult<Option<WhereNode>> {
        let (mut joins, predicate) = self.predicate()?;
        if joins.joins.is_empty() && !self.is_windowed() {
            return Ok(predicate);
        }
        let alias = self.schema.table();
        let mut sub = Query::new(alias);
        if self.is_windowed() {
            sub.order_by = self.order_terms(&mut joins)?;
            sub.limit = self.limit;
            sub.offset = self.offset;
        }
        sub.select = pk_select(&self.schema, alias)?;
        sub.joins = joins.joins;
        sub.where_clause = predicate;
        Ok(Some(WhereNode::InSubquery {
            columns: pk_refs(&self.schema, alias)?,
            query: Box::new(sub),
        }))
    }

    fn assignments<I>(&self, values: I) -> RelataResult<Vec<(String, SetExpr)>>
    where
        I: IntoIterator<Item = (String, Arg)>,
    {
        let mut assignments = Vec::new();
        for (name, arg) in values {
            if let Some(rel) = self.schema.relation(&name) {
                if rel.kind == RelationKind::ForeignKey {
                    let key: Vec<Value> = match &arg {
                        Arg::Instance(other) if other.model() == rel.target => {
                            let key: Vec<Value> = rel.columns.iter().map(|p| other.value_of(&p.remote)).collect();
                            if key.iter().any(Value::is_null) {
                                return Err(RelataError::ModelPersistence(format!(
                                    "cannot point {}.{name} at an unsaved {}",
                                    self.schema.name(),
                                    rel.target
                                )));
                            }
                            key
                        }
                        Arg::Value(Value::Null) if rel.nullable => vec![Value::Null; rel.columns.len()],
                        Arg::Value(Value::Null) => {
                            return Err(RelataError::RelationshipInstance(format!(
                                "{}.{name} is not nullable",
                                self.schema.name()
                            )))
                        }
                        Arg::Value(value) if rel.columns.len() == 1 => vec![value.clone()],
                        other => {
                            return Err(RelataError::RelationshipInstance(format!(
                                "{}.{name} expects a {} instance, got {other:?}",
                                self.schema.name(),
                                rel.target
                            )))
                        }
                    };
                    for (pair, value) in rel.columns.iter().zip(key) {
                        let field = field_of(&self.schema, &pair.local)?;
                        let value = if value.is_null() { value } else { field.validate(value)? };
                        assignments.push((field.column.clone(), SetExpr::Value(field.to_db(value)?)));
                    }
                    continue;
                }
            }

            let field = match self.schema.field(&name) {
                Some(f) if !f.shadow => f,
                _ => {
                    return Err(RelataError::QueryDefinition(format!(
                        "{} has no field '{name}' to update",
                        self.schema.name()
                    )))
                }
            };
            if field.primary_key {
                return Err(RelataError::QueryDefinition(format!(
                    "update() cannot change primary key field '{name}'"
                )));
            }
            let Arg::Value(value) = arg else {
                return Err(RelataError::QueryDefinition(format!(
                    "'{name}' is a field; assign a value, not a model instance"
                )));
            };
            let value = field.validate(value)?;
            assignments.push((field.column.clone(), SetExpr::Value(field.to_db(value)?)));
        }
        if assignments.is_empty() {
            return Err(RelataError::QueryDefinition("update() needs at least one value".to_string()));
        }
        Ok(assignments)
    }

    /// Updates every matching row and returns the number of rows changed.
    ///
    /// Refuses to run on an unfiltered queryset unless `each` is set.
    /// Loaded instances are not refreshed.
    pub async fn update<I>(&self, db: &dyn DbExecutor, values: I, each: bool) -> RelataResult<u64>
    where
        I: IntoIterator<Item = (String, Arg)>,
    {
        self.guard_mutation("update", each)?;
        let assignments = self.assignments(values)?;
        if self.is_empty_window() {
            return Ok(0);
        }
        let update = UpdateQuery {
            table: self.schema.table().to_string(),
            assignments,
            where_clause: self.mutation_predicate()?,
        };
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_update(&update);
        run_execute(db, &sql, &params)
            .instrument(query_span(self.schema.name(), "update"))
            .await
    }

    /// Deletes every matching row and returns the number of rows removed.
    ///
    /// Refuses to run on an unfiltered queryset unless `each` is set.
    pub async fn delete(&self, db: &dyn DbExecutor, each: bool) -> RelataResult<u64> {
        self.guard_mutation("delete", each)?;
        if self.is_empty_window() {
            return Ok(0);
        }
        let delete = DeleteQuery {
            table: self.schema.table().to_string(),
            where_clause: self.mutation_predicate()?,
        };
        let (sql, params) = SqlCompiler::new(db.backend_type()).compile_delete(&delete);
        run_execute(db, &sql, &params)
            .instrument(query_span(self.schema.name(), "delete"))
            .await
    }
}

/// The per-model entry point for queries and inserts.
///
/// Obtained from [`ModelRegistry::objects`]. A manager holds no query state;
/// each call starts a fresh [`QuerySet`].
#[derive(Debug, Clone)]
pub struct Manager {
    registry: Arc<ModelRegistry>,
    schema: Arc<ModelSchema>,
}

impl Manager {
    pub(crate) fn new(registry: Arc<ModelRegistry>, schema: Arc<ModelSchema>) -> Self {
        Self { registry, schema }
    }

    /// Returns the model's name.
    pub fn model(&self) -> &str {
        self.schema.name()
    }

    /// Returns the model's schema.
    pub const fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    /// Returns a queryset over every row.
    pub fn all(&self) -> QuerySet {
        QuerySet::new(Arc::clone(&self.registry), Arc::clone(&self.schema))
    }

    /// Returns a queryset filtered by `q`.
    pub fn filter(&self, q: impl Into<Q>) -> QuerySet {
        self.all().filter(q)
    }

    /// Returns a queryset excluding `q`.
    pub fn exclude(&self, q: impl Into<Q>) -> QuerySet {
        self.all().exclude(q)
    }

    /// Returns a queryset that matches nothing.
    pub fn none(&self) -> QuerySet {
        self.all().none()
    }

    /// Loads the single object matching `q`.
    pub async fn get(&self, db: &dyn DbExecutor, q: impl Into<Q>) -> RelataResult<Instance> {
        self.filter(q).get(db).await
    }

    /// Builds an unsaved instance.
    pub fn instance<I>(&self, values: I) -> RelataResult<Instance>
    where
        I: IntoIterator<Item = (String, Arg)>,
    {
        Instance::new(&self.schema, values)
    }

    /// Builds and saves an instance.
    pub async fn create<I>(&self, db: &dyn DbExecutor, values: I) -> RelataResult<Instance>
    where
        I: IntoIterator<Item = (String, Arg)>,
    {
        let instance = self.instance(values)?;
        instance.save(db).await?;
        Ok(instance)
    }

    /// Counts every row of the model.
    pub async fn count(&self, db: &dyn DbExecutor) -> RelataResult<u64> {
        self.all().count(db, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldDef;
    use crate::schema::{ForeignKey, ManyToMany, ModelDefinition, ModelRegistryBuilder};
    use relata_core::Settings;

    fn registry() -> Arc<ModelRegistry> {
        ModelRegistryBuilder::new(&Settings::default())
            .register(
                ModelDefinition::new("Author")
                    .field(FieldDef::integer("id").primary_key().autoincrement())
                    .field(FieldDef::string("name", 50))
                    .ordering(["name"]),
            )
            .register(
                ModelDefinition::new("Tag")
                    .field(FieldDef::integer("id").primary_key().autoincrement())
                    .field(FieldDef::string("label", 20)),
            )
            .register(
                ModelDefinition::new("Book")
                    .field(FieldDef::integer("id").primary_key().autoincrement())
                    .field(FieldDef::string("title", 100))
                    .field(FieldDef::integer("year"))
                    .foreign_key(ForeignKey::new("author", "Author").related_name("books").nullable())
                    .many_to_many(ManyToMany::new("tags", "Tag").related_name("books")),
            )
            .build()
            .unwrap()
    }

    fn sql(qs: &QuerySet) -> String {
        qs.sql(DatabaseBackendType::SQLite).unwrap().0
    }

    #[test]
    fn test_builders_do_not_touch_the_source() {
        let registry = registry();
        let base = registry.objects("Book").unwrap().all();
        let narrowed = base.clone().filter(Q::kw("year", 1920)).limit(3);
        assert!(!base.is_narrowed());
        assert!(narrowed.is_narrowed());
        assert!(!sql(&base).contains("WHERE"));
        assert!(sql(&narrowed).contains("LIMIT 3"));
    }

    #[test]
    fn test_fk_filter_uses_local_column() {
        let registry = registry();
        let qs = registry.objects("Book").unwrap().filter(Q::kw("author__id", 1));
        let text = sql(&qs);
        assert!(text.contains("\"books\".\"author\" = ?"), "{text}");
        assert!(!text.contains("JOIN"), "{text}");
    }

    #[test]
    fn test_to_one_filter_joins() {
        let registry = registry();
        let qs = registry.objects("Book").unwrap().filter(Q::kw("author__name__icontains", "gu"));
        let (text, params) = qs.sql(DatabaseBackendType::SQLite).unwrap();
        assert!(text.contains("LEFT JOIN \"authors\" AS \"books__author\""), "{text}");
        assert_eq!(params, [Value::from("%gu%")]);
    }

    #[test]
    fn test_to_many_filter_uses_subquery() {
        let registry = registry();
        let qs = registry.objects("Author").unwrap().filter(Q::kw("books__year__lt", 1930));
        let text = sql(&qs);
        assert!(text.contains("\"authors\".\"id\" IN (SELECT"), "{text}");
    }

    #[test]
    fn test_default_ordering_then_pk() {
        let registry = registry();
        let text = sql(&registry.objects("Author").unwrap().all());
        assert!(text.ends_with("ORDER BY \"authors\".\"name\" ASC, \"authors\".\"id\" ASC"), "{text}");
        let text = sql(&registry.objects("Author").unwrap().all().reverse());
        assert!(text.contains("\"authors\".\"name\" DESC, \"authors\".\"id\" DESC"), "{text}");
    }

    #[test]
    fn test_windowed_to_many_select_related_limits_roots() {
        let registry = registry();
        let qs = registry.objects("Author").unwrap().all().select_related(&["books"]).limit(2);
        let text = sql(&qs);
        assert!(text.contains("IN (SELECT \"authors\".\"id\""), "{text}");
        assert!(text.contains("LIMIT 2)"), "{text}");

        let raw = registry.objects("Author").unwrap().all().select_related(&["books"]).limit_raw_sql(2);
        assert!(sql(&raw).ends_with("LIMIT 2"));
    }

    #[test]
    fn test_instance_on_to_many_is_rejected() {
        let registry = registry();
        let tag = registry.objects("Tag").unwrap().instance(crate::values! { "id" => 1, "label" => "x" }).unwrap();
        let qs = registry.objects("Book").unwrap().filter(Q::kw("tags", &tag));
        assert!(matches!(
            qs.sql(DatabaseBackendType::SQLite),
            Err(RelataError::QueryDefinition(_))
        ));
    }

    #[test]
    fn test_pagination_and_slices() {
        let registry = registry();
        let all = registry.objects("Book").unwrap().all();
        assert!(matches!(all.clone().paginate(0, 5), Err(RelataError::QueryDefinition(_))));
        assert!(matches!(all.clone().paginate(1, 0), Err(RelataError::QueryDefinition(_))));
        let page = all.clone().paginate(2, 5).unwrap();
        assert_eq!((page.offset, page.limit), (Some(5), Some(5)));

        assert!(matches!(all.clone().subscript(-1), Err(RelataError::Value(_))));
        let stepped = Subscript::Slice {
            start: Some(0),
            stop: Some(4),
            step: Some(2),
        };
        assert!(matches!(all.clone().subscript(stepped), Err(RelataError::Type(_))));
        assert!(matches!(all.clone().subscript("title"), Err(RelataError::Type(_))));
        assert!(matches!(
            all.clone().subscript(i64::MAX).and_then(|qs| qs.subscript(1)),
            Err(RelataError::QueryDefinition(_))
        ));
        let last_row = all.clone().subscript(i64::MAX).unwrap();
        assert_eq!((last_row.offset, last_row.limit), (Some(usize::try_from(i64::MAX).unwrap()), Some(1)));

        let window = all.slice(2, 8).unwrap().subscript(1..3).unwrap();
        assert_eq!((window.offset, window.limit), (Some(3), Some(2)));
    }

    #[test]
    fn test_order_by_loaded_collection_field() {
        let registry = registry();
        let books = registry.objects("Book").unwrap();
        let qs = books
            .all()
            .order_by(&["-tags__label", "title"])
            .prefetch_related(&["tags"]);
        let text = sql(&qs);
        assert!(!text.contains("label"));
        assert!(text.contains("ORDER BY \"books\".\"title\" ASC"));
        assert_eq!(
            qs.collection_orders().unwrap(),
            [CollectionOrder {
                path: "tags".to_string(),
                terms: vec![("label".to_string(), true)],
            }]
        );
        assert!(!qs.reverse().collection_orders().unwrap()[0].terms[0].1);

        let authors = registry.objects("Author").unwrap();
        let joined = authors.all().order_by(&["books__year"]).select_related(&["books"]);
        assert!(joined.sql(DatabaseBackendType::SQLite).is_ok());
        assert_eq!(joined.collection_orders().unwrap()[0].path, "books");
    }

    #[test]
    fn test_unknown_paths() {
        let registry = registry();
        let books = registry.objects("Book").unwrap();
        assert!(books.filter(Q::kw("nope", 1)).sql(DatabaseBackendType::SQLite).is_err());
        assert!(books.all().order_by(&["tags__label"]).sql(DatabaseBackendType::SQLite).is_err());
        assert!(books.all().select_related(&["title"]).sql(DatabaseBackendType::SQLite).is_err());
        assert!(books.all().fields(&["nope"]).sql(DatabaseBackendType::SQLite).is_err());
    }
}
