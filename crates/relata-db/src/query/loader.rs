//! Rebuilding object graphs from rows.
//!
//! [`Loader::hydrate`] turns the flat rows of one joined SELECT into root
//! instances with their `select_related` relations attached. Within a pass
//! there is at most one [`Instance`] per model and primary key: rows repeated
//! by to-many joins reuse the objects already built and only extend the
//! collections, in first-seen order.
//!
//! [`Loader::prefetch`] then runs one query per `prefetch_related` path
//! level. Queries on the same level run concurrently; results are grouped by
//! owner key and attached to the parents.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use relata_core::{RelataError, RelataResult};

use super::compiler::{ColumnRef, Join, JoinType, OrderBy, Query, Row, SelectColumn, SqlCompiler, WhereNode};
use crate::executor::{run_fetch_all, DbExecutor};
use crate::instance::Instance;
use crate::lifecycle::{row_to_fields, select_all};
use crate::schema::{ModelRegistry, ModelSchema, RelationDef, RelationKind};
use crate::value::Value;

/// One `select_related` relation in a joined query.
#[derive(Debug, Clone)]
pub(crate) struct PlanNode {
    /// The relation path from the root, e.g. `author__team`.
    pub path: String,
    /// Index of the parent node; `None` for relations of the root.
    pub parent: Option<usize>,
    /// The relation crossed from the parent.
    pub relation: RelationDef,
    /// The model the relation lands on.
    pub schema: Arc<ModelSchema>,
    /// The SQL alias of the joined table.
    pub alias: String,
}

impl PlanNode {
    /// The prefix of this node's column labels.
    pub fn label_prefix(&self) -> String {
        format!("{}__", self.path)
    }
}

/// How to read a joined row set back into objects. Parents precede their
/// children in `nodes`.
#[derive(Debug, Clone)]
pub(crate) struct LoadPlan {
    pub root: Arc<ModelSchema>,
    pub nodes: Vec<PlanNode>,
}

/// An ordering applied to a loaded to-many relation after loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CollectionOrder {
    /// The relation path from the root, e.g. `teams__players`.
    pub path: String,
    /// Fields of the related model with their direction, most significant first.
    pub terms: Vec<(String, bool)>,
}

/// Returns a model's default ordering on `alias`, followed by its primary key.
///
/// Ordering entries that traverse relations are left out.
pub(crate) fn default_ordering(schema: &ModelSchema, alias: &str) -> Vec<OrderBy> {
    let mut order = Vec::new();
    for entry in schema.ordering() {
        let (name, descending) = match entry.strip_prefix('-') {
            Some(name) => (name, true),
            None => (entry.as_str(), false),
        };
        if let Some(field) = schema.field(name) {
            order.push(OrderBy {
                column: ColumnRef::new(alias, &field.column),
                descending,
            });
        }
    }
    for column in schema.pk_columns().unwrap_or_default() {
        let column = ColumnRef::new(alias, column);
        if !order.iter().any(|o| o.column == column) {
            order.push(OrderBy::asc(column));
        }
    }
    order
}

/// Builds the identity key for primary-key values read from a row.
fn pk_key(schema: &ModelSchema, values: &HashMap<String, Value>) -> Option<String> {
    let mut pk = Vec::with_capacity(schema.pk_fields().len());
    for name in schema.pk_fields() {
        match values.get(name) {
            Some(v) if !v.is_null() => pk.push(v.clone()),
            _ => return None,
        }
    }
    Some(if pk.len() == 1 {
        pk.remove(0).key_repr()
    } else {
        Value::List(pk).key_repr()
    })
}

fn tuple_key(values: Vec<Value>) -> Option<String> {
    if values.iter().any(Value::is_null) {
        return None;
    }
    Some(Value::List(values).key_repr())
}

pub(crate) fn key_predicate(mut columns: Vec<ColumnRef>, keys: Vec<Vec<Value>>) -> WhereNode {
    if columns.len() == 1 {
        WhereNode::In {
            column: columns.remove(0),
            values: keys.into_iter().flatten().collect(),
        }
    } else {
        WhereNode::TupleIn { columns, rows: keys }
    }
}

/// One satellite query of a prefetch level.
struct PrefetchQuery {
    relation: RelationDef,
    target: Arc<ModelSchema>,
    /// The owner key labels for many-to-many queries, with their through fields.
    owner_labels: Vec<(String, String)>,
    through: Option<Arc<ModelSchema>>,
    parents: Vec<Instance>,
    sql: String,
    params: Vec<Value>,
}

/// Builds object graphs for one load pass.
pub(crate) struct Loader {
    registry: Arc<ModelRegistry>,
    identity: HashMap<(String, String), Instance>,
}

impl Loader {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            identity: HashMap::new(),
        }
    }

    /// Returns the pass-wide instance for `values`, creating it on first sight.
    fn materialize(&mut self, schema: &Arc<ModelSchema>, values: HashMap<String, Value>) -> Option<(Instance, bool)> {
        let key = pk_key(schema, &values)?;
        let slot = (schema.name().to_string(), key);
        if let Some(existing) = self.identity.get(&slot) {
            return Some((existing.clone(), false));
        }
        let instance = Instance::from_db(schema, values);
        self.identity.insert(slot, instance.clone());
        Some((instance, true))
    }

    /// Rebuilds root instances and their joined relations from `rows`.
    pub fn hydrate(&mut self, plan: &LoadPlan, rows: &[Row]) -> RelataResult<Vec<Instance>> {
        let mut roots = Vec::new();
        let mut root_keys = HashSet::new();
        let prefixes: Vec<String> = plan.nodes.iter().map(PlanNode::label_prefix).collect();

        for row in rows {
            let values = row_to_fields(&plan.root, row, str::to_string)?;
            let Some((root, _)) = self.materialize(&plan.root, values) else {
                return Err(RelataError::Database(format!(
                    "{} row without a primary key",
                    plan.root.name()
                )));
            };
            // A root may already exist as a related object of an earlier row.
            if root_keys.insert(root.identity()) {
                roots.push(root.clone());
            }

            let mut objects: Vec<Option<Instance>> = Vec::with_capacity(plan.nodes.len());
            for (node, prefix) in plan.nodes.iter().zip(&prefixes) {
                let parent = match node.parent {
                    None => Some(root.clone()),
                    Some(i) => objects.get(i).cloned().flatten(),
                };
                let Some(parent) = parent else {
                    objects.push(None);
                    continue;
                };

                let values = row_to_fields(&node.schema, row, |c| format!("{prefix}{c}"))?;
                let child = self.materialize(&node.schema, values).map(|(i, _)| i);
                match (&child, node.relation.kind) {
                    (Some(child), RelationKind::ForeignKey) => {
                        if parent.cached_one(&node.relation.name).as_ref() != Some(child) {
                            parent.attach_one(&node.relation.name, Some(child.clone()));
                        }
                    }
                    (Some(child), _) => parent.push_many(&node.relation.name, child),
                    (None, RelationKind::ForeignKey) => {
                        if !parent.is_relation_loaded(&node.relation.name) {
                            parent.attach_one(&node.relation.name, None);
                        }
                    }
                    (None, _) => parent.init_many(&node.relation.name),
                }
                objects.push(child);
            }
        }
        Ok(roots)
    }

    /// Collects the distinct instances reached from `roots` along `path`.
    fn instances_at(&self, roots: &[Instance], path: &[&str]) -> Vec<Instance> {
        let mut current: Vec<Instance> = roots.to_vec();
        for segment in path {
            let mut next = Vec::new();
            let mut seen = HashSet::new();
            for instance in &current {
                let reached = match instance.schema().relation(segment) {
                    Some(rel) if rel.kind == RelationKind::ForeignKey => {
                        instance.cached_one(segment).into_iter().collect()
                    }
                    Some(_) => instance.related_many(segment).unwrap_or_default(),
                    None => Vec::new(),
                };
                for child in reached {
                    if seen.insert((child.model().to_string(), child.identity())) {
                        next.push(child);
                    }
                }
            }
            current = next;
        }
        current
    }

    /// Sorts the collections named in `orders` on every instance that holds them.
    pub fn order_collections(&self, roots: &[Instance], orders: &[CollectionOrder]) {
        for order in orders {
            let segments: Vec<&str> = order.path.split("__").collect();
            let Some((relation, head)) = segments.split_last() else {
                continue;
            };
            for parent in self.instances_at(roots, head) {
                parent.sort_many(relation, |a, b| {
                    for (field, descending) in &order.terms {
                        let ord = a.value_of(field).sort_cmp(&b.value_of(field));
                        let ord = if *descending { ord.reverse() } else { ord };
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                });
            }
        }
    }

    fn prefetch_query(
        &self,
        db: &dyn DbExecutor,
        relation: &RelationDef,
        source: &Arc<ModelSchema>,
        target: &Arc<ModelSchema>,
        parents: Vec<Instance>,
    ) -> RelataResult<Option<PrefetchQuery>> {
        let compiler = SqlCompiler::new(db.backend_type());
        let alias = target.table().to_string();
        let mut query = Query::new(target.table());
        query.select = select_all(target, &alias);
        query.order_by = default_ordering(target, &alias);
        let mut owner_labels = Vec::new();
        let mut through_schema = None;

        let (columns, local_fields): (Vec<ColumnRef>, Vec<String>) = match relation.kind {
            RelationKind::ForeignKey | RelationKind::Reverse => {
                let mut columns = Vec::new();
                let mut locals = Vec::new();
                for pair in &relation.columns {
                    columns.push(ColumnRef::new(&alias, target.column(&pair.remote)?));
                    locals.push(pair.local.clone());
                }
                (columns, locals)
            }
            RelationKind::ManyToMany => {
                let through = relation.through.as_ref().ok_or_else(|| {
                    RelataError::Definition(format!("{}.{} has no association", source.name(), relation.name))
                })?;
                let through_model = self.registry.get(&through.model)?;
                let through_alias = "__through".to_string();
                query.joins.push(Join {
                    table: through_model.table().to_string(),
                    alias: through_alias.clone(),
                    join_type: JoinType::Inner,
                    on: through
                        .target_columns
                        .iter()
                        .map(|pair| {
                            Ok((
                                ColumnRef::new(&through_alias, through_model.column(&pair.local)?),
                                ColumnRef::new(&alias, target.column(&pair.remote)?),
                            ))
                        })
                        .collect::<RelataResult<_>>()?,
                });
                let mut columns = Vec::new();
                let mut locals = Vec::new();
                for (i, pair) in through.owner_columns.iter().enumerate() {
                    let column = ColumnRef::new(&through_alias, through_model.column(&pair.remote)?);
                    let label = format!("__owner_{i}");
                    query.select.push(SelectColumn::Column {
                        column: column.clone(),
                        label: label.clone(),
                    });
                    owner_labels.push((label, pair.remote.clone()));
                    columns.push(column);
                    locals.push(pair.local.clone());
                }
                through_schema = Some(through_model);
                (columns, locals)
            }
        };

        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        for parent in &parents {
            let key: Vec<Value> = local_fields.iter().map(|f| parent.value_of(f)).collect();
            if let Some(repr) = tuple_key(key.clone()) {
                if seen.insert(repr) {
                    keys.push(key);
                }
            }
        }
        if keys.is_empty() {
            Self::attach_empty(relation, &parents);
            return Ok(None);
        }

        query.where_clause = Some(key_predicate(columns, keys));
        let (sql, params) = compiler.compile_select(&query);
        Ok(Some(PrefetchQuery {
            relation: relation.clone(),
            target: Arc::clone(target),
            owner_labels,
            through: through_schema,
            parents,
            sql,
            params,
        }))
    }

    fn attach_empty(relation: &RelationDef, parents: &[Instance]) {
        for parent in parents {
            if relation.kind == RelationKind::ForeignKey {
                parent.attach_one(&relation.name, None);
            } else {
                parent.init_many(&relation.name);
            }
        }
    }

    fn attach_prefetched(&mut self, prefetch: &PrefetchQuery, rows: &[Row]) -> RelataResult<()> {
        // Children grouped by the owner key they belong to, in row order.
        let mut groups: BTreeMap<String, Vec<Instance>> = BTreeMap::new();
        for row in rows {
            let values = row_to_fields(&prefetch.target, row, str::to_string)?;
            let Some((child, _)) = self.materialize(&prefetch.target, values) else {
                continue;
            };
            let owner_key = match (&prefetch.relation.kind, &prefetch.through) {
                (RelationKind::ManyToMany, Some(through)) => {
                    let mut key = Vec::with_capacity(prefetch.owner_labels.len());
                    for (label, field) in &prefetch.owner_labels {
                        let raw = row.get_value(label).cloned().unwrap_or(Value::Null);
                        let value = match through.field(field) {
                            Some(f) => f.from_db(raw)?,
                            None => raw,
                        };
                        key.push(value);
                    }
                    tuple_key(key)
                }
                _ => tuple_key(
                    prefetch.relation
                        .columns
                        .iter()
                        .map(|pair| child.value_of(&pair.remote))
                        .collect(),
                ),
            };
            if let Some(key) = owner_key {
                let group = groups.entry(key).or_default();
                if !group.contains(&child) {
                    group.push(child);
                }
            }
        }

        let locals: Vec<String> = match (&prefetch.relation.kind, &prefetch.relation.through) {
            (RelationKind::ManyToMany, Some(through)) => {
                through.owner_columns.iter().map(|p| p.local.clone()).collect()
            }
            _ => prefetch.relation.columns.iter().map(|p| p.local.clone()).collect(),
        };
        for parent in &prefetch.parents {
            let key = tuple_key(locals.iter().map(|f| parent.value_of(f)).collect());
            let children = key.and_then(|k| groups.get(&k)).cloned().unwrap_or_default();
            if prefetch.relation.kind == RelationKind::ForeignKey {
                parent.attach_one(&prefetch.relation.name, children.into_iter().next());
            } else {
                parent.init_many(&prefetch.relation.name);
                for child in &children {
                    parent.push_many(&prefetch.relation.name, child);
                }
            }
        }
        Ok(())
    }

    /// Loads `paths` for `roots` with one query per path level.
    ///
    /// Path prefixes already joined by `select_related` are read from the
    /// loaded objects instead of being queried again.
    pub async fn prefetch(
        &mut self,
        db: &dyn DbExecutor,
        roots: &[Instance],
        paths: &[String],
        joined: &[String],
    ) -> RelataResult<()> {
        let Some(first) = roots.first() else {
            return Ok(());
        };
        let root = Arc::clone(first.schema());

        let joined: HashSet<String> = joined
            .iter()
            .flat_map(|p| prefixes_of(p))
            .collect();
        let mut levels: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut planned = HashSet::new();
        for path in paths {
            for prefix in prefixes_of(path) {
                if !joined.contains(&prefix) && planned.insert(prefix.clone()) {
                    levels
                        .entry(prefix.matches("__").count())
                        .or_default()
                        .push(prefix);
                }
            }
        }

        for prefixes in levels.values() {
            let mut queries = Vec::new();
            for prefix in prefixes {
                let resolved = self.registry.resolve_path(root.name(), prefix)?;
                if resolved.field.is_some() {
                    return Err(RelataError::QueryDefinition(format!(
                        "prefetch_related path '{prefix}' must end on a relation"
                    )));
                }
                let Some(step) = resolved.steps.last() else {
                    continue;
                };
                let segments: Vec<&str> = prefix.split("__").collect();
                let parents = self.instances_at(roots, &segments[..segments.len() - 1]);
                if parents.is_empty() {
                    continue;
                }
                if let Some(prefetch) =
                    self.prefetch_query(db, &step.relation, &step.source, &step.target, parents)?
                {
                    queries.push(prefetch);
                }
            }

            let results = try_join_all(queries.iter().map(|s| run_fetch_all(db, &s.sql, &s.params))).await?;
            for (prefetch, rows) in queries.iter().zip(results) {
                self.attach_prefetched(prefetch, &rows)?;
            }
        }
        Ok(())
    }
}

/// `a__b__c` -> `["a", "a__b", "a__b__c"]`.
fn prefixes_of(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split("__").collect();
    (1..=segments.len()).map(|n| segments[..n].join("__")).collect()
}
