//! Model instances and dirty tracking.
//!
//! An [`Instance`] is a handle to a shared value store: cloning it yields
//! another handle to the same object, so a child loaded once can be attached
//! to several parents. Fields are read and written through [`Instance::get`]
//! and [`Instance::set`], which validate every mutation through the field
//! layer. Persistence lives in [`lifecycle`](crate::lifecycle).
//!
//! State transitions:
//!
//! ```text
//! Transient --save--> Saved --set--> Dirty --update--> Saved --delete--> Deleted
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use relata_core::{RelataError, RelataResult};

use crate::fields::FieldDef;
use crate::schema::{ModelSchema, RelationDef, RelationKind};
use crate::value::Value;

/// Where an instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Constructed, never persisted.
    Transient,
    /// In sync with the last insert, update or load.
    Saved,
    /// Mutated since it was last saved.
    Dirty,
    /// Deleted; only a fresh `save()` brings it back.
    Deleted,
}

/// A loaded relation value.
#[derive(Clone)]
pub enum RelationValue {
    /// A to-one relation; `None` when the key is NULL or the row is gone.
    One(Option<Instance>),
    /// A to-many collection, in load order.
    Many(Vec<Instance>),
}

/// A value passed when constructing or updating an instance.
///
/// Built implicitly by the [`values!`](crate::values) macro and by
/// [`Q::kw`](crate::query::Q::kw).
#[derive(Debug, Clone)]
pub enum Arg {
    /// A scalar value.
    Value(Value),
    /// A related instance.
    Instance(Instance),
    /// Several related instances.
    Instances(Vec<Instance>),
}

macro_rules! arg_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(v: $ty) -> Self {
                    Self::Value(v.into())
                }
            }
        )*
    };
}

arg_from_value! {
    Value, bool, i16, i32, i64, u32, f32, f64, &str, String, Vec<u8>,
    rust_decimal::Decimal, chrono::NaiveDate, chrono::NaiveDateTime,
    chrono::DateTime<chrono::Utc>, chrono::NaiveTime, uuid::Uuid, serde_json::Value,
}

impl<T: Into<Value>> From<Option<T>> for Arg {
    fn from(v: Option<T>) -> Self {
        Self::Value(v.map_or(Value::Null, Into::into))
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Arg {
    fn from(v: [T; N]) -> Self {
        Self::Value(Value::List(v.into_iter().map(Into::into).collect()))
    }
}

impl From<Instance> for Arg {
    fn from(v: Instance) -> Self {
        Self::Instance(v)
    }
}

impl From<&Instance> for Arg {
    fn from(v: &Instance) -> Self {
        Self::Instance(v.clone())
    }
}

impl From<Vec<Instance>> for Arg {
    fn from(v: Vec<Instance>) -> Self {
        Self::Instances(v)
    }
}

/// Builds a `Vec<(String, Arg)>` from `key => value` pairs.
///
/// ```
/// use relata_db::values;
///
/// let args = values! { "title" => "Dune", "year" => 1965 };
/// assert_eq!(args.len(), 2);
/// ```
#[macro_export]
macro_rules! values {
    () => {
        ::std::vec::Vec::<(::std::string::String, $crate::instance::Arg)>::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {
        ::std::vec![$((::std::string::String::from($key), $crate::instance::Arg::from($value))),+]
    };
}

type Holder = (Weak<RwLock<InstanceData>>, String);

struct InstanceData {
    values: HashMap<String, Value>,
    relations: HashMap<String, RelationValue>,
    state: InstanceState,
    snapshot: HashMap<String, Value>,
    holders: Vec<Holder>,
    loaded: bool,
}

impl InstanceData {
    fn mark_dirty(&mut self) {
        if self.state == InstanceState::Saved {
            self.state = InstanceState::Dirty;
        }
    }
}

/// A shared handle to one model object.
#[derive(Clone)]
pub struct Instance {
    schema: Arc<ModelSchema>,
    inner: Arc<RwLock<InstanceData>>,
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("model", &self.schema.name())
            .field("pk", &self.pk())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Instance {
    fn empty(schema: &Arc<ModelSchema>, state: InstanceState, loaded: bool) -> Self {
        Self {
            schema: Arc::clone(schema),
            inner: Arc::new(RwLock::new(InstanceData {
                values: HashMap::new(),
                relations: HashMap::new(),
                state,
                snapshot: HashMap::new(),
                holders: Vec::new(),
                loaded,
            })),
        }
    }

    /// Constructs a transient instance, validating every supplied value.
    ///
    /// Relation names accept related instances; defaults fill the fields
    /// left out.
    pub fn new<I>(schema: &Arc<ModelSchema>, values: I) -> RelataResult<Self>
    where
        I: IntoIterator<Item = (String, Arg)>,
    {
        if schema.is_abstract() {
            return Err(RelataError::Model(format!(
                "{} is abstract and cannot be instantiated",
                schema.name()
            )));
        }
        let instance = Self::empty(schema, InstanceState::Transient, true);
        instance.apply(values)?;
        instance.fill_defaults()?;
        Ok(instance)
    }

    /// Builds a saved instance from stored column values, keyed by field name.
    pub(crate) fn from_db(schema: &Arc<ModelSchema>, values: HashMap<String, Value>) -> Self {
        let instance = Self::empty(schema, InstanceState::Saved, true);
        {
            let mut data = instance.inner.write();
            data.snapshot.clone_from(&values);
            data.values = values;
        }
        instance
    }

    /// Builds an unloaded stand-in that only knows its primary key.
    pub(crate) fn placeholder(schema: &Arc<ModelSchema>, pk: HashMap<String, Value>) -> Self {
        let instance = Self::from_db(schema, pk);
        instance.inner.write().loaded = false;
        instance
    }

    /// Returns the model schema.
    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    /// Returns the model name.
    pub fn model(&self) -> &str {
        self.schema.name()
    }

    /// Applies `key => value` pairs as [`Instance::new`] does.
    pub fn apply<I>(&self, values: I) -> RelataResult<()>
    where
        I: IntoIterator<Item = (String, Arg)>,
    {
        for (key, arg) in values {
            self.assign(&key, arg)?;
        }
        Ok(())
    }

    fn assign(&self, key: &str, arg: Arg) -> RelataResult<()> {
        let relation = self.schema.relation(key);
        match (arg, relation) {
            (Arg::Instance(other), Some(rel)) if rel.kind == RelationKind::ForeignKey => {
                self.set_related(key, Some(&other))
            }
            (Arg::Value(Value::Null), Some(rel))
                if rel.kind == RelationKind::ForeignKey && self.schema.field(key).is_none() =>
            {
                self.set_related(key, None)
            }
            (Arg::Value(value), _) if self.schema.field(key).is_some() => self.set(key, value),
            (_, Some(rel)) if rel.kind.is_to_many() => Err(RelataError::RelationshipInstance(format!(
                "{}.{key} is a collection; change it through relation(\"{key}\")",
                self.model()
            ))),
            (_, Some(rel)) => Err(RelataError::RelationshipInstance(format!(
                "{}.{key} expects an instance of {}",
                self.model(),
                rel.target
            ))),
            (Arg::Instance(_) | Arg::Instances(_), None) if self.schema.field(key).is_some() => {
                Err(RelataError::RelationshipInstance(format!(
                    "{}.{key} is not a relation and cannot hold an instance",
                    self.model()
                )))
            }
            _ => Err(RelataError::Model(format!(
                "{} has no field '{key}'",
                self.model()
            ))),
        }
    }

    /// Sets defaults on fields that hold no value yet.
    pub(crate) fn fill_defaults(&self) -> RelataResult<()> {
        let missing: Vec<&FieldDef> = {
            let data = self.inner.read();
            self.schema
                .fields()
                .iter()
                .filter(|f| f.default.is_some() && !data.values.contains_key(&f.name))
                .collect()
        };
        for field in missing {
            if let Some(default) = &field.default {
                let value = field.validate(default.produce())?;
                self.inner.write().values.insert(field.name.clone(), value);
            }
        }
        Ok(())
    }

    fn visible_field(&self, name: &str) -> RelataResult<&FieldDef> {
        match self.schema.field(name) {
            Some(field) if field.shadow => Err(RelataError::Model(format!(
                "{}.{name} is derived from relation '{}' and cannot be accessed directly",
                self.model(),
                field.relation.as_deref().unwrap_or_default()
            ))),
            Some(field) => Ok(field),
            None => match self.schema.relation(name) {
                Some(rel) if rel.kind.is_to_many() => Err(RelataError::Model(format!(
                    "{}.{name} is a collection; use relation(\"{name}\")",
                    self.model()
                ))),
                Some(_) => Err(RelataError::Model(format!(
                    "{}.{name} is a relation; use related(\"{name}\")",
                    self.model()
                ))),
                None => Err(RelataError::Model(format!(
                    "{} has no field '{name}'",
                    self.model()
                ))),
            },
        }
    }

    /// Returns the value of a field; unset fields read as NULL.
    pub fn get(&self, name: &str) -> RelataResult<Value> {
        self.visible_field(name)?;
        Ok(self.value_of(name))
    }

    /// Validates and stores a field value, marking a saved instance dirty.
    ///
    /// Writing a foreign-key column drops the cached related instance.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> RelataResult<()> {
        let field = self.visible_field(name)?;
        let value = field.validate(value.into())?;
        let mut data = self.inner.write();
        if let Some(rel) = &field.relation {
            data.relations.remove(rel);
        }
        data.values.insert(name.to_string(), value);
        data.mark_dirty();
        Ok(())
    }

    fn relation_def(&self, name: &str) -> RelataResult<&RelationDef> {
        self.schema.relation(name).ok_or_else(|| {
            RelataError::Model(format!("{} has no relation '{name}'", self.model()))
        })
    }

    fn to_one(&self, name: &str) -> RelataResult<&RelationDef> {
        let rel = self.relation_def(name)?;
        if rel.kind != RelationKind::ForeignKey {
            return Err(RelataError::RelationshipInstance(format!(
                "{}.{name} is a collection; use relation(\"{name}\")",
                self.model()
            )));
        }
        Ok(rel)
    }

    /// Returns the related instance of a to-one relation.
    ///
    /// When only the key is known, an unloaded placeholder carrying the
    /// target's primary key is returned; `None` means the key is NULL.
    pub fn related(&self, name: &str) -> RelataResult<Option<Self>> {
        let rel = self.to_one(name)?;
        if let Some(RelationValue::One(current)) = self.inner.read().relations.get(name) {
            return Ok(current.clone());
        }

        let mut pk = HashMap::with_capacity(rel.columns.len());
        for pair in &rel.columns {
            let value = self.value_of(&pair.local);
            if value.is_null() {
                return Ok(None);
            }
            pk.insert(pair.remote.clone(), value);
        }
        let target = self.schema.registry()?.get(&rel.target)?;
        let placeholder = Self::placeholder(&target, pk);
        self.attach_one(name, Some(placeholder.clone()));
        Ok(Some(placeholder))
    }

    /// Returns the loaded members of a to-many relation; empty when the
    /// relation has not been loaded.
    pub fn related_many(&self, name: &str) -> RelataResult<Vec<Self>> {
        let rel = self.relation_def(name)?;
        if !rel.kind.is_to_many() {
            return Err(RelataError::RelationshipInstance(format!(
                "{}.{name} is a to-one relation; use related(\"{name}\")",
                self.model()
            )));
        }
        Ok(match self.inner.read().relations.get(name) {
            Some(RelationValue::Many(items)) => items.clone(),
            _ => Vec::new(),
        })
    }

    /// Returns `true` if the relation holds a loaded value.
    pub fn is_relation_loaded(&self, name: &str) -> bool {
        self.inner.read().relations.contains_key(name)
    }

    /// Points a to-one relation at `other`, or clears it.
    ///
    /// The key columns are copied from `other` when it already has a primary
    /// key; an unsaved target is resolved when the owner is saved.
    pub fn set_related(&self, name: &str, other: Option<&Self>) -> RelataResult<()> {
        let rel = self.to_one(name)?.clone();
        match other {
            Some(other) => {
                if other.model() != rel.target {
                    return Err(RelataError::RelationshipInstance(format!(
                        "{}.{name} expects an instance of {}, got {}",
                        self.model(),
                        rel.target,
                        other.model()
                    )));
                }
                let keys: Vec<(String, Value)> = rel
                    .columns
                    .iter()
                    .map(|pair| (pair.local.clone(), other.value_of(&pair.remote)))
                    .collect();
                let resolved = keys.iter().all(|(_, v)| !v.is_null());
                {
                    let mut data = self.inner.write();
                    if resolved {
                        for (local, value) in keys {
                            data.values.insert(local, value);
                        }
                    }
                    data.relations
                        .insert(name.to_string(), RelationValue::One(Some(other.clone())));
                    data.mark_dirty();
                }
                other.add_holder(self, name);
            }
            None => {
                if !rel.nullable {
                    return Err(RelataError::RelationshipInstance(format!(
                        "{}.{name} is not nullable and cannot be cleared",
                        self.model()
                    )));
                }
                let mut data = self.inner.write();
                for pair in &rel.columns {
                    data.values.insert(pair.local.clone(), Value::Null);
                }
                data.relations.insert(name.to_string(), RelationValue::One(None));
                data.mark_dirty();
            }
        }
        Ok(())
    }

    /// Returns the primary key; a [`Value::List`] for composite keys.
    pub fn pk(&self) -> Value {
        let mut values = self.pk_values();
        if values.len() == 1 {
            values.remove(0)
        } else {
            Value::List(values)
        }
    }

    /// Returns the primary-key values in key order.
    pub fn pk_values(&self) -> Vec<Value> {
        let data = self.inner.read();
        self.schema
            .pk_fields()
            .iter()
            .map(|f| data.values.get(f).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Returns `true` when every primary-key value is set.
    pub fn has_pk(&self) -> bool {
        self.pk_values().iter().all(|v| !v.is_null())
    }

    /// Returns `true` only in the [`InstanceState::Saved`] state.
    pub fn is_saved(&self) -> bool {
        self.state() == InstanceState::Saved
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> InstanceState {
        self.inner.read().state
    }

    /// Returns `false` for placeholders that only carry a primary key.
    pub fn is_loaded(&self) -> bool {
        self.inner.read().loaded
    }

    /// Returns the fields whose value differs from the last saved snapshot.
    pub fn dirty_fields(&self) -> Vec<String> {
        let data = self.inner.read();
        self.schema
            .fields()
            .iter()
            .filter(|f| data.values.get(&f.name) != data.snapshot.get(&f.name))
            .map(|f| f.name.clone())
            .collect()
    }

    /// Serializes scalars and loaded relations to JSON.
    ///
    /// An object reached again through its own relations is written as its
    /// primary key only.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_inner(&mut HashSet::new())
    }

    fn to_json_inner(&self, seen: &mut HashSet<usize>) -> serde_json::Value {
        let id = self.ptr_id();
        if !seen.insert(id) {
            return self.pk().to_json();
        }

        let (values, relations) = {
            let data = self.inner.read();
            (data.values.clone(), data.relations.clone())
        };
        let mut out = serde_json::Map::new();
        for field in self.schema.fields().iter().filter(|f| !f.shadow) {
            if let Some(value) = values.get(&field.name) {
                out.insert(field.name.clone(), value.to_json());
            }
        }
        for rel in self.schema.relations() {
            let json = match relations.get(&rel.name) {
                Some(RelationValue::One(Some(other))) => other.to_json_inner(seen),
                Some(RelationValue::One(None)) => serde_json::Value::Null,
                Some(RelationValue::Many(items)) => {
                    serde_json::Value::Array(items.iter().map(|i| i.to_json_inner(seen)).collect())
                }
                None => continue,
            };
            out.insert(rel.name.clone(), json);
        }

        seen.remove(&id);
        serde_json::Value::Object(out)
    }

    // ── Crate-internal plumbing ──────────────────────────────────────

    fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Returns a stable identity key built from the primary key.
    pub(crate) fn identity(&self) -> String {
        self.pk().key_repr()
    }

    /// Reads any stored field, including shadow columns.
    pub(crate) fn value_of(&self, field: &str) -> Value {
        self.inner
            .read()
            .values
            .get(field)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Returns `true` if the field holds a value (NULL counts).
    pub(crate) fn has_value(&self, field: &str) -> bool {
        self.inner.read().values.contains_key(field)
    }

    /// Stores a value that already matches the database.
    pub(crate) fn set_persisted(&self, field: &str, value: Value) {
        let mut data = self.inner.write();
        data.snapshot.insert(field.to_string(), value.clone());
        data.values.insert(field.to_string(), value);
    }

    /// Stores a value without validation or state change.
    pub(crate) fn set_raw(&self, field: &str, value: Value) {
        self.inner.write().values.insert(field.to_string(), value);
    }

    pub(crate) fn mark_saved(&self) {
        let mut data = self.inner.write();
        data.snapshot = data.values.clone();
        data.state = InstanceState::Saved;
        data.loaded = true;
    }

    pub(crate) fn mark_deleted(&self) {
        self.inner.write().state = InstanceState::Deleted;
    }

    /// Forgets every cached relation.
    pub(crate) fn clear_relations(&self) {
        self.inner.write().relations.clear();
    }

    /// Returns the cached to-one instance without creating a placeholder.
    pub(crate) fn cached_one(&self, name: &str) -> Option<Self> {
        match self.inner.read().relations.get(name) {
            Some(RelationValue::One(Some(other))) => Some(other.clone()),
            _ => None,
        }
    }

    /// Sets a to-one relation cache without touching columns or state.
    pub(crate) fn attach_one(&self, name: &str, other: Option<Self>) {
        self.inner
            .write()
            .relations
            .insert(name.to_string(), RelationValue::One(other.clone()));
        if let Some(other) = other {
            other.add_holder(self, name);
        }
    }

    /// Marks a to-many relation as loaded, keeping members already present.
    pub(crate) fn init_many(&self, name: &str) {
        self.inner
            .write()
            .relations
            .entry(name.to_string())
            .or_insert_with(|| RelationValue::Many(Vec::new()));
    }

    /// Appends a member to a to-many relation unless it is already there.
    pub(crate) fn push_many(&self, name: &str, child: &Self) {
        let added = {
            let mut data = self.inner.write();
            let entry = data
                .relations
                .entry(name.to_string())
                .or_insert_with(|| RelationValue::Many(Vec::new()));
            match entry {
                RelationValue::Many(items) if !items.contains(child) => {
                    items.push(child.clone());
                    true
                }
                RelationValue::Many(_) => false,
                RelationValue::One(_) => {
                    *entry = RelationValue::Many(vec![child.clone()]);
                    true
                }
            }
        };
        if added {
            child.add_holder(self, name);
        }
    }

    /// Removes a member from a loaded to-many relation.
    pub(crate) fn remove_many(&self, name: &str, child: &Self) {
        if let Some(RelationValue::Many(items)) = self.inner.write().relations.get_mut(name) {
            items.retain(|i| i != child);
        }
    }

    /// Clears a loaded to-many relation.
    pub(crate) fn clear_many(&self, name: &str) {
        if let Some(RelationValue::Many(items)) = self.inner.write().relations.get_mut(name) {
            items.clear();
        }
    }

    /// Reorders a loaded to-many relation.
    pub(crate) fn sort_many<F>(&self, name: &str, compare: F)
    where
        F: FnMut(&Self, &Self) -> std::cmp::Ordering,
    {
        // Members are sorted outside the lock; a member may be `self`.
        let mut items = match self.inner.read().relations.get(name) {
            Some(RelationValue::Many(items)) => items.clone(),
            _ => return,
        };
        items.sort_by(compare);
        if let Some(RelationValue::Many(current)) = self.inner.write().relations.get_mut(name) {
            *current = items;
        }
    }

    fn add_holder(&self, holder: &Self, relation: &str) {
        let weak = Arc::downgrade(&holder.inner);
        let mut data = self.inner.write();
        if !data
            .holders
            .iter()
            .any(|(h, r)| r == relation && Weak::ptr_eq(h, &weak))
        {
            data.holders.push((weak, relation.to_string()));
        }
    }

    /// Drops this instance from the `relation` collections of every holder
    /// except `keep`.
    pub(crate) fn leave_collections(&self, relation: &str, keep: &Self) {
        let mut leaving = Vec::new();
        self.inner.write().holders.retain(|(weak, r)| {
            let stays = r != relation || std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&keep.inner));
            if !stays {
                leaving.push(weak.clone());
            }
            stays
        });
        for weak in leaving {
            let Some(holder) = weak.upgrade() else {
                continue;
            };
            if let Some(RelationValue::Many(items)) = holder.write().relations.get_mut(relation) {
                items.retain(|i| i != self);
            };
        }
    }

    /// Removes this instance from every loaded relation that refers to it.
    pub(crate) fn detach_from_holders(&self) {
        let holders = std::mem::take(&mut self.inner.write().holders);
        for (weak, relation) in holders {
            let Some(holder) = weak.upgrade() else {
                continue;
            };
            let mut data = holder.write();
            match data.relations.get_mut(&relation) {
                Some(RelationValue::One(current)) if current.as_ref() == Some(self) => {
                    *current = None;
                }
                Some(RelationValue::Many(items)) => items.retain(|i| i != self),
                _ => {}
            }
        }
    }
}
