//! The model registry and relation-path resolution.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use relata_core::{RelataError, RelataResult, Settings};

use super::model::{ModelSchema, RelationDef};
use crate::query::Manager;

/// One hop along a relation path.
#[derive(Debug, Clone)]
pub struct PathStep {
    /// The relation crossed.
    pub relation: RelationDef,
    /// The model the hop starts from.
    pub source: Arc<ModelSchema>,
    /// The model the hop lands on.
    pub target: Arc<ModelSchema>,
}

/// A `__`-separated path resolved against the schema graph.
///
/// `steps` holds the relations crossed; `field` is the scalar field the path
/// ends on, if any.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// Relations crossed, in order.
    pub steps: Vec<PathStep>,
    /// The trailing scalar field.
    pub field: Option<String>,
}

impl ResolvedPath {
    /// Returns the model the path ends on.
    pub fn last_model<'a>(&'a self, root: &'a Arc<ModelSchema>) -> &'a Arc<ModelSchema> {
        self.steps.last().map_or(root, |step| &step.target)
    }

    /// Returns `true` when any step crosses a to-many relation.
    pub fn crosses_to_many(&self) -> bool {
        self.steps.iter().any(|s| s.relation.kind.is_to_many())
    }
}

/// The set of built model schemas.
///
/// Created by [`ModelRegistryBuilder`](super::ModelRegistryBuilder). The
/// registry is the entry point for queries: [`objects`](Self::objects)
/// returns a [`Manager`] for a model.
pub struct ModelRegistry {
    pub(crate) models: HashMap<String, Arc<ModelSchema>>,
    pub(crate) order: Vec<String>,
    pub(crate) settings: Settings,
    pub(crate) path_cache: RwLock<HashMap<(String, String), Arc<ResolvedPath>>>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.order)
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Returns the schema of `name`.
    pub fn get(&self, name: &str) -> RelataResult<Arc<ModelSchema>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| RelataError::Definition(format!("unknown model '{name}'")))
    }

    /// Returns `true` if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Returns every schema in registration order; synthesized association
    /// models come last.
    pub fn models(&self) -> Vec<Arc<ModelSchema>> {
        self.order
            .iter()
            .filter_map(|name| self.models.get(name).cloned())
            .collect()
    }

    /// Returns the settings the registry was built with.
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns a manager for querying `name`.
    pub fn objects(self: &Arc<Self>, name: &str) -> RelataResult<Manager> {
        let schema = self.get(name)?;
        if schema.is_abstract() {
            return Err(RelataError::Model(format!(
                "{name} is abstract and cannot be queried"
            )));
        }
        Ok(Manager::new(Arc::clone(self), schema))
    }

    /// Resolves a `__`-separated path starting at `model`.
    ///
    /// Relation names take precedence over field names; a scalar field may
    /// only appear as the last segment. Results are cached per registry when
    /// `Settings::relation_path_cache` is enabled.
    pub fn resolve_path(&self, model: &str, path: &str) -> RelataResult<Arc<ResolvedPath>> {
        let key = (model.to_string(), path.to_string());
        if let Some(hit) = self.path_cache.read().get(&key) {
            return Ok(Arc::clone(hit));
        }

        let resolved = Arc::new(self.walk(model, path)?);
        if self.settings.relation_path_cache {
            self.path_cache.write().insert(key, Arc::clone(&resolved));
        }
        Ok(resolved)
    }

    fn walk(&self, model: &str, path: &str) -> RelataResult<ResolvedPath> {
        let mut current = self.get(model)?;
        let segments: Vec<&str> = path.split("__").collect();
        let mut steps = Vec::with_capacity(segments.len());
        let mut field = None;

        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(RelataError::QueryDefinition(format!(
                    "empty segment in path '{path}' on {model}"
                )));
            }
            if let Some(relation) = current.relation(segment) {
                let target = self.get(&relation.target)?;
                steps.push(PathStep {
                    relation: relation.clone(),
                    source: Arc::clone(&current),
                    target: Arc::clone(&target),
                });
                current = target;
                continue;
            }
            match current.field(segment) {
                Some(f) if !f.shadow && i + 1 == segments.len() => {
                    field = Some((*segment).to_string());
                }
                Some(f) if !f.shadow => {
                    return Err(RelataError::QueryDefinition(format!(
                        "'{segment}' in '{path}' is a field of {}, not a relation",
                        current.name()
                    )));
                }
                _ => {
                    return Err(RelataError::QueryDefinition(format!(
                        "{} has no field or relation '{segment}' (in '{path}')",
                        current.name()
                    )));
                }
            }
        }

        Ok(ResolvedPath { steps, field })
    }

    /// Disconnects every receiver on every model.
    pub fn reset_signals(&self) {
        for schema in self.models.values() {
            schema.signals().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldDef;
    use crate::schema::{ForeignKey, ManyToMany, ModelDefinition, ModelRegistryBuilder, RelationKind};

    fn registry() -> Arc<ModelRegistry> {
        ModelRegistryBuilder::new(&Settings::default())
            .register(
                ModelDefinition::new("Author")
                    .field(FieldDef::integer("id").primary_key().autoincrement())
                    .field(FieldDef::string("name", 50)),
            )
            .register(
                ModelDefinition::new("Tag")
                    .field(FieldDef::integer("id").primary_key().autoincrement())
                    .field(FieldDef::string("label", 20)),
            )
            .register(
                ModelDefinition::new("Book")
                    .field(FieldDef::integer("id").primary_key().autoincrement())
                    .field(FieldDef::string("title", 50))
                    .foreign_key(ForeignKey::new("author", "Author").related_name("books"))
                    .many_to_many(ManyToMany::new("tags", "Tag").related_name("books")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_resolve_scalar() {
        let registry = registry();
        let path = registry.resolve_path("Book", "title").unwrap();
        assert!(path.steps.is_empty());
        assert_eq!(path.field.as_deref(), Some("title"));
    }

    #[test]
    fn test_resolve_relation_chain() {
        let registry = registry();
        let path = registry.resolve_path("Author", "books__tags__label").unwrap();
        assert_eq!(path.steps.len(), 2);
        assert_eq!(path.steps[0].relation.kind, RelationKind::Reverse);
        assert_eq!(path.steps[1].relation.kind, RelationKind::ManyToMany);
        assert_eq!(path.field.as_deref(), Some("label"));
        assert!(path.crosses_to_many());
    }

    #[test]
    fn test_relation_wins_over_column() {
        let registry = registry();
        let path = registry.resolve_path("Book", "author").unwrap();
        assert_eq!(path.steps.len(), 1);
        assert!(path.field.is_none());
    }

    #[test]
    fn test_invalid_segments() {
        let registry = registry();
        let err = registry.resolve_path("Book", "title__name").unwrap_err();
        assert!(matches!(err, RelataError::QueryDefinition(_)));
        let err = registry.resolve_path("Book", "author__nope").unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_path_cache() {
        let registry = registry();
        let a = registry.resolve_path("Book", "author__name").unwrap();
        let b = registry.resolve_path("Book", "author__name").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_models_in_registration_order() {
        let registry = registry();
        let names: Vec<String> = registry.models().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, ["Author", "Tag", "Book", "BookTag"]);
        assert!(registry.get("Nope").is_err());
    }
}
