//! Model definitions, the schema graph builder and the model registry.
//!
//! - [`definition`] - What application code declares: [`ModelDefinition`],
//!   [`ForeignKey`], [`ManyToMany`], [`Constraint`]
//! - [`builder`] - [`ModelRegistryBuilder`], which validates definitions
//! - [`model`] - The immutable [`ModelSchema`] and [`RelationDef`]
//! - [`registry`] - [`ModelRegistry`] and relation-path resolution

pub mod builder;
pub mod definition;
pub mod model;
pub mod registry;

pub use builder::ModelRegistryBuilder;
pub use definition::{Constraint, ForeignKey, ManyToMany, ModelDefinition};
pub use model::{ColumnPair, ModelSchema, RelationDef, RelationKind, ThroughDef};
pub use registry::{ModelRegistry, PathStep, ResolvedPath};
