//! # relata-db
//!
//! ORM layer for relata. Models are declared as data with
//! [`ModelDefinition`](schema::ModelDefinition) and validated into a
//! [`ModelRegistry`](schema::ModelRegistry) by the schema graph builder.
//! [`QuerySet`](query::QuerySet) builds queries, [`Instance`](instance::Instance)
//! carries rows through their lifecycle, and [`signals`] lets application
//! code hook into every write.
//!
//! ## Architecture
//!
//! The ORM is designed around lazy evaluation. A [`QuerySet`](query::QuerySet)
//! records filters, ordering, windows and eager-loading paths without touching
//! the database. SQL is only generated when a terminal method (`.all()`,
//! `.get()`, `.count()`, ...) is called, at which point the
//! [`SqlCompiler`](query::SqlCompiler) translates the query AST into
//! parameterized SQL for the target backend. Execution goes through the
//! [`DbExecutor`](executor::DbExecutor) trait, implemented by
//! `relata-db-backends`.
//!
//! ## Module Overview
//!
//! - [`schema`] - Model definitions, the graph builder and the registry
//! - [`fields`] - Field definitions ([`FieldDef`](fields::FieldDef)) and types
//! - [`value`] - The backend-agnostic [`Value`](value::Value) enum
//! - [`validators`] - Field validators
//! - [`instance`] - Model instances, dirty tracking and the relation cache
//! - [`lifecycle`] - save, update, upsert, delete and load
//! - [`related`] - Managers for to-many relations
//! - [`signals`] - Signal payloads and receiver registration
//! - [`query`] - Query building, lookups, bulk operations and compilation
//! - [`executor`] - The database executor trait
//! - [`transactions`] - Transactions and savepoints

// These clippy lints are intentionally allowed for the ORM crate:
// - struct_excessive_bools: FieldDef carries one flag per column option
// - too_many_lines: the SQL compiler and queryset compilation are large match-heavy methods
// - cast_precision_loss: i64-to-f64 casts are acceptable for averages and validator bounds
// - result_large_err: RelataError is the framework error type and is used consistently
// - format_push_string: format! with push_str is clearer than write! for SQL generation
// - doc_markdown: backtick requirements for documentation items are too strict
// - needless_pass_by_value: builder signatures take owned values for chaining
// - return_self_not_must_use: builder pattern methods are self-documenting
// - use_self: explicit type names are clearer in some contexts
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::result_large_err)]
#![allow(clippy::format_push_string)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::use_self)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::unnecessary_literal_bound)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_char_pattern)]
// literal_string_with_formatting_args: SQL templates using {column} are intentional
#![allow(clippy::literal_string_with_formatting_args)]
// significant_drop_tightening: false positives with parking_lot guards held across matches
#![allow(clippy::significant_drop_tightening)]

pub mod executor;
pub mod fields;
pub mod instance;
pub mod lifecycle;
pub mod query;
pub mod related;
pub mod schema;
pub mod signals;
pub mod transactions;
pub mod validators;
pub mod value;

// Re-export the most commonly used types at the crate root.
pub use executor::DbExecutor;
pub use fields::{FieldDef, FieldType};
pub use instance::{Arg, Instance, InstanceState};
pub use query::{
    AggregateResult, BulkCreateOptions, BulkUpdateOptions, DatabaseBackendType, LookupKind,
    Manager, QuerySet, Row, SqlCompiler, Subscript, Q,
};
pub use related::RelationManager;
pub use schema::{
    Constraint, ForeignKey, ManyToMany, ModelDefinition, ModelRegistry, ModelRegistryBuilder,
    ModelSchema, RelationKind,
};
pub use signals::SignalArgs;
pub use transactions::{atomic, TransactionManager};
pub use validators::Validator;
pub use value::Value;
