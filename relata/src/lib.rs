//! # relata
//!
//! An async ORM built around an explicit schema graph.
//!
//! This is the meta-crate that re-exports all sub-crates for convenient access.
//! You can depend on `relata` to get the whole stack, or depend on individual
//! crates for finer-grained control.
//!
//! ```rust,no_run
//! use relata::prelude::*;
//!
//! # async fn example() -> RelataResult<()> {
//! // Defaults, then relata.toml, then RELATA_* environment variables.
//! let settings = settings_loader::from_toml_file_with_env("relata.toml")?;
//! setup_logging(&settings);
//!
//! let registry = ModelRegistryBuilder::new(&settings)
//!     .register(
//!         ModelDefinition::new("Author")
//!             .field(FieldDef::integer("id").primary_key().autoincrement())
//!             .field(FieldDef::string("name", 100)),
//!     )
//!     .register(
//!         ModelDefinition::new("Book")
//!             .field(FieldDef::integer("id").primary_key().autoincrement())
//!             .field(FieldDef::string("title", 200))
//!             .foreign_key(ForeignKey::new("author", "Author").related_name("books")),
//!     )
//!     .build()?;
//!
//! let db = SqliteBackend::from_settings(&settings)?;
//! let authors = registry.objects("Author")?;
//! let author = authors.create(&db, values! { "name" => "Ursula K. Le Guin" }).await?;
//!
//! let books = registry
//!     .objects("Book")?
//!     .filter(Q::kw("author__name__startswith", "Ursula"))
//!     .select_related(&["author"])
//!     .all(&db)
//!     .await?;
//! # let _ = (author, books);
//! # Ok(())
//! # }
//! ```

/// Error taxonomy, settings and logging setup.
pub use relata_core as core;

/// ORM: schema graph, QuerySet, instances, relation managers and signals.
pub use relata_db as db;

/// Async signal dispatcher.
pub use relata_signals as signals;

/// Database backends.
pub use relata_db_backends as db_backends;

/// Test database and query-count assertions.
#[cfg(feature = "testing")]
pub use relata_test as test;

pub use relata_db::values;

/// The names most applications need.
pub mod prelude {
    pub use relata_core::logging::setup_logging;
    pub use relata_core::settings_loader;
    pub use relata_core::{RelataError, RelataResult, Settings};
    pub use relata_db::fields::{FieldDef, FieldType};
    pub use relata_db::instance::{Arg, Instance, InstanceState};
    pub use relata_db::query::{
        AggregateResult, BulkCreateOptions, BulkUpdateOptions, LookupKind, Manager, QuerySet, Q,
    };
    pub use relata_db::related::RelationManager;
    pub use relata_db::schema::{
        Constraint, ForeignKey, ManyToMany, ModelDefinition, ModelRegistry, ModelRegistryBuilder,
    };
    pub use relata_db::signals::SignalArgs;
    pub use relata_db::transactions::atomic;
    pub use relata_db::value::Value;
    pub use relata_db::{values, DbExecutor};
    pub use relata_signals::SignalKind;

    #[cfg(feature = "sqlite")]
    pub use relata_db_backends::SqliteBackend;
}
