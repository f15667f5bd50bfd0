//! # relata-db-backends
//!
//! Database backend implementations for relata. Each backend implements
//! [`DbExecutor`](relata_db::DbExecutor) so that querysets, instances and
//! relation managers can run against it.
//!
//! Supported backends:
//! - `SQLite` (feature `sqlite`, enabled by default; the driver is bundled)

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
