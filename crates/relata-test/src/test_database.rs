//! Test database utilities for relata.
//!
//! Provides [`TestDatabase`], an in-memory SQLite database wrapper for use in
//! tests. It implements [`DbExecutor`] so it can be used with all ORM
//! operations, and adds helper methods for creating tables from a built
//! [`ModelRegistry`] and counting executed statements.
//!
//! ## Example
//!
//! ```rust,no_run
//! use relata_core::Settings;
//! use relata_db::fields::FieldDef;
//! use relata_db::schema::{ModelDefinition, ModelRegistryBuilder};
//! use relata_test::test_database::TestDatabase;
//!
//! async fn example() {
//!     let registry = ModelRegistryBuilder::new(&Settings::default())
//!         .register(ModelDefinition::new("Tag").field(FieldDef::integer("id").primary_key().autoincrement()))
//!         .build()
//!         .unwrap();
//!     let db = TestDatabase::new().unwrap();
//!     db.create_tables(&registry).await.unwrap();
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use relata_core::RelataResult;
use relata_db::query::compiler::{DatabaseBackendType, Row};
use relata_db::schema::{ModelRegistry, ModelSchema};
use relata_db::value::Value;
use relata_db::DbExecutor;
use relata_db_backends::SqliteBackend;

/// An in-memory SQLite database for testing.
///
/// Wraps a [`SqliteBackend`] with an `Arc` for thread-safe sharing and adds a
/// statement counter for use with
/// [`assert_num_queries`](crate::assert_queries::assert_num_queries).
///
/// Each `TestDatabase::new()` call creates a fresh database, providing
/// complete test isolation. Clones share the same database and counter.
#[derive(Clone)]
pub struct TestDatabase {
    backend: Arc<SqliteBackend>,
    query_count: Arc<AtomicUsize>,
    captured: Arc<Mutex<Option<Vec<String>>>>,
}

impl TestDatabase {
    /// Creates a new in-memory SQLite test database.
    pub fn new() -> RelataResult<Self> {
        Ok(Self {
            backend: Arc::new(SqliteBackend::memory()?),
            query_count: Arc::new(AtomicUsize::new(0)),
            captured: Arc::new(Mutex::new(None)),
        })
    }

    /// Creates a table for every concrete model in `registry`, including
    /// synthesized association models.
    ///
    /// Statements issued here are not counted.
    pub async fn create_tables(&self, registry: &ModelRegistry) -> RelataResult<()> {
        for schema in registry.models() {
            if schema.is_abstract() {
                continue;
            }
            for sql in Self::create_table_sql(&schema)? {
                self.backend.execute(&sql, &[]).await?;
            }
        }
        Ok(())
    }

    /// Executes a raw SQL string with no parameters.
    ///
    /// Increments the query counter.
    pub async fn execute_raw(&self, sql: &str) -> RelataResult<u64> {
        self.record(sql);
        self.backend.execute(sql, &[]).await
    }

    /// Returns the current query count.
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::Relaxed)
    }

    /// Resets the query counter to zero.
    pub fn reset_query_count(&self) {
        self.query_count.store(0, Ordering::Relaxed);
    }

    /// Returns a reference to the inner `SqliteBackend`.
    pub fn backend(&self) -> &SqliteBackend {
        &self.backend
    }

    pub(crate) fn start_capture(&self) {
        *self.captured.lock() = Some(Vec::new());
    }

    pub(crate) fn stop_capture(&self) -> Vec<String> {
        self.captured.lock().take().unwrap_or_default()
    }

    fn record(&self, sql: &str) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        if let Some(captured) = self.captured.lock().as_mut() {
            captured.push(sql.to_string());
        }
    }

    /// Generates `CREATE TABLE IF NOT EXISTS` plus index statements for one
    /// schema.
    ///
    /// Foreign keys are plain columns; no `REFERENCES` clause is emitted, so
    /// rows may be created in any order.
    pub fn create_table_sql(schema: &ModelSchema) -> RelataResult<Vec<String>> {
        let table = schema.table();
        let single_auto_pk = !schema.has_composite_pk()
            && schema
                .fields()
                .iter()
                .any(|f| f.primary_key && f.autoincrement);
        let mut col_defs: Vec<String> = Vec::new();

        for field in schema.fields() {
            let mut parts = vec![format!("\"{}\" {}", field.column, field.field_type.sqlite_type())];
            if field.primary_key && single_auto_pk {
                parts.push("PRIMARY KEY AUTOINCREMENT".to_string());
            } else if !field.nullable || field.primary_key {
                parts.push("NOT NULL".to_string());
            }
            if field.unique && !field.primary_key {
                parts.push("UNIQUE".to_string());
            }
            col_defs.push(parts.join(" "));
        }

        if !single_auto_pk {
            let pk = quote_all(&schema.pk_columns()?);
            col_defs.push(format!("PRIMARY KEY ({pk})"));
        }
        for fields in schema.unique_together() {
            col_defs.push(format!("UNIQUE ({})", quote_all(&columns_of(schema, fields)?)));
        }

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" ({})",
            col_defs.join(", ")
        )];
        let indexed = schema
            .fields()
            .iter()
            .filter(|f| f.index && !f.unique && !f.primary_key)
            .map(|f| vec![f.name.clone()])
            .chain(schema.indexes().iter().cloned());
        for (i, fields) in indexed.enumerate() {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS \"{table}_idx_{i}\" ON \"{table}\" ({})",
                quote_all(&columns_of(schema, &fields)?)
            ));
        }
        Ok(statements)
    }
}

fn columns_of(schema: &ModelSchema, fields: &[String]) -> RelataResult<Vec<String>> {
    fields
        .iter()
        .map(|f| schema.column(f).map(ToString::to_string))
        .collect()
}

fn quote_all(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait::async_trait]
impl DbExecutor for TestDatabase {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> RelataResult<u64> {
        self.record(sql);
        self.backend.execute(sql, params).await
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> RelataResult<Vec<Row>> {
        self.record(sql);
        self.backend.fetch_all(sql, params).await
    }
}
