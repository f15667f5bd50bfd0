//! SQLite database backend using `rusqlite`.
//!
//! This module provides the [`SqliteBackend`] which implements the
//! [`DbExecutor`] trait using `rusqlite` wrapped in
//! `tokio::task::spawn_blocking` for async compatibility.
//!
//! Features:
//! - WAL mode enabled for file-based databases
//! - In-memory database support via `:memory:` path (great for testing)
//! - Simple `Mutex`-based concurrency control
//! - `INSERT ... RETURNING` through the bundled SQLite (3.35+)

use std::path::PathBuf;
use std::sync::Arc;

use relata_core::{RelataError, RelataResult, Settings};
use relata_db::query::compiler::{DatabaseBackendType, Row};
use relata_db::value::Value;
use relata_db::DbExecutor;
use rusqlite::types::{Null, ValueRef};
use rusqlite::ErrorCode;
use tokio::sync::Mutex;

/// A SQLite database backend.
///
/// Uses `rusqlite` for database access with a `Mutex`-based concurrency
/// model. All operations are run via `tokio::task::spawn_blocking` to
/// avoid blocking the async runtime. Statements issued through one backend
/// share a single connection, so `BEGIN`/`COMMIT` issued as separate calls
/// scope a transaction.
pub struct SqliteBackend {
    /// The path to the database file (or ":memory:").
    path: PathBuf,
    /// The connection, guarded by an async mutex.
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteBackend {
    /// Opens a new SQLite database at the given path.
    ///
    /// If the path is `:memory:`, an in-memory database is created.
    /// WAL journal mode is enabled for file-based databases; foreign key
    /// enforcement is always on.
    pub fn open(path: impl Into<PathBuf>) -> RelataResult<Self> {
        let path = path.into();
        let memory = path.to_str() == Some(":memory:");
        let conn = if memory {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(&path)
        }
        .map_err(|e| RelataError::Operational(format!("SQLite open failed: {e}")))?;

        let pragmas = if memory {
            "PRAGMA foreign_keys=ON;"
        } else {
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;"
        };
        conn.execute_batch(pragmas)
            .map_err(|e| RelataError::Operational(format!("Failed to set pragmas: {e}")))?;

        tracing::info!(path = %path.display(), "opened sqlite database");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens the default database named in `settings`.
    ///
    /// Fails with [`RelataError::Configuration`] when the default alias is
    /// missing or names a non-SQLite engine.
    pub fn from_settings(settings: &Settings) -> RelataResult<Self> {
        let alias = &settings.default_database;
        let database = settings.databases.get(alias).ok_or_else(|| {
            RelataError::Configuration(format!("no database configured for alias '{alias}'"))
        })?;
        if !database.engine.ends_with("sqlite") && !database.engine.ends_with("sqlite3") {
            return Err(RelataError::Configuration(format!(
                "database '{alias}' uses engine '{}', not SQLite",
                database.engine
            )));
        }
        Self::open(&database.name)
    }

    /// Opens an in-memory database (convenience constructor).
    pub fn memory() -> RelataResult<Self> {
        Self::open(":memory:")
    }

    /// Returns the database file path.
    pub const fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Binds ORM `Value` types to a `rusqlite` statement.
    fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> RelataResult<()> {
        for (i, param) in params.iter().enumerate() {
            let idx = i + 1;
            match param {
                Value::Null => stmt.raw_bind_parameter(idx, Null),
                Value::Bool(b) => stmt.raw_bind_parameter(idx, b),
                Value::Int(v) => stmt.raw_bind_parameter(idx, v),
                Value::Float(v) => stmt.raw_bind_parameter(idx, v),
                Value::Decimal(d) => stmt.raw_bind_parameter(idx, d.to_string()),
                Value::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
                Value::Bytes(b) => stmt.raw_bind_parameter(idx, b.as_slice()),
                Value::Date(d) => stmt.raw_bind_parameter(idx, d.to_string()),
                Value::DateTime(dt) => stmt.raw_bind_parameter(idx, dt.to_string()),
                Value::DateTimeTz(dt) => stmt.raw_bind_parameter(idx, dt.to_rfc3339()),
                Value::Time(t) => stmt.raw_bind_parameter(idx, t.to_string()),
                Value::Uuid(u) => stmt.raw_bind_parameter(idx, u.to_string()),
                Value::Json(j) => stmt.raw_bind_parameter(idx, j.to_string()),
                Value::List(_) => {
                    return Err(RelataError::Database(format!(
                        "parameter {idx} is a list; lists must be expanded into placeholders"
                    )))
                }
            }
            .map_err(|e| RelataError::Database(format!("Bind error: {e}")))?;
        }
        Ok(())
    }

    /// Converts a `rusqlite::Row` to our generic `Row`.
    fn convert_row(sqlite_row: &rusqlite::Row<'_>, column_names: &[String]) -> Row {
        let values: Vec<Value> = (0..column_names.len())
            .map(|i| match sqlite_row.get_ref(i).unwrap_or(ValueRef::Null) {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => Value::Int(v),
                ValueRef::Real(v) => Value::Float(v),
                ValueRef::Text(b) => Value::String(String::from_utf8_lossy(b).to_string()),
                ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
            })
            .collect();

        Row::new(column_names.to_vec(), values)
    }

    fn run_query(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> RelataResult<Vec<Row>> {
        let mut stmt = conn.prepare(sql).map_err(map_error)?;
        let column_names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        Self::bind_params(&mut stmt, params)?;

        let mut raw_rows = stmt.raw_query();
        let mut rows = Vec::new();
        while let Some(row) = raw_rows.next().map_err(map_error)? {
            rows.push(Self::convert_row(row, &column_names));
        }
        Ok(rows)
    }
}

/// Maps driver errors onto the error taxonomy; constraint violations become
/// [`RelataError::Integrity`].
fn map_error(e: rusqlite::Error) -> RelataError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            RelataError::Integrity(e.to_string())
        }
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            RelataError::Operational(e.to_string())
        }
        _ => RelataError::Database(e.to_string()),
    }
}

fn join_error(e: tokio::task::JoinError) -> RelataError {
    RelataError::Database(format!("Task join error: {e}"))
}

#[async_trait::async_trait]
impl DbExecutor for SqliteBackend {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> RelataResult<u64> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let params = params.to_vec();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(&sql).map_err(map_error)?;
            Self::bind_params(&mut stmt, &params)?;
            let count = stmt.raw_execute().map_err(map_error)?;
            Ok(count as u64)
        })
        .await
        .map_err(join_error)?
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> RelataResult<Vec<Row>> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let params = params.to_vec();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            Self::run_query(&conn, &sql, &params)
        })
        .await
        .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_memory_open() {
        let backend = SqliteBackend::memory().unwrap();
        assert_eq!(backend.backend_type(), DatabaseBackendType::SQLite);
        assert_eq!(backend.path(), &PathBuf::from(":memory:"));
    }

    #[test]
    fn test_from_settings() {
        let settings = relata_core::settings_loader::from_toml_str(
            r#"
            [databases.default]
            engine = "relata.backends.sqlite"
            name = ":memory:"
            options = {}
            "#,
        )
        .unwrap();
        let backend = SqliteBackend::from_settings(&settings).unwrap();
        assert_eq!(backend.path(), &PathBuf::from(":memory:"));

        let other = relata_core::settings_loader::from_toml_str(
            r#"
            default_database = "replica"
            "#,
        )
        .unwrap();
        assert!(matches!(
            SqliteBackend::from_settings(&other),
            Err(RelataError::Configuration(_))
        ));

        let postgres = relata_core::settings_loader::from_json_str(
            r#"{"databases": {"default": {"engine": "relata.backends.postgres", "name": "app", "options": {}}}}"#,
        )
        .unwrap();
        assert!(matches!(
            SqliteBackend::from_settings(&postgres),
            Err(RelataError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_sqlite_insert_and_query() {
        let backend = SqliteBackend::memory().unwrap();
        backend
            .execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)", &[])
            .await
            .unwrap();

        backend
            .execute(
                "INSERT INTO users (name, age) VALUES (?, ?)",
                &[Value::from("Alice"), Value::from(30)],
            )
            .await
            .unwrap();

        let rows = backend.fetch_all("SELECT id, name, age FROM users", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<String>("name").unwrap(), "Alice");
        assert_eq!(rows[0].get::<i64>("age").unwrap(), 30);
    }

    #[tokio::test]
    async fn test_sqlite_fetch_one_not_found() {
        let backend = SqliteBackend::memory().unwrap();
        backend.execute("CREATE TABLE test (id INTEGER PRIMARY KEY)", &[]).await.unwrap();

        let result = backend
            .fetch_one("SELECT id FROM test WHERE id = ?", &[Value::from(999)])
            .await;
        assert!(matches!(result, Err(RelataError::NoMatch(_))));
    }

    #[tokio::test]
    async fn test_sqlite_insert_returning_keeps_order() {
        let backend = SqliteBackend::memory().unwrap();
        backend
            .execute("CREATE TABLE tags (id INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT)", &[])
            .await
            .unwrap();

        let rows = backend
            .insert_returning(
                "INSERT INTO tags (label) VALUES (?), (?), (?) RETURNING id",
                &[Value::from("a"), Value::from("b"), Value::from("c")],
            )
            .await
            .unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.get("id").unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_sqlite_null_handling() {
        let backend = SqliteBackend::memory().unwrap();
        backend
            .execute("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT, bio TEXT)", &[])
            .await
            .unwrap();
        backend
            .execute(
                "INSERT INTO test (name, bio) VALUES (?, ?)",
                &[Value::from("Alice"), Value::Null],
            )
            .await
            .unwrap();

        let row = backend
            .fetch_one("SELECT name, bio FROM test WHERE id = ?", &[Value::from(1)])
            .await
            .unwrap();
        let bio: Option<String> = row.get("bio").unwrap();
        assert_eq!(bio, None);
    }

    #[tokio::test]
    async fn test_sqlite_blob_handling() {
        let backend = SqliteBackend::memory().unwrap();
        backend
            .execute("CREATE TABLE test (id INTEGER PRIMARY KEY, data BLOB)", &[])
            .await
            .unwrap();

        let blob = vec![0xDE_u8, 0xAD, 0xBE, 0xEF];
        backend
            .execute("INSERT INTO test (data) VALUES (?)", &[Value::Bytes(blob.clone())])
            .await
            .unwrap();

        let rows = backend.fetch_all("SELECT data FROM test", &[]).await.unwrap();
        assert_eq!(rows[0].get_value("data"), Some(&Value::Bytes(blob)));
    }

    #[tokio::test]
    async fn test_sqlite_unique_violation_is_integrity_error() {
        let backend = SqliteBackend::memory().unwrap();
        backend
            .execute("CREATE TABLE test (id INTEGER PRIMARY KEY, code TEXT UNIQUE)", &[])
            .await
            .unwrap();
        backend
            .execute("INSERT INTO test (code) VALUES (?)", &[Value::from("x")])
            .await
            .unwrap();

        let result = backend
            .execute("INSERT INTO test (code) VALUES (?)", &[Value::from("x")])
            .await;
        assert!(matches!(result, Err(RelataError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_sqlite_list_parameter_is_rejected() {
        let backend = SqliteBackend::memory().unwrap();
        let result = backend
            .fetch_all("SELECT ?", &[Value::List(vec![Value::Int(1)])])
            .await;
        assert!(matches!(result, Err(RelataError::Database(_))));
    }

    #[tokio::test]
    async fn test_sqlite_transaction_rollback() {
        let backend = SqliteBackend::memory().unwrap();
        backend.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[]).await.unwrap();

        backend.begin().await.unwrap();
        backend.execute("INSERT INTO t (id) VALUES (?)", &[Value::from(1)]).await.unwrap();
        backend.rollback().await.unwrap();

        let rows = backend.fetch_all("SELECT id FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_datetime_tz_round_trips_as_text() {
        let backend = SqliteBackend::memory().unwrap();
        let row = backend
            .fetch_one(
                "SELECT ? AS stamp",
                &[Value::DateTimeTz(chrono::DateTime::UNIX_EPOCH)],
            )
            .await
            .unwrap();
        assert_eq!(row.get::<String>("stamp").unwrap(), "1970-01-01T00:00:00+00:00");
    }
}
