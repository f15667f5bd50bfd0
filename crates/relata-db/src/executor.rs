//! Database executor trait.
//!
//! [`DbExecutor`] is the minimal async interface the ORM needs from a storage
//! driver. QuerySet terminal methods, instance lifecycle operations and
//! relation managers all accept `&dyn DbExecutor`, which backends implement.
//!
//! The trait lives in this crate so that execution can be defined without a
//! dependency on any concrete driver; `relata-db-backends` provides the
//! SQLite implementation.

use relata_core::{RelataError, RelataResult};

use crate::query::compiler::{DatabaseBackendType, Row};
use crate::value::Value;

/// Minimal async database executor.
///
/// Placeholders in `sql` follow [`backend_type`](Self::backend_type): `?` for
/// SQLite, `$n` for PostgreSQL.
#[async_trait::async_trait]
pub trait DbExecutor: Send + Sync {
    /// Returns the backend type for SQL compilation.
    fn backend_type(&self) -> DatabaseBackendType;

    /// Runs a statement that does not return rows and returns the number of
    /// rows affected.
    async fn execute(&self, sql: &str, params: &[Value]) -> RelataResult<u64>;

    /// Runs a query and returns all result rows.
    async fn fetch_all(&self, sql: &str, params: &[Value]) -> RelataResult<Vec<Row>>;

    /// Runs a query and returns its first row.
    ///
    /// Returns [`RelataError::NoMatch`] when the query yields nothing.
    async fn fetch_one(&self, sql: &str, params: &[Value]) -> RelataResult<Row> {
        self.fetch_all(sql, params)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RelataError::NoMatch("query returned no rows".to_string()))
    }

    /// Runs an `INSERT ... RETURNING` statement and returns one row per
    /// inserted record, in insertion order.
    async fn insert_returning(&self, sql: &str, params: &[Value]) -> RelataResult<Vec<Row>> {
        self.fetch_all(sql, params).await
    }

    /// Starts a transaction.
    async fn begin(&self) -> RelataResult<()> {
        self.execute("BEGIN", &[]).await.map(|_| ())
    }

    /// Commits the current transaction.
    async fn commit(&self) -> RelataResult<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    /// Rolls back the current transaction.
    async fn rollback(&self) -> RelataResult<()> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }

    /// Creates a savepoint.
    async fn savepoint(&self, name: &str) -> RelataResult<()> {
        self.execute(&format!("SAVEPOINT {name}"), &[]).await.map(|_| ())
    }

    /// Releases a savepoint.
    async fn release_savepoint(&self, name: &str) -> RelataResult<()> {
        self.execute(&format!("RELEASE SAVEPOINT {name}"), &[])
            .await
            .map(|_| ())
    }

    /// Rolls back to a savepoint.
    async fn rollback_to_savepoint(&self, name: &str) -> RelataResult<()> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
            .await
            .map(|_| ())
    }
}

/// Logs and runs a statement that returns no rows.
pub(crate) async fn run_execute(db: &dyn DbExecutor, sql: &str, params: &[Value]) -> RelataResult<u64> {
    tracing::debug!(target: "relata::sql", sql, params = params.len(), "execute");
    db.execute(sql, params).await
}

/// Logs and runs a query.
pub(crate) async fn run_fetch_all(
    db: &dyn DbExecutor,
    sql: &str,
    params: &[Value],
) -> RelataResult<Vec<Row>> {
    tracing::debug!(target: "relata::sql", sql, params = params.len(), "fetch_all");
    db.fetch_all(sql, params).await
}

/// Logs and runs an insert with a RETURNING clause.
pub(crate) async fn run_insert_returning(
    db: &dyn DbExecutor,
    sql: &str,
    params: &[Value],
) -> RelataResult<Vec<Row>> {
    tracing::debug!(target: "relata::sql", sql, params = params.len(), "insert_returning");
    db.insert_returning(sql, params).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        statements: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl DbExecutor for Recorder {
        fn backend_type(&self) -> DatabaseBackendType {
            DatabaseBackendType::SQLite
        }

        async fn execute(&self, sql: &str, _params: &[Value]) -> RelataResult<u64> {
            self.statements.lock().push(sql.to_string());
            Ok(0)
        }

        async fn fetch_all(&self, sql: &str, _params: &[Value]) -> RelataResult<Vec<Row>> {
            self.statements.lock().push(sql.to_string());
            Ok(vec![])
        }
    }

    fn _assert_object_safe(_: &dyn DbExecutor) {}

    #[tokio::test]
    async fn test_fetch_one_on_empty_is_no_match() {
        let db = Recorder {
            statements: Mutex::new(Vec::new()),
        };
        let err = db.fetch_one("SELECT 1", &[]).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_default_transaction_statements() {
        let db = Recorder {
            statements: Mutex::new(Vec::new()),
        };
        db.begin().await.unwrap();
        db.savepoint("sp_1").await.unwrap();
        db.rollback_to_savepoint("sp_1").await.unwrap();
        db.commit().await.unwrap();
        assert_eq!(
            *db.statements.lock(),
            vec!["BEGIN", "SAVEPOINT sp_1", "ROLLBACK TO SAVEPOINT sp_1", "COMMIT"]
        );
    }
}
