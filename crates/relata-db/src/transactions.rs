//! Transaction support.
//!
//! [`TransactionManager`] wraps a [`DbExecutor`] and tracks nesting depth,
//! savepoints and `on_commit` callbacks. [`atomic()`] is the usual entry
//! point: it runs a closure inside a transaction, committing on `Ok` and
//! rolling back on `Err`. Nested blocks on the same manager use savepoints.
//!
//! The ORM itself never opens transactions; it issues statements inside
//! whatever scope the caller established.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relata_core::{RelataError, RelataResult};
use tokio::sync::Mutex;

use crate::executor::DbExecutor;
use crate::query::compiler::{DatabaseBackendType, Row};
use crate::value::Value;

static SAVEPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_savepoint_name() -> String {
    format!("relata_sp_{}", SAVEPOINT_COUNTER.fetch_add(1, Ordering::Relaxed))
}

type OnCommitCallbacks = Vec<Box<dyn FnOnce() + Send + 'static>>;

/// Manages transaction state for one executor.
pub struct TransactionManager<'a> {
    db: &'a dyn DbExecutor,
    /// 0 = no transaction, 1 = outermost, 2+ = savepoint.
    depth: Mutex<u32>,
    savepoints: Mutex<Vec<String>>,
    on_commit_callbacks: Mutex<OnCommitCallbacks>,
}

impl<'a> TransactionManager<'a> {
    /// Creates a new transaction manager for the given executor.
    pub fn new(db: &'a dyn DbExecutor) -> Self {
        Self {
            db,
            depth: Mutex::new(0),
            savepoints: Mutex::new(Vec::new()),
            on_commit_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current nesting depth.
    pub async fn depth(&self) -> u32 {
        *self.depth.lock().await
    }

    /// Returns the underlying executor.
    pub fn executor(&self) -> &dyn DbExecutor {
        self.db
    }

    /// Begins a transaction, or creates a savepoint if one is already open.
    pub async fn begin(&self) -> RelataResult<()> {
        let mut depth = self.depth.lock().await;
        if *depth == 0 {
            self.db.begin().await?;
        } else {
            let name = next_savepoint_name();
            self.db.savepoint(&name).await?;
            self.savepoints.lock().await.push(name);
        }
        *depth += 1;
        tracing::trace!(depth = *depth, "transaction begin");
        Ok(())
    }

    /// Commits the transaction or releases the innermost savepoint.
    ///
    /// `on_commit` callbacks run after the outermost commit.
    pub async fn commit(&self) -> RelataResult<()> {
        let mut depth = self.depth.lock().await;
        match *depth {
            0 => {
                return Err(RelataError::Operational(
                    "cannot commit: not in a transaction".to_string(),
                ))
            }
            1 => {
                self.db.commit().await?;
                *depth = 0;
                let callbacks = std::mem::take(&mut *self.on_commit_callbacks.lock().await);
                for cb in callbacks {
                    cb();
                }
            }
            _ => {
                if let Some(name) = self.savepoints.lock().await.pop() {
                    self.db.release_savepoint(&name).await?;
                }
                *depth -= 1;
            }
        }
        Ok(())
    }

    /// Rolls back the transaction or the innermost savepoint.
    pub async fn rollback(&self) -> RelataResult<()> {
        let mut depth = self.depth.lock().await;
        match *depth {
            0 => {
                return Err(RelataError::Operational(
                    "cannot rollback: not in a transaction".to_string(),
                ))
            }
            1 => {
                self.db.rollback().await?;
                *depth = 0;
                self.on_commit_callbacks.lock().await.clear();
            }
            _ => {
                if let Some(name) = self.savepoints.lock().await.pop() {
                    self.db.rollback_to_savepoint(&name).await?;
                }
                *depth -= 1;
            }
        }
        Ok(())
    }

    /// Registers a callback to run after the outermost transaction commits.
    ///
    /// Outside a transaction the callback runs immediately; on rollback it is
    /// discarded.
    pub async fn on_commit<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let depth = self.depth.lock().await;
        if *depth == 0 {
            drop(depth);
            callback();
        } else {
            self.on_commit_callbacks.lock().await.push(Box::new(callback));
        }
    }

    /// Runs `f` inside a nested block: a savepoint when a transaction is
    /// already open, a new transaction otherwise.
    pub async fn atomic<F, Fut, T>(&self, f: F) -> RelataResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = RelataResult<T>>,
    {
        self.begin().await?;
        match f().await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

#[async_trait::async_trait]
impl DbExecutor for TransactionManager<'_> {
    fn backend_type(&self) -> DatabaseBackendType {
        self.db.backend_type()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> RelataResult<u64> {
        self.db.execute(sql, params).await
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> RelataResult<Vec<Row>> {
        self.db.fetch_all(sql, params).await
    }

    async fn fetch_one(&self, sql: &str, params: &[Value]) -> RelataResult<Row> {
        self.db.fetch_one(sql, params).await
    }

    async fn insert_returning(&self, sql: &str, params: &[Value]) -> RelataResult<Vec<Row>> {
        self.db.insert_returning(sql, params).await
    }
}

/// Executes a closure within a database transaction.
///
/// If the closure returns `Ok`, the transaction is committed. If it returns
/// `Err`, the transaction is rolled back and the error is returned.
///
/// ```ignore
/// use relata_db::transactions::atomic;
///
/// let book = atomic(&db, |txn| async move {
///     let book = registry.objects("Book")?.create(&*txn, values! { "title" => "Dune" }).await?;
///     Ok(book)
/// })
/// .await?;
/// ```
pub async fn atomic<'a, F, Fut, T>(db: &'a dyn DbExecutor, f: F) -> RelataResult<T>
where
    F: FnOnce(Arc<TransactionManager<'a>>) -> Fut,
    Fut: std::future::Future<Output = RelataResult<T>>,
{
    let txn = Arc::new(TransactionManager::new(db));
    txn.begin().await?;

    match f(Arc::clone(&txn)).await {
        Ok(result) => {
            txn.commit().await?;
            Ok(result)
        }
        Err(e) => {
            if let Err(rollback_err) = txn.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}
