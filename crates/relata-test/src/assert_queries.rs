//! Query counting assertions for database tests.
//!
//! Provides [`assert_num_queries`] which counts the number of SQL statements
//! executed during an async closure and asserts that the count matches an
//! expected value. This is essential for detecting N+1 query problems.
//! [`CaptureQueries`] records the statements themselves.
//!
//! ## Example
//!
//! ```rust,no_run
//! use relata_db::value::Value;
//! use relata_db::DbExecutor;
//! use relata_test::assert_queries::assert_num_queries;
//! use relata_test::test_database::TestDatabase;
//!
//! async fn example() {
//!     let db = TestDatabase::new().unwrap();
//!     db.execute_raw("CREATE TABLE t (id INTEGER PRIMARY KEY, val TEXT)")
//!         .await
//!         .unwrap();
//!
//!     assert_num_queries(&db, 1, || async {
//!         db.execute("INSERT INTO t (val) VALUES (?)", &[Value::from("x")])
//!             .await
//!             .unwrap();
//!     })
//!     .await;
//! }
//! ```

use std::future::Future;

use crate::test_database::TestDatabase;

/// Asserts that exactly `expected_count` SQL statements are executed during
/// the async closure.
///
/// Resets the query counter on the [`TestDatabase`] before executing the
/// closure, then checks the counter after execution.
///
/// # Panics
///
/// Panics if the number of statements does not match `expected_count`.
pub async fn assert_num_queries<F, Fut>(db: &TestDatabase, expected_count: usize, f: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    db.reset_query_count();
    f().await;
    let actual = db.query_count();
    assert_eq!(
        actual, expected_count,
        "Expected {expected_count} SQL queries, but {actual} were executed"
    );
}

/// Asserts that at most `max_count` SQL statements are executed during the
/// async closure.
///
/// # Panics
///
/// Panics if more than `max_count` statements are executed.
pub async fn assert_max_queries<F, Fut>(db: &TestDatabase, max_count: usize, f: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    db.reset_query_count();
    f().await;
    let actual = db.query_count();
    assert!(
        actual <= max_count,
        "Expected at most {max_count} SQL queries, but {actual} were executed"
    );
}

/// Records the SQL of every statement run while it is alive.
///
/// ```rust,no_run
/// # use relata_test::{CaptureQueries, TestDatabase};
/// # use relata_db::DbExecutor;
/// # async fn example(db: &TestDatabase) {
/// let capture = CaptureQueries::start(db);
/// db.fetch_all("SELECT 1", &[]).await.unwrap();
/// assert_eq!(capture.finish(), vec!["SELECT 1".to_string()]);
/// # }
/// ```
pub struct CaptureQueries<'a> {
    db: &'a TestDatabase,
    finished: bool,
}

impl<'a> CaptureQueries<'a> {
    /// Starts recording on `db`, discarding any earlier capture.
    pub fn start(db: &'a TestDatabase) -> Self {
        db.start_capture();
        Self { db, finished: false }
    }

    /// Stops recording and returns the statements in execution order.
    pub fn finish(mut self) -> Vec<String> {
        self.finished = true;
        self.db.stop_capture()
    }
}

impl Drop for CaptureQueries<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.db.stop_capture();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relata_db::value::Value;
    use relata_db::DbExecutor;

    #[tokio::test]
    async fn test_assert_num_queries_passes() {
        let db = TestDatabase::new().unwrap();
        db.execute_raw("CREATE TABLE nq (id INTEGER PRIMARY KEY, val TEXT)")
            .await
            .unwrap();

        assert_num_queries(&db, 2, || async {
            db.execute("INSERT INTO nq (val) VALUES (?)", &[Value::from("a")])
                .await
                .unwrap();
            db.execute("INSERT INTO nq (val) VALUES (?)", &[Value::from("b")])
                .await
                .unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn test_assert_num_queries_zero() {
        let db = TestDatabase::new().unwrap();
        assert_num_queries(&db, 0, || async {}).await;
    }

    #[tokio::test]
    #[should_panic(expected = "Expected 1 SQL queries, but 2 were executed")]
    async fn test_assert_num_queries_fails_too_many() {
        let db = TestDatabase::new().unwrap();
        db.execute_raw("CREATE TABLE nqf (id INTEGER PRIMARY KEY, val TEXT)")
            .await
            .unwrap();

        assert_num_queries(&db, 1, || async {
            db.execute("INSERT INTO nqf (val) VALUES (?)", &[Value::from("a")])
                .await
                .unwrap();
            db.execute("INSERT INTO nqf (val) VALUES (?)", &[Value::from("b")])
                .await
                .unwrap();
        })
        .await;
    }

    #[tokio::test]
    #[should_panic(expected = "Expected at most 1 SQL queries, but 2 were executed")]
    async fn test_assert_max_queries_fails() {
        let db = TestDatabase::new().unwrap();
        db.execute_raw("CREATE TABLE mqf (id INTEGER PRIMARY KEY, val TEXT)")
            .await
            .unwrap();

        assert_max_queries(&db, 1, || async {
            db.execute("INSERT INTO mqf (val) VALUES (?)", &[Value::from("a")])
                .await
                .unwrap();
            db.execute("INSERT INTO mqf (val) VALUES (?)", &[Value::from("b")])
                .await
                .unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn test_capture_queries_records_in_order() {
        let db = TestDatabase::new().unwrap();
        db.execute_raw("CREATE TABLE cq (id INTEGER PRIMARY KEY)").await.unwrap();

        let capture = CaptureQueries::start(&db);
        db.execute("INSERT INTO cq (id) VALUES (?)", &[Value::from(1)]).await.unwrap();
        db.fetch_all("SELECT id FROM cq", &[]).await.unwrap();
        let queries = capture.finish();
        assert_eq!(
            queries,
            vec!["INSERT INTO cq (id) VALUES (?)".to_string(), "SELECT id FROM cq".to_string()]
        );

        // Nothing is recorded once the capture is finished.
        db.fetch_all("SELECT id FROM cq", &[]).await.unwrap();
        assert!(CaptureQueries::start(&db).finish().is_empty());
    }
}
