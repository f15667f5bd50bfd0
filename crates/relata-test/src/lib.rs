//! # relata-test
//!
//! Testing utilities for relata: an in-memory SQLite [`TestDatabase`] that
//! counts the statements it runs, DDL generation from a built model
//! registry, and assertions that pin the number of queries an operation
//! issues.
//!
//! ## Modules
//!
//! - [`test_database`] - [`TestDatabase`] and `CREATE TABLE` generation
//! - [`assert_queries`] - [`assert_num_queries`], [`assert_max_queries`] and
//!   [`CaptureQueries`]

pub mod assert_queries;
pub mod test_database;

pub use assert_queries::{assert_max_queries, assert_num_queries, CaptureQueries};
pub use test_database::TestDatabase;
