//! Query building, compilation, and execution.
//!
//! This module contains the complete query pipeline:
//!
//! - [`lookups`] - Q trees and lookup kinds for filtering
//! - [`compiler`] - Query AST and SQL compilation
//! - [`queryset`] - QuerySet and Manager for lazy query building
//! - [`bulk`] - Bulk create, bulk update, get_or_create, update_or_create
//!
//! Joined and prefetched rows are turned into instance graphs by a private
//! loader that deduplicates roots and shares repeated related rows.

pub mod bulk;
pub mod compiler;
pub(crate) mod loader;
pub mod lookups;
pub mod queryset;

pub use bulk::{BulkCreateOptions, BulkUpdateOptions};
pub use compiler::{
    escape_like, AggregateFunc, DatabaseBackendType, OrderBy, Query, Row, SelectColumn,
    SqlCompiler, WhereNode,
};
pub use lookups::{LookupKind, Q};
pub use queryset::{AggregateResult, Manager, QuerySet, Subscript};
