//! # relata-core
//!
//! Core types shared by every relata crate. This crate has no ORM
//! dependencies and provides the foundation for the others.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy and result alias
//! - [`settings`] - Database aliases and query tuning knobs
//! - [`settings_loader`] - TOML/JSON loading with environment overrides
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{RelataError, RelataResult, ValidationError};
pub use settings::{DatabaseSettings, Settings, SETTINGS};
