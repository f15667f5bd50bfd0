//! Error taxonomy shared by every relata crate.
//!
//! [`RelataError`] groups the failures raised while declaring models,
//! building queries, persisting instances and dispatching signals. Field
//! coercion failures travel as [`ValidationError`] and are surfaced unwrapped
//! through [`RelataError::Validation`].

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// A validation failure produced by a field coercer or validator.
///
/// Validation errors are either simple (a message and a code) or compound,
/// carrying per-field error lists.
///
/// # Examples
///
/// ```
/// use relata_core::error::ValidationError;
///
/// let err = ValidationError::new("Ensure this value has at most 10 characters.", "max_length")
///     .with_param("limit", "10");
/// assert_eq!(err.code, "max_length");
///
/// let compound = ValidationError::for_field("title", err);
/// assert!(compound.to_string().starts_with("title:"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The primary error message.
    pub message: String,
    /// A short code identifying the failure (e.g. "required", "invalid").
    pub code: String,
    /// Additional parameters giving context for the message.
    pub params: BTreeMap<String, String>,
    /// Per-field validation errors, keyed by field name.
    pub field_errors: BTreeMap<String, Vec<Self>>,
}

impl ValidationError {
    /// Creates a new `ValidationError` with a message and code.
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            params: BTreeMap::new(),
            field_errors: BTreeMap::new(),
        }
    }

    /// Creates a compound error from per-field error lists.
    pub fn with_field_errors(field_errors: BTreeMap<String, Vec<Self>>) -> Self {
        Self {
            message: String::new(),
            code: String::new(),
            params: BTreeMap::new(),
            field_errors,
        }
    }

    /// Wraps a single error under the given field name.
    pub fn for_field(field: impl Into<String>, error: Self) -> Self {
        let mut field_errors = BTreeMap::new();
        field_errors.insert(field.into(), vec![error]);
        Self::with_field_errors(field_errors)
    }

    /// Adds a parameter to this validation error.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Merges the field errors of `other` into `self`.
    pub fn merge(&mut self, other: Self) {
        for (field, errors) in other.field_errors {
            self.field_errors.entry(field).or_default().extend(errors);
        }
    }

    /// Returns `true` if neither a message nor field errors are present.
    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.field_errors.is_empty()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.message.is_empty() {
            write!(f, "{}", self.message)?;
        } else if !self.field_errors.is_empty() {
            let mut first = true;
            for (field, errors) in &self.field_errors {
                for error in errors {
                    if !first {
                        write!(f, "; ")?;
                    }
                    write!(f, "{field}: {error}")?;
                    first = false;
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// The primary error type for relata.
///
/// The first group of variants is raised by the ORM core itself. The second
/// group covers collaborators: field coercion, the storage driver and the
/// configuration loader.
#[derive(Error, Debug)]
pub enum RelataError {
    // ── Model declaration ────────────────────────────────────────────

    /// A model declaration is invalid (missing or duplicate primary key,
    /// incompatible field redefinition, unknown relation target, ...).
    #[error("Definition error: {0}")]
    Definition(String),

    /// An instance was constructed or accessed incorrectly.
    #[error("Model error: {0}")]
    Model(String),

    /// A relation field received a value of the wrong model or was used
    /// before its owner was persisted.
    #[error("Relationship instance error: {0}")]
    RelationshipInstance(String),

    /// An instance cannot be persisted in its current state.
    #[error("Model persistence error: {0}")]
    ModelPersistence(String),

    // ── Queries ──────────────────────────────────────────────────────

    /// A query was assembled with invalid arguments.
    #[error("Query definition error: {0}")]
    QueryDefinition(String),

    /// A single-row query matched no rows.
    #[error("No match: {0}")]
    NoMatch(String),

    /// A single-row query matched more than one row.
    #[error("Multiple matches: {0}")]
    MultipleMatches(String),

    // ── Signals ──────────────────────────────────────────────────────

    /// A signal receiver could not be registered.
    #[error("Signal definition error: {0}")]
    SignalDefinition(String),

    // ── Collaborators ────────────────────────────────────────────────

    /// A value failed field coercion or validation.
    #[error("Validation error: {0}")]
    Validation(ValidationError),

    /// An argument has the right type but an unacceptable value.
    #[error("Value error: {0}")]
    Value(String),

    /// An argument has an unsupported type or shape.
    #[error("Type error: {0}")]
    Type(String),

    /// A generic storage error.
    #[error("Database error: {0}")]
    Database(String),

    /// A storage integrity constraint was violated.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The storage backend could not be reached or opened.
    #[error("Operational error: {0}")]
    Operational(String),

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A value could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelataError {
    /// Returns a stable short name for the error kind, used in log fields.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Definition(_) => "definition",
            Self::Model(_) => "model",
            Self::RelationshipInstance(_) => "relationship_instance",
            Self::ModelPersistence(_) => "model_persistence",
            Self::QueryDefinition(_) => "query_definition",
            Self::NoMatch(_) => "no_match",
            Self::MultipleMatches(_) => "multiple_matches",
            Self::SignalDefinition(_) => "signal_definition",
            Self::Validation(_) => "validation",
            Self::Value(_) => "value",
            Self::Type(_) => "type",
            Self::Database(_) => "database",
            Self::Integrity(_) => "integrity",
            Self::Operational(_) => "operational",
            Self::Configuration(_) => "configuration",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }

    /// Returns `true` for [`RelataError::NoMatch`].
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NoMatch(_))
    }
}

impl From<ValidationError> for RelataError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<serde_json::Error> for RelataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A convenience type alias for `Result<T, RelataError>`.
pub type RelataResult<T> = Result<T, RelataError>;
