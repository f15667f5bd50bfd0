//! Value transforms applied between an instance and its stored column.

use std::fmt;

use base64::Engine as _;
use relata_core::{RelataResult, ValidationError};

use crate::value::Value;

/// A reversible encoding applied when a value is written to or read from
/// storage (binary-as-base64, encryption, compression, ...).
pub trait FieldTransform: Send + Sync + fmt::Debug {
    /// Converts the in-memory value into its stored form.
    fn to_db(&self, value: Value) -> RelataResult<Value>;

    /// Converts a stored value back into its in-memory form.
    fn from_db(&self, value: Value) -> RelataResult<Value>;

    /// Returns a human-readable name for this transform.
    fn name(&self) -> &str;
}

/// Keeps binary data in memory as a base64 string and stores raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Transform;

impl FieldTransform for Base64Transform {
    fn to_db(&self, value: Value) -> RelataResult<Value> {
        match value {
            Value::String(s) => base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .map(Value::Bytes)
                .map_err(|e| {
                    ValidationError::new(format!("Invalid base64 data: {e}"), "invalid").into()
                }),
            other => Ok(other),
        }
    }

    fn from_db(&self, value: Value) -> RelataResult<Value> {
        match value {
            Value::Bytes(b) => Ok(Value::String(
                base64::engine::general_purpose::STANDARD.encode(b),
            )),
            other => Ok(other),
        }
    }

    fn name(&self) -> &str {
        "base64"
    }
}
