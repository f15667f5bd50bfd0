//! Field validators.
//!
//! Validators enforce constraints on already-coerced field values. They are
//! attached to [`FieldDef`](crate::fields::FieldDef)s and run on every
//! mutation path (construction, assignment and save).

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use relata_core::{RelataError, RelataResult, ValidationError};

use crate::value::Value;

/// A trait for validating field values.
///
/// # Examples
///
/// ```
/// use relata_db::validators::{MaxLengthValidator, Validator};
/// use relata_db::value::Value;
///
/// let v = MaxLengthValidator::new(5);
/// assert!(v.validate(&Value::String("hi".into())).is_ok());
/// assert!(v.validate(&Value::String("toolong".into())).is_err());
/// ```
pub trait Validator: Send + Sync + fmt::Debug {
    /// Validates the given value.
    fn validate(&self, value: &Value) -> Result<(), ValidationError>;

    /// Returns a human-readable name for this validator.
    fn name(&self) -> &str;
}

/// Validates that a string or binary value does not exceed a maximum length.
#[derive(Debug, Clone)]
pub struct MaxLengthValidator {
    /// The maximum allowed length.
    pub max_length: usize,
}

impl MaxLengthValidator {
    /// Creates a new `MaxLengthValidator`.
    pub const fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl Validator for MaxLengthValidator {
    fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        let len = match value {
            Value::String(s) => s.chars().count(),
            Value::Bytes(b) => b.len(),
            _ => return Ok(()),
        };
        if len > self.max_length {
            return Err(ValidationError::new(
                format!(
                    "Ensure this value has at most {} characters (it has {len}).",
                    self.max_length
                ),
                "max_length",
            )
            .with_param("limit", self.max_length.to_string()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "MaxLengthValidator"
    }
}

/// Validates that a string value meets a minimum length requirement.
#[derive(Debug, Clone)]
pub struct MinLengthValidator {
    /// The minimum required length.
    pub min_length: usize,
}

impl MinLengthValidator {
    /// Creates a new `MinLengthValidator`.
    pub const fn new(min_length: usize) -> Self {
        Self { min_length }
    }
}

impl Validator for MinLengthValidator {
    fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        if let Value::String(s) = value {
            let len = s.chars().count();
            if len < self.min_length {
                return Err(ValidationError::new(
                    format!(
                        "Ensure this value has at least {} characters (it has {len}).",
                        self.min_length
                    ),
                    "min_length",
                ));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "MinLengthValidator"
    }
}

/// Validates that a numeric value does not exceed a maximum.
#[derive(Debug, Clone)]
pub struct MaxValueValidator {
    /// The maximum allowed value.
    pub max_value: f64,
}

impl MaxValueValidator {
    /// Creates a new `MaxValueValidator`.
    pub const fn new(max_value: f64) -> Self {
        Self { max_value }
    }
}

impl Validator for MaxValueValidator {
    fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        match value.as_f64() {
            Some(n) if n > self.max_value => Err(ValidationError::new(
                format!("Ensure this value is less than or equal to {}.", self.max_value),
                "max_value",
            )),
            _ => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "MaxValueValidator"
    }
}

/// Validates that a numeric value meets a minimum.
#[derive(Debug, Clone)]
pub struct MinValueValidator {
    /// The minimum required value.
    pub min_value: f64,
}

impl MinValueValidator {
    /// Creates a new `MinValueValidator`.
    pub const fn new(min_value: f64) -> Self {
        Self { min_value }
    }
}

impl Validator for MinValueValidator {
    fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        match value.as_f64() {
            Some(n) if n < self.min_value => Err(ValidationError::new(
                format!("Ensure this value is greater than or equal to {}.", self.min_value),
                "min_value",
            )),
            _ => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "MinValueValidator"
    }
}

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)+$").expect("valid email regex")
});

/// Validates that a string value matches a regular expression.
#[derive(Debug, Clone)]
pub struct RegexValidator {
    regex: Regex,
    message: String,
    code: String,
}

impl RegexValidator {
    /// Compiles `pattern` into a validator.
    pub fn new(pattern: &str, message: impl Into<String>) -> RelataResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| RelataError::Definition(format!("invalid validator pattern: {e}")))?;
        Ok(Self {
            regex,
            message: message.into(),
            code: "invalid".to_string(),
        })
    }

    /// A validator for e-mail addresses.
    pub fn email() -> Self {
        Self {
            regex: EMAIL_RE.clone(),
            message: "Enter a valid email address.".to_string(),
            code: "invalid_email".to_string(),
        }
    }
}

impl Validator for RegexValidator {
    fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        if let Value::String(s) = value {
            if !self.regex.is_match(s) {
                return Err(ValidationError::new(self.message.clone(), self.code.clone()));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "RegexValidator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_length() {
        let v = MaxLengthValidator::new(3);
        assert!(v.validate(&Value::String("abc".into())).is_ok());
        let err = v.validate(&Value::String("abcd".into())).unwrap_err();
        assert_eq!(err.code, "max_length");
        assert_eq!(err.params["limit"], "3");
    }

    #[test]
    fn test_max_length_counts_chars_not_bytes() {
        let v = MaxLengthValidator::new(2);
        assert!(v.validate(&Value::String("éé".into())).is_ok());
    }

    #[test]
    fn test_max_length_bytes() {
        let v = MaxLengthValidator::new(2);
        assert!(v.validate(&Value::Bytes(vec![1, 2, 3])).is_err());
        assert!(v.validate(&Value::Int(12345)).is_ok());
    }

    #[test]
    fn test_min_length() {
        let v = MinLengthValidator::new(3);
        assert!(v.validate(&Value::String("hello".into())).is_ok());
        assert!(v.validate(&Value::String("hi".into())).is_err());
    }

    #[test]
    fn test_value_bounds() {
        let max = MaxValueValidator::new(100.0);
        assert!(max.validate(&Value::Int(100)).is_ok());
        assert!(max.validate(&Value::Float(100.1)).is_err());
        let min = MinValueValidator::new(0.0);
        assert!(min.validate(&Value::Int(0)).is_ok());
        assert!(min.validate(&Value::Int(-1)).is_err());
    }

    #[test]
    fn test_regex_validator() {
        let v = RegexValidator::new(r"^\d{4}$", "Enter a year.").unwrap();
        assert!(v.validate(&Value::String("1999".into())).is_ok());
        assert_eq!(
            v.validate(&Value::String("99".into())).unwrap_err().message,
            "Enter a year."
        );
        assert!(RegexValidator::new("(", "bad").is_err());
    }

    #[test]
    fn test_email_validator() {
        let v = RegexValidator::email();
        assert!(v.validate(&Value::String("ann@example.com".into())).is_ok());
        assert!(v.validate(&Value::String("not-an-email".into())).is_err());
    }
}
