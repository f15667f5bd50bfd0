//! Field descriptors.
//!
//! A [`FieldDef`] describes one stored column: its semantic [`FieldType`],
//! nullability, default provider, key and index flags, length and precision
//! constraints and an optional [`FieldTransform`]. Field descriptors also act
//! as the coercion layer: [`FieldDef::validate`] turns a raw value into the
//! typed value the instance stores, and [`FieldDef::from_db`] does the same for
//! driver output.

mod transform;

pub use transform::{Base64Transform, FieldTransform};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use relata_core::{RelataResult, ValidationError};
use rust_decimal::Decimal;

use crate::validators::{MaxLengthValidator, Validator};
use crate::value::Value;

/// The semantic type of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    BigInteger,
    /// 16-bit signed integer.
    SmallInteger,
    /// 64-bit floating-point number.
    Float,
    /// Fixed-precision decimal number.
    Decimal {
        /// Maximum total digits.
        max_digits: u32,
        /// Digits after the decimal point.
        decimal_places: u32,
    },
    /// Variable-length string with a max length.
    String {
        /// Maximum number of characters.
        max_length: usize,
    },
    /// Unlimited-length text.
    Text,
    /// Boolean.
    Boolean,
    /// Date without time.
    Date,
    /// Date and time.
    DateTime {
        /// Whether values are kept timezone-aware (UTC).
        timezone: bool,
    },
    /// Time without date.
    Time,
    /// UUID.
    Uuid,
    /// JSON document.
    Json,
    /// Binary data.
    LargeBinary {
        /// Maximum number of bytes.
        max_length: usize,
        /// Whether instances hold the data as a base64 string.
        represent_as_base64: bool,
    },
}

impl FieldType {
    /// Returns `true` for types that `sum`/`avg` accept.
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Integer | Self::BigInteger | Self::SmallInteger | Self::Float | Self::Decimal { .. }
        )
    }

    /// Returns `true` for integer types.
    pub const fn is_integer(&self) -> bool {
        matches!(self, Self::Integer | Self::BigInteger | Self::SmallInteger)
    }

    /// Returns `true` for types with a total order that `min`/`max` accept.
    pub const fn is_orderable(&self) -> bool {
        !matches!(self, Self::Json | Self::LargeBinary { .. })
    }

    /// Returns `true` if two types may redefine the same field name.
    ///
    /// Parameters (lengths, precision) may change; the kind may not.
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Returns the column type used for SQLite DDL.
    pub const fn sqlite_type(&self) -> &'static str {
        match self {
            Self::Integer | Self::BigInteger | Self::SmallInteger | Self::Boolean => "INTEGER",
            Self::Float => "REAL",
            Self::Decimal { .. } => "NUMERIC",
            Self::LargeBinary { .. } => "BLOB",
            Self::String { .. }
            | Self::Text
            | Self::Date
            | Self::DateTime { .. }
            | Self::Time
            | Self::Uuid
            | Self::Json => "TEXT",
        }
    }

    /// Returns a short lowercase name for messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::BigInteger => "big_integer",
            Self::SmallInteger => "small_integer",
            Self::Float => "float",
            Self::Decimal { .. } => "decimal",
            Self::String { .. } => "string",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime { .. } => "datetime",
            Self::Time => "time",
            Self::Uuid => "uuid",
            Self::Json => "json",
            Self::LargeBinary { .. } => "large_binary",
        }
    }
}

/// Provides a field's value when none was supplied.
#[derive(Clone)]
pub enum DefaultValue {
    /// A fixed value.
    Static(Value),
    /// A factory invoked once per instance (e.g. `Uuid::new_v4`).
    Factory(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl DefaultValue {
    /// Produces the default value.
    pub fn produce(&self) -> Value {
        match self {
            Self::Static(v) => v.clone(),
            Self::Factory(f) => f(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(v) => f.debug_tuple("Static").field(v).finish(),
            Self::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

/// A complete field descriptor.
///
/// Build one with a factory such as [`FieldDef::string`] and chain options:
///
/// ```
/// use relata_db::fields::FieldDef;
///
/// let title = FieldDef::string("title", 100).unique().index();
/// assert!(title.unique && title.index);
/// assert!(!title.nullable);
/// ```
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// The attribute name.
    pub name: String,
    /// The stored column name.
    pub column: String,
    /// The semantic type.
    pub field_type: FieldType,
    /// Whether NULL is accepted.
    pub nullable: bool,
    /// Whether the field is (part of) the primary key.
    pub primary_key: bool,
    /// Whether storage generates the value on insert.
    pub autoincrement: bool,
    /// Whether a UNIQUE constraint applies.
    pub unique: bool,
    /// Whether an index should be created.
    pub index: bool,
    /// Default value provider.
    pub default: Option<DefaultValue>,
    /// Allowed values; empty means unrestricted.
    pub choices: Vec<Value>,
    /// Extra validators.
    pub validators: Vec<Arc<dyn Validator>>,
    /// Optional storage transform.
    pub transform: Option<Arc<dyn FieldTransform>>,
    /// The foreign-key relation this column belongs to, if any.
    pub relation: Option<String>,
    /// Auto-derived composite foreign-key column; not directly accessible.
    pub shadow: bool,
}

impl FieldDef {
    /// Creates a field with the given name and type; all flags off.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        let mut field = Self {
            column: name.clone(),
            name,
            field_type,
            nullable: false,
            primary_key: false,
            autoincrement: false,
            unique: false,
            index: false,
            default: None,
            choices: Vec::new(),
            validators: Vec::new(),
            transform: None,
            relation: None,
            shadow: false,
        };
        match field.field_type {
            FieldType::String { max_length } | FieldType::LargeBinary { max_length, .. } => {
                field
                    .validators
                    .push(Arc::new(MaxLengthValidator::new(max_length)));
            }
            _ => {}
        }
        if matches!(
            field.field_type,
            FieldType::LargeBinary {
                represent_as_base64: true,
                ..
            }
        ) {
            field.transform = Some(Arc::new(Base64Transform));
        }
        field
    }

    /// A 32-bit integer field.
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    /// A 64-bit integer field.
    pub fn big_integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::BigInteger)
    }

    /// A 16-bit integer field.
    pub fn small_integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::SmallInteger)
    }

    /// A floating-point field.
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Float)
    }

    /// A decimal field.
    pub fn decimal(name: impl Into<String>, max_digits: u32, decimal_places: u32) -> Self {
        Self::new(
            name,
            FieldType::Decimal {
                max_digits,
                decimal_places,
            },
        )
    }

    /// A bounded string field.
    pub fn string(name: impl Into<String>, max_length: usize) -> Self {
        Self::new(name, FieldType::String { max_length })
    }

    /// An unbounded text field.
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Text)
    }

    /// A boolean field.
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    /// A date field.
    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Date)
    }

    /// A naive datetime field.
    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::DateTime { timezone: false })
    }

    /// A UTC datetime field.
    pub fn datetime_tz(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::DateTime { timezone: true })
    }

    /// A time field.
    pub fn time(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Time)
    }

    /// A UUID field.
    pub fn uuid(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Uuid)
    }

    /// A JSON field.
    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Json)
    }

    /// A binary field holding raw bytes.
    pub fn large_binary(name: impl Into<String>, max_length: usize) -> Self {
        Self::new(
            name,
            FieldType::LargeBinary {
                max_length,
                represent_as_base64: false,
            },
        )
    }

    /// A binary field held in memory as a base64 string.
    pub fn large_binary_base64(name: impl Into<String>, max_length: usize) -> Self {
        Self::new(
            name,
            FieldType::LargeBinary {
                max_length,
                represent_as_base64: true,
            },
        )
    }

    /// Sets the stored column name.
    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Marks this field as the primary key.
    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Lets storage generate the value on insert.
    #[must_use]
    pub const fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self
    }

    /// Allows NULL values.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Marks this field as having a UNIQUE constraint.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks this field as indexed.
    #[must_use]
    pub const fn index(mut self) -> Self {
        self.index = true;
        self
    }

    /// Sets a fixed default value.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Static(value.into()));
        self
    }

    /// Sets a default value factory.
    #[must_use]
    pub fn default_with(mut self, factory: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(DefaultValue::Factory(Arc::new(factory)));
        self
    }

    /// Restricts the field to the given values.
    #[must_use]
    pub fn choices<V: Into<Value>>(mut self, choices: impl IntoIterator<Item = V>) -> Self {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a validator.
    #[must_use]
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Sets the storage transform.
    #[must_use]
    pub fn transform(mut self, transform: impl FieldTransform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Returns `true` if a missing value must be supplied before insert.
    pub const fn is_required(&self) -> bool {
        !self.nullable && !self.autoincrement && self.default.is_none()
    }

    /// Coerces and validates a raw value assigned by application code.
    ///
    /// Errors are reported under this field's name.
    pub fn validate(&self, raw: Value) -> RelataResult<Value> {
        self.check(raw).map_err(|e| ValidationError::for_field(&self.name, e).into())
    }

    fn check(&self, raw: Value) -> Result<Value, ValidationError> {
        if raw.is_null() {
            if self.nullable || self.autoincrement {
                return Ok(Value::Null);
            }
            return Err(ValidationError::new("This field cannot be null.", "null"));
        }

        let value = self.coerce(raw)?;
        if !self.choices.is_empty() && !self.choices.contains(&value) {
            return Err(ValidationError::new(
                format!("Value {value} is not a valid choice."),
                "invalid_choice",
            ));
        }
        self.check_precision(&value)?;
        for validator in &self.validators {
            validator.validate(&value)?;
        }
        Ok(value)
    }

    /// Converts driver output into the typed in-memory value.
    ///
    /// Runs the storage transform backwards but skips validators, since stored
    /// data is trusted.
    pub fn from_db(&self, raw: Value) -> RelataResult<Value> {
        if raw.is_null() {
            return Ok(Value::Null);
        }
        let raw = match &self.transform {
            Some(t) => t.from_db(raw)?,
            None => raw,
        };
        self.coerce(raw)
            .map_err(|e| ValidationError::for_field(&self.name, e).into())
    }

    /// Converts an in-memory value into its stored form.
    pub fn to_db(&self, value: Value) -> RelataResult<Value> {
        match (&self.transform, value) {
            (_, Value::Null) => Ok(Value::Null),
            (Some(t), v) => t.to_db(v),
            (None, v) => Ok(v),
        }
    }

    #[allow(clippy::too_many_lines, clippy::cast_possible_truncation)]
    fn coerce(&self, raw: Value) -> Result<Value, ValidationError> {
        let invalid = |raw: &Value| {
            ValidationError::new(
                format!("'{raw}' is not a valid {} value.", self.field_type.name()),
                "invalid",
            )
        };

        match &self.field_type {
            FieldType::Integer | FieldType::BigInteger | FieldType::SmallInteger => match raw {
                Value::Int(_) => Ok(raw),
                Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(Value::Int(f as i64)),
                Value::Decimal(d) if d.fract().is_zero() => d
                    .trunc()
                    .to_string()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| invalid(&raw)),
                Value::String(ref s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| invalid(&raw)),
                _ => Err(invalid(&raw)),
            },
            FieldType::Float => match raw {
                Value::Float(_) => Ok(raw),
                Value::Int(_) | Value::Decimal(_) => raw.as_f64().map(Value::Float).ok_or_else(|| invalid(&raw)),
                Value::String(ref s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| invalid(&raw)),
                _ => Err(invalid(&raw)),
            },
            FieldType::Decimal { .. } => match raw {
                Value::Decimal(_) => Ok(raw),
                Value::Int(i) => Ok(Value::Decimal(Decimal::from(i))),
                Value::Float(f) => Decimal::try_from(f).map(Value::Decimal).map_err(|_| invalid(&raw)),
                Value::String(ref s) => Decimal::from_str(s.trim()).map(Value::Decimal).map_err(|_| invalid(&raw)),
                _ => Err(invalid(&raw)),
            },
            FieldType::String { .. } | FieldType::Text => match raw {
                Value::String(_) => Ok(raw),
                _ => Err(invalid(&raw)),
            },
            FieldType::Boolean => match raw {
                Value::Bool(_) => Ok(raw),
                Value::Int(0) => Ok(Value::Bool(false)),
                Value::Int(1) => Ok(Value::Bool(true)),
                Value::String(ref s) => match s.to_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" => Ok(Value::Bool(false)),
                    _ => Err(invalid(&raw)),
                },
                _ => Err(invalid(&raw)),
            },
            FieldType::Date => match raw {
                Value::Date(_) => Ok(raw),
                Value::DateTime(dt) => Ok(Value::Date(dt.date())),
                Value::DateTimeTz(dt) => Ok(Value::Date(dt.date_naive())),
                Value::String(ref s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map(Value::Date)
                    .map_err(|_| invalid(&raw)),
                _ => Err(invalid(&raw)),
            },
            FieldType::DateTime { timezone } => {
                let naive = match raw {
                    Value::DateTime(dt) => dt,
                    Value::DateTimeTz(dt) => dt.naive_utc(),
                    Value::Date(d) => d.and_time(NaiveTime::MIN),
                    Value::String(ref s) => parse_datetime(s).ok_or_else(|| invalid(&raw))?,
                    _ => return Err(invalid(&raw)),
                };
                if *timezone {
                    Ok(Value::DateTimeTz(chrono::Utc.from_utc_datetime(&naive)))
                } else {
                    Ok(Value::DateTime(naive))
                }
            }
            FieldType::Time => match raw {
                Value::Time(_) => Ok(raw),
                Value::String(ref s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
                    .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M"))
                    .map(Value::Time)
                    .map_err(|_| invalid(&raw)),
                _ => Err(invalid(&raw)),
            },
            FieldType::Uuid => match raw {
                Value::Uuid(_) => Ok(raw),
                Value::String(ref s) => uuid::Uuid::parse_str(s.trim())
                    .map(Value::Uuid)
                    .map_err(|_| invalid(&raw)),
                _ => Err(invalid(&raw)),
            },
            FieldType::Json => match raw {
                Value::Json(_) => Ok(raw),
                Value::String(s) => Ok(Value::Json(
                    serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s)),
                )),
                other => Ok(Value::Json(other.to_json())),
            },
            FieldType::LargeBinary {
                represent_as_base64,
                ..
            } => match (raw, *represent_as_base64) {
                (Value::Bytes(b), false) => Ok(Value::Bytes(b)),
                (Value::String(s), false) => Ok(Value::Bytes(s.into_bytes())),
                (Value::String(s), true) => {
                    let probe = Value::String(s);
                    Base64Transform
                        .to_db(probe.clone())
                        .map(|_| probe)
                        .map_err(|_| ValidationError::new("Invalid base64 data.", "invalid"))
                }
                (Value::Bytes(b), true) => Base64Transform
                    .from_db(Value::Bytes(b))
                    .map_err(|_| ValidationError::new("Invalid binary data.", "invalid")),
                (other, _) => Err(invalid(&other)),
            },
        }
    }

    fn check_precision(&self, value: &Value) -> Result<(), ValidationError> {
        if let (
            FieldType::Decimal {
                max_digits,
                decimal_places,
            },
            Value::Decimal(d),
        ) = (&self.field_type, value)
        {
            if d.scale() > *decimal_places {
                return Err(ValidationError::new(
                    format!("Ensure that there are no more than {decimal_places} decimal places."),
                    "max_decimal_places",
                ));
            }
            let digits = d.trunc().abs().to_string().trim_start_matches('0').len();
            let allowed = max_digits.saturating_sub(*decimal_places) as usize;
            if digits > allowed {
                return Err(ValidationError::new(
                    format!("Ensure that there are no more than {allowed} digits before the decimal point."),
                    "max_whole_digits",
                ));
            }
        }
        Ok(())
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

impl From<Value> for DefaultValue {
    fn from(v: Value) -> Self {
        Self::Static(v)
    }
}
