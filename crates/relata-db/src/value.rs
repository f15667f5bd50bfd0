//! Backend-agnostic database values.
//!
//! [`Value`] is the type used to pass data between instances, the query
//! compiler and the storage driver. It covers the semantic field types and
//! converts from the usual Rust types.

use std::fmt;
use std::fmt::Write as _;

use base64::Engine as _;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// A backend-agnostic representation of a database value.
///
/// # Examples
///
/// ```
/// use relata_db::value::Value;
///
/// let v = Value::from(42_i64);
/// assert_eq!(v, Value::Int(42));
///
/// let v = Value::from("hello");
/// assert_eq!(v, Value::String("hello".to_string()));
///
/// let v = Value::from(None::<i64>);
/// assert!(v.is_null());
/// ```
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// SQL NULL.
    Null,
    /// A boolean value.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit floating-point number.
    Float(f64),
    /// An exact decimal number.
    Decimal(Decimal),
    /// A UTF-8 string.
    String(String),
    /// Raw binary data.
    Bytes(Vec<u8>),
    /// A date without time.
    Date(chrono::NaiveDate),
    /// A date and time without timezone.
    DateTime(chrono::NaiveDateTime),
    /// A date and time in UTC.
    DateTimeTz(chrono::DateTime<chrono::Utc>),
    /// A time without date.
    Time(chrono::NaiveTime),
    /// A UUID value.
    Uuid(uuid::Uuid),
    /// A JSON document.
    Json(serde_json::Value),
    /// A list of values (for IN clauses).
    List(Vec<Value>),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the integer payload, if any.
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as a float when it is numeric.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    /// Returns the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns a stable textual key used to compare identities across rows.
    ///
    /// Two values that denote the same stored key produce the same string,
    /// regardless of how the driver typed them (e.g. `Int(1)` and `Decimal(1)`
    /// both read back from an INTEGER column).
    pub fn key_repr(&self) -> String {
        match self {
            Self::Null => "∅".to_string(),
            Self::Decimal(d) if d.fract().is_zero() => d.trunc().to_string(),
            Self::Bool(b) => i64::from(*b).to_string(),
            Self::List(vals) => {
                let mut out = String::from("(");
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&v.key_repr());
                }
                out.push(')');
                out
            }
            other => other.to_string(),
        }
    }

    /// Compares two values the way an ascending SQL `ORDER BY` would,
    /// with NULL first.
    pub fn sort_cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Null, _) => Ordering::Less,
            (_, Self::Null) => Ordering::Greater,
            (Self::Decimal(a), Self::Decimal(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::DateTime(a), Self::DateTime(b)) => a.cmp(b),
            (Self::DateTimeTz(a), Self::DateTimeTz(b)) => a.cmp(b),
            (Self::Time(a), Self::Time(b)) => a.cmp(b),
            (Self::Uuid(a), Self::Uuid(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.key_repr().cmp(&b.key_repr()),
            },
        }
    }

    /// Converts the value into a JSON document.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::json!(i),
            Self::Float(f) => serde_json::json!(f),
            Self::Decimal(d) => serde_json::Value::String(d.to_string()),
            Self::Bytes(b) => {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Self::Json(j) => j.clone(),
            Self::List(vals) => serde_json::Value::Array(vals.iter().map(Self::to_json).collect()),
            other => serde_json::Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Date(d) => write!(f, "{d}"),
            Self::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.f")),
            Self::DateTimeTz(dt) => write!(f, "{}", dt.to_rfc3339()),
            Self::Time(t) => write!(f, "{t}"),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Json(j) => write!(f, "{j}"),
            Self::List(vals) => {
                let mut out = String::from("[");
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{v}");
                }
                out.push(']');
                f.write_str(&out)
            }
        }
    }
}

// ── From implementations ───────────────────────────────────────────────

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    Decimal => Decimal,
    String => String,
    Vec<u8> => Bytes,
    chrono::NaiveDate => Date,
    chrono::NaiveDateTime => DateTime,
    chrono::DateTime<chrono::Utc> => DateTimeTz,
    chrono::NaiveTime => Time,
    uuid::Uuid => Uuid,
    serde_json::Value => Json,
    Vec<Value> => List,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
