//! Lookups and Q trees for building filters.
//!
//! A [`Q`] is either a single `path__lookup = value` leaf or an AND/OR/NOT
//! node over other trees. Precedence is always explicit in the nesting.
//!
//! # Examples
//!
//! ```
//! use relata_db::query::lookups::{LookupKind, Q};
//!
//! // genre = "Fiction" AND (year < 1930 OR title contains "Sun")
//! let q = Q::and_([
//!     Q::kw("genre", "Fiction"),
//!     Q::or_([Q::kw("year__lt", 1930), Q::kw("title__contains", "Sun")]),
//! ]);
//!
//! // The same with operators.
//! let q2 = Q::kw("genre", "Fiction") & (Q::kw("year__lt", 1930) | Q::kw("title__contains", "Sun"));
//! assert_eq!(format!("{q:?}"), format!("{q2:?}"));
//!
//! if let Q::Filter { path, lookup, .. } = Q::kw("author__name__iexact", "le guin") {
//!     assert_eq!(path, "author__name");
//!     assert_eq!(lookup, LookupKind::IExact);
//! }
//! ```

use std::fmt;
use std::ops;
use std::str::FromStr;

use relata_core::RelataError;

use crate::instance::Arg;

/// A field-level comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// `field = value`; `IS NULL` for a NULL value.
    Exact,
    /// Case-insensitive equality.
    IExact,
    /// Substring match.
    Contains,
    /// Case-insensitive substring match.
    IContains,
    /// Prefix match.
    StartsWith,
    /// Case-insensitive prefix match.
    IStartsWith,
    /// Suffix match.
    EndsWith,
    /// Case-insensitive suffix match.
    IEndsWith,
    /// Membership in a list.
    In,
    /// `field > value`.
    Gt,
    /// `field >= value`.
    Gte,
    /// `field < value`.
    Lt,
    /// `field <= value`.
    Lte,
    /// `IS NULL` when the value is true, `IS NOT NULL` otherwise.
    IsNull,
}

impl LookupKind {
    /// Every lookup, for name resolution.
    pub const ALL: [Self; 14] = [
        Self::Exact,
        Self::IExact,
        Self::Contains,
        Self::IContains,
        Self::StartsWith,
        Self::IStartsWith,
        Self::EndsWith,
        Self::IEndsWith,
        Self::In,
        Self::Gt,
        Self::Gte,
        Self::Lt,
        Self::Lte,
        Self::IsNull,
    ];

    /// Returns the lookup suffix.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::IExact => "iexact",
            Self::Contains => "contains",
            Self::IContains => "icontains",
            Self::StartsWith => "startswith",
            Self::IStartsWith => "istartswith",
            Self::EndsWith => "endswith",
            Self::IEndsWith => "iendswith",
            Self::In => "in",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::IsNull => "isnull",
        }
    }

    /// Returns `true` for lookups compiled to LIKE.
    pub const fn is_pattern(self) -> bool {
        matches!(
            self,
            Self::IExact
                | Self::Contains
                | Self::IContains
                | Self::StartsWith
                | Self::IStartsWith
                | Self::EndsWith
                | Self::IEndsWith
        )
    }
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LookupKind {
    type Err = RelataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| RelataError::QueryDefinition(format!("unknown lookup '{s}'")))
    }
}

/// A composable filter tree.
#[derive(Debug, Clone)]
pub enum Q {
    /// A single lookup.
    Filter {
        /// The `__`-separated relation path to a field or relation.
        path: String,
        /// The comparison.
        lookup: LookupKind,
        /// The operand.
        value: Arg,
    },
    /// All children must hold; empty is always true.
    And(Vec<Q>),
    /// Any child must hold; empty is always false.
    Or(Vec<Q>),
    /// The child must not hold.
    Not(Box<Q>),
}

impl Q {
    /// Creates a leaf from a `path__lookup` key.
    ///
    /// A trailing segment naming a lookup is split off; otherwise the lookup
    /// is `exact`.
    pub fn kw(key: &str, value: impl Into<Arg>) -> Self {
        let (path, lookup) = match key.rsplit_once("__") {
            Some((path, suffix)) => match suffix.parse::<LookupKind>() {
                Ok(lookup) => (path, lookup),
                Err(_) => (key, LookupKind::Exact),
            },
            None => (key, LookupKind::Exact),
        };
        Self::filter(path, lookup, value)
    }

    /// Creates a leaf with an explicit lookup.
    pub fn filter(path: impl Into<String>, lookup: LookupKind, value: impl Into<Arg>) -> Self {
        Self::Filter {
            path: path.into(),
            lookup,
            value: value.into(),
        }
    }

    /// ANDs `key => value` pairs, as keyword filters do.
    pub fn from_kwargs<I>(kwargs: I) -> Self
    where
        I: IntoIterator<Item = (String, Arg)>,
    {
        Self::And(kwargs.into_iter().map(|(k, v)| Self::kw(&k, v)).collect())
    }

    /// Combines trees with AND.
    pub fn and_(children: impl IntoIterator<Item = Self>) -> Self {
        Self::And(children.into_iter().collect())
    }

    /// Combines trees with OR.
    pub fn or_(children: impl IntoIterator<Item = Self>) -> Self {
        Self::Or(children.into_iter().collect())
    }

    /// Negates a tree.
    pub fn not_(child: Self) -> Self {
        Self::Not(Box::new(child))
    }

    /// Returns `true` for an empty AND/OR.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::And(children) | Self::Or(children) => children.is_empty(),
            _ => false,
        }
    }
}

impl From<Vec<(String, Arg)>> for Q {
    /// Keyword pairs, as built by [`values!`](crate::values), AND together.
    fn from(kwargs: Vec<(String, Arg)>) -> Self {
        Self::from_kwargs(kwargs)
    }
}

impl ops::BitAnd for Q {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (other, Self::And(mut right)) => {
                right.insert(0, other);
                Self::And(right)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }
}

impl ops::BitOr for Q {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), other) => {
                left.push(other);
                Self::Or(left)
            }
            (other, Self::Or(mut right)) => {
                right.insert(0, other);
                Self::Or(right)
            }
            (left, right) => Self::Or(vec![left, right]),
        }
    }
}

impl ops::Not for Q {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self::not_(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn leaf(q: &Q) -> (&str, LookupKind, &Arg) {
        match q {
            Q::Filter { path, lookup, value } => (path, *lookup, value),
            other => panic!("expected a leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_kw_splits_known_lookups() {
        let q = Q::kw("year__gte", 1920);
        let (path, lookup, value) = leaf(&q);
        assert_eq!(path, "year");
        assert_eq!(lookup, LookupKind::Gte);
        assert!(matches!(value, Arg::Value(Value::Int(1920))));

        let q = Q::kw("author__name", "x");
        assert_eq!(leaf(&q).0, "author__name");
        assert_eq!(leaf(&q).1, LookupKind::Exact);
    }

    #[test]
    fn test_single_segment_is_a_path() {
        let q = Q::kw("in", 1);
        assert_eq!(leaf(&q).0, "in");
    }

    #[test]
    fn test_in_takes_arrays() {
        let q = Q::kw("id__in", [1, 2, 3]);
        let (_, lookup, value) = leaf(&q);
        assert_eq!(lookup, LookupKind::In);
        assert!(matches!(value, Arg::Value(Value::List(items)) if items.len() == 3));
    }

    #[test]
    fn test_operators_flatten() {
        let q = Q::kw("a", 1) & Q::kw("b", 2) & Q::kw("c", 3);
        assert!(matches!(&q, Q::And(children) if children.len() == 3));
        let q = Q::kw("a", 1) | Q::kw("b", 2) | Q::kw("c", 3);
        assert!(matches!(&q, Q::Or(children) if children.len() == 3));
        assert!(matches!(!Q::kw("a", 1), Q::Not(_)));
    }

    #[test]
    fn test_unknown_lookup_name() {
        assert!("between".parse::<LookupKind>().is_err());
        assert_eq!("icontains".parse::<LookupKind>().unwrap(), LookupKind::IContains);
        assert!(LookupKind::IExact.is_pattern());
        assert!(!LookupKind::In.is_pattern());
    }

    #[test]
    fn test_from_kwargs() {
        let q = Q::from_kwargs(crate::values! { "a" => 1, "b__lt" => 2 });
        assert!(matches!(&q, Q::And(children) if children.len() == 2));
        assert!(Q::and_([]).is_empty());
    }
}
