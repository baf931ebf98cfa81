//! Portable parameter and row types shared by every storage backend.
//!
//! Backends translate [`Value`] into their native bind types and decode their
//! native rows into [`Row`]. Higher layers (ledger, repository) only ever see
//! these types, so the in-memory backend and the PostgreSQL backend are
//! interchangeable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single bound parameter or decoded column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL `NULL`
    Null,
    /// Boolean
    Bool(bool),
    /// Any integer column (`SMALLINT`, `INTEGER`, `BIGINT`)
    Int(i64),
    /// Any floating point column
    Float(f64),
    /// Text-like column
    Text(String),
    /// Timestamp, always normalised to UTC
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Returns `true` for [`Value::Null`]
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, used in decode error messages
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Timestamp(ts) => write!(f, "'{}'", ts.to_rfc3339()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A decoded result row with named columns
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Build a row from `(column, value)` pairs
    pub fn new<I, S>(cells: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (columns, values) = cells
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .unzip();
        Self { columns, values }
    }

    /// Column names in result order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value by position
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value by column name
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Decode a named column into `T`
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the column is missing or has an incompatible type.
    pub fn try_get<T: FromValue>(&self, name: &str) -> Result<T, DecodeError> {
        let value = self
            .get_named(name)
            .ok_or_else(|| DecodeError::MissingColumn(name.to_string()))?;
        T::from_value(value).map_err(|found| DecodeError::WrongType {
            column: name.to_string(),
            expected: T::EXPECTED,
            found,
        })
    }
}

/// Error raised while decoding a [`Row`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("column '{0}' not present in row")]
    MissingColumn(String),
    #[error("column '{column}' expected {expected}, found {found}")]
    WrongType {
        column: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Conversion from a single [`Value`]
pub trait FromValue: Sized {
    /// Type name used in error messages
    const EXPECTED: &'static str;

    /// Convert, returning the found kind on mismatch
    fn from_value(value: &Value) -> Result<Self, &'static str>;
}

impl FromValue for bool {
    const EXPECTED: &'static str = "bool";
    fn from_value(value: &Value) -> Result<Self, &'static str> {
        match value {
            Value::Bool(b) => Ok(*b),
            // Some drivers hand booleans back as 0/1
            Value::Int(i) => Ok(*i != 0),
            other => Err(other.kind()),
        }
    }
}

impl FromValue for i64 {
    const EXPECTED: &'static str = "int";
    fn from_value(value: &Value) -> Result<Self, &'static str> {
        match value {
            Value::Int(i) => Ok(*i),
            other => Err(other.kind()),
        }
    }
}

impl FromValue for f64 {
    const EXPECTED: &'static str = "float";
    fn from_value(value: &Value) -> Result<Self, &'static str> {
        match value {
            Value::Float(v) => Ok(*v),
            #[allow(clippy::cast_precision_loss)]
            Value::Int(i) => Ok(*i as f64),
            other => Err(other.kind()),
        }
    }
}

impl FromValue for String {
    const EXPECTED: &'static str = "text";
    fn from_value(value: &Value) -> Result<Self, &'static str> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => Err(other.kind()),
        }
    }
}

impl FromValue for DateTime<Utc> {
    const EXPECTED: &'static str = "timestamp";
    fn from_value(value: &Value) -> Result<Self, &'static str> {
        match value {
            Value::Timestamp(ts) => Ok(*ts),
            Value::Text(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| "text"),
            other => Err(other.kind()),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;
    fn from_value(value: &Value) -> Result<Self, &'static str> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Decode a whole [`Row`] into a typed model
pub trait FromRow: Sized {
    /// # Errors
    ///
    /// Returns [`DecodeError`] if any required column is missing or mistyped.
    fn from_row(row: &Row) -> Result<Self, DecodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lookup_by_name_and_index() {
        let row = Row::new([("id", Value::Int(7)), ("name", Value::from("alice"))]);
        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0), Some(&Value::Int(7)));
        assert_eq!(row.get_named("name"), Some(&Value::Text("alice".into())));
        assert_eq!(row.try_get::<i64>("id"), Ok(7));
    }

    #[test]
    fn test_try_get_reports_missing_and_mistyped_columns() {
        let row = Row::new([("id", Value::Int(7))]);
        assert_eq!(
            row.try_get::<String>("missing"),
            Err(DecodeError::MissingColumn("missing".into()))
        );
        let err = row.try_get::<String>("id").unwrap_err();
        assert!(err.to_string().contains("expected text, found int"));
    }

    #[test]
    fn test_optional_columns_accept_null() {
        let row = Row::new([("applied_by", Value::Null)]);
        assert_eq!(row.try_get::<Option<String>>("applied_by"), Ok(None));
    }

    #[test]
    fn test_timestamp_decodes_from_rfc3339_text() {
        let row = Row::new([("at", Value::from("2024-01-20T12:00:00Z"))]);
        let at: DateTime<Utc> = row.try_get("at").unwrap();
        assert_eq!(at.to_rfc3339(), "2024-01-20T12:00:00+00:00");
    }
}
