//! Value types for lockstep-rdbc
//!
//! Only the types that catalog introspection and snapshot bookkeeping exchange
//! with the database are modelled: booleans, integers, text, timestamps and JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// SQL value type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 64-bit floating point (DOUBLE PRECISION)
    Float64(f64),
    /// Text string (VARCHAR, TEXT, NAME, "char")
    String(String),
    /// Timestamp with timezone (TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to convert to a UTC timestamp
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::DateTimeTz(dt) => Some(*dt),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let (columns, values) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Required text column
    pub fn try_str(&self, name: &str) -> Result<&str> {
        self.get_by_name(name)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::type_conversion(format!("column '{}' is not text", name)))
    }

    /// Required integer column
    pub fn try_i64(&self, name: &str) -> Result<i64> {
        self.get_by_name(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::type_conversion(format!("column '{}' is not an integer", name)))
    }

    /// Required boolean column
    pub fn try_bool(&self, name: &str) -> Result<bool> {
        self.get_by_name(name)
            .and_then(Value::as_bool)
            .ok_or_else(|| Error::type_conversion(format!("column '{}' is not a boolean", name)))
    }

    /// Optional timestamp column; NULL yields `None`
    pub fn opt_datetime(&self, name: &str) -> Option<DateTime<Utc>> {
        self.get_by_name(name).and_then(Value::as_datetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(42_i32).as_i64(), Some(42));
        assert_eq!(Value::from("t").as_bool(), Some(true));
        assert_eq!(Value::from("10").as_i64(), Some(10));
        assert!(Value::from(Option::<i64>::None).is_null());
        assert_eq!(Value::Null.as_str(), None);
    }

    #[test]
    fn test_row_lookup_is_case_insensitive() {
        let row = Row::from_pairs([("Index_Name", Value::from("orders_idx"))]);
        assert_eq!(row.try_str("index_name").unwrap(), "orders_idx");
        assert!(row.try_i64("index_name").is_err());
        assert!(row.try_str("missing").is_err());
    }

    #[test]
    fn test_row_typed_accessors() {
        let now = Utc::now();
        let row = Row::from_pairs([
            ("bytes", Value::Int64(1 << 34)),
            ("is_primary", Value::Bool(false)),
            ("consumed_at", Value::DateTimeTz(now)),
        ]);
        assert_eq!(row.try_i64("bytes").unwrap(), 1 << 34);
        assert!(!row.try_bool("is_primary").unwrap());
        assert_eq!(row.opt_datetime("consumed_at"), Some(now));
        assert_eq!(row.len(), 3);
    }
}
