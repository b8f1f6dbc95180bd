//! Typed scalar values flowing through the engine.
//!
//! Every row in a [`crate::Dataflow`](crate::dataflow::Dataflow) is a
//! `Vec<Value>`. Values carry enough type information to round-trip
//! through CSV, to derive DDL column types, and to feed the per-column
//! checksum comparison after a bulk load.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::columns::ColumnType;

/// A single row of a datastream.
pub type Row = Vec<Value>;

/// A typed scalar cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Text(String),
}

const TIMESTAMP_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Parse a raw field under an already-decided column type.
    ///
    /// A field that does not conform stays as text; the target cast
    /// surfaces any real mismatch during promotion.
    pub fn parse_as(typ: ColumnType, raw: &str) -> Value {
        if raw.is_empty() {
            return Value::Null;
        }
        match typ {
            ColumnType::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::Text(raw.to_string()),
            },
            ColumnType::BigInt => raw
                .parse::<i64>()
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(raw.to_string())),
            ColumnType::Decimal => raw
                .parse::<f64>()
                .map(Value::Float)
                .unwrap_or_else(|_| Value::Text(raw.to_string())),
            ColumnType::Date => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(Value::Date)
                .unwrap_or_else(|_| Value::Text(raw.to_string())),
            ColumnType::Datetime => parse_timestamp(raw)
                .map(Value::Timestamp)
                .unwrap_or_else(|| Value::Text(raw.to_string())),
            ColumnType::Text => Value::Text(raw.to_string()),
        }
    }

    /// Render for CSV output. Null becomes the empty field.
    pub fn to_csv_field(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            Value::Text(s) => s.clone(),
        }
    }

    /// Contribution to the per-column checksum. Numbers sum their
    /// magnitude, text sums byte lengths, temporals sum epoch units.
    /// Must match what database drivers compute on their side.
    pub fn checksum_component(&self) -> u64 {
        match self {
            Value::Null => 0,
            Value::Bool(b) => *b as u64,
            Value::Int(i) => i.unsigned_abs(),
            Value::Float(f) if f.is_finite() => (f.abs() * 100.0).round() as u64,
            Value::Float(_) => 0,
            Value::Date(d) => d.num_days_from_ce() as u64,
            Value::Timestamp(ts) => ts.timestamp().unsigned_abs(),
            Value::Text(s) => s.len() as u64,
        }
    }

    /// Rough wire size used for byte-rate accounting.
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::Date(_) => 10,
            Value::Timestamp(_) => 23,
            Value::Text(s) => s.len(),
        }
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for layout in TIMESTAMP_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_as_respects_column_type() {
        assert_eq!(Value::parse_as(ColumnType::BigInt, "42"), Value::Int(42));
        assert_eq!(
            Value::parse_as(ColumnType::Decimal, "1.5"),
            Value::Float(1.5)
        );
        assert_eq!(Value::parse_as(ColumnType::Bool, "TRUE"), Value::Bool(true));
        assert_eq!(Value::parse_as(ColumnType::Text, "42"), Value::Text("42".into()));
        assert_eq!(Value::parse_as(ColumnType::BigInt, ""), Value::Null);
    }

    #[test]
    fn nonconforming_field_stays_text() {
        assert_eq!(
            Value::parse_as(ColumnType::BigInt, "n/a"),
            Value::Text("n/a".into())
        );
    }

    #[test]
    fn csv_round_trip() {
        let ts = Value::parse_as(ColumnType::Datetime, "2021-03-01 10:00:00.123");
        assert!(matches!(ts, Value::Timestamp(_)));
        let rendered = ts.to_csv_field();
        assert_eq!(Value::parse_as(ColumnType::Datetime, &rendered), ts);
    }

    #[test]
    fn checksum_components() {
        assert_eq!(Value::Int(-3).checksum_component(), 3);
        assert_eq!(Value::Text("abc".into()).checksum_component(), 3);
        assert_eq!(Value::Float(1.25).checksum_component(), 125);
        assert_eq!(Value::Null.checksum_component(), 0);
    }
}
