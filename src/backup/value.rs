//! Tagged row values
//!
//! Rows arrive from the database as JSON objects. The schema-aware decoder
//! turns each column into a [`Value`] using its catalog type, and the two
//! encoders render a value either as a SQL literal (dump) or as a JSON value
//! (snapshot).

use crate::introspection::ColumnDescriptor;
use crate::sql::quote_literal;
use serde_json::{Map, Number};
use std::collections::HashMap;

/// JSON row as carried by snapshots: column name to value, in column order
pub type JsonRow = Map<String, serde_json::Value>;

/// A single column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
    /// Exact `numeric`, kept as its text rendering
    Decimal(String),
    Array(Vec<Value>),
    /// Value of a `json`/`jsonb` column, or any object
    Json(serde_json::Value),
}

/// Column name and decoded value, in column order
pub type Row = Vec<(String, Value)>;

impl Value {
    /// Decode by JSON shape alone
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            object @ serde_json::Value::Object(_) => Value::Json(object),
        }
    }

    /// Decode using the column's catalog type; json/jsonb columns stay whole
    pub fn decode(value: serde_json::Value, column: Option<&ColumnDescriptor>) -> Self {
        match (column, value) {
            (_, serde_json::Value::Null) => Value::Null,
            (Some(col), value) if col.is_json() => Value::Json(value),
            (Some(col), value) if col.exact_text_cast().is_some() => Value::decimal(value),
            (_, value) => Value::from_json(value),
        }
    }

    fn decimal(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Value::Decimal(s),
            serde_json::Value::Number(n) => Value::Decimal(n.to_string()),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::decimal).collect()),
            other => Value::from_json(other),
        }
    }

    /// Transport-safe JSON
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::Text(s) | Value::Decimal(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Json(v) => v.clone(),
        }
    }

    /// SQL literal for an `INSERT` statement.
    ///
    /// JSON values are cast to the column's own type (`json` or `jsonb`,
    /// defaulting to `jsonb` when the column is unknown).
    pub fn to_sql_literal(&self, column: Option<&ColumnDescriptor>) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Number(n) => n.to_string(),
            Value::Text(s) => quote_literal(s),
            Value::Decimal(s) if is_plain_decimal(s) => s.clone(),
            Value::Decimal(s) => format!("{}::numeric", quote_literal(s)),
            Value::Array(items) => {
                let body = array_body(items).replace('\'', "''");
                format!("'{}'", body)
            }
            Value::Json(v) => {
                let cast = column
                    .filter(|c| c.is_json())
                    .map_or("jsonb", |c| c.udt_name.as_str());
                format!("{}::{}", quote_literal(&v.to_string()), cast)
            }
        }
    }
}

/// Postgres array literal body, e.g. `{"a","b"}`
fn array_body(items: &[Value]) -> String {
    let elements: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Decimal(s) if is_plain_decimal(s) => s.clone(),
            Value::Text(s) | Value::Decimal(s) => quote_array_element(s),
            Value::Array(inner) => array_body(inner),
            Value::Json(v) => quote_array_element(&v.to_string()),
        })
        .collect();
    format!("{{{}}}", elements.join(","))
}

/// Digits with an optional sign, point and exponent; anything else (`NaN`,
/// `Infinity`) must be quoted
fn is_plain_decimal(text: &str) -> bool {
    text.chars().any(|c| c.is_ascii_digit())
        && text.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
}

fn quote_array_element(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Decode a JSON row against its table's columns, keeping the row's key order
pub fn decode_row(row: JsonRow, columns: &HashMap<&str, &ColumnDescriptor>) -> Row {
    row.into_iter()
        .map(|(name, value)| {
            let decoded = Value::decode(value, columns.get(name.as_str()).copied());
            (name, decoded)
        })
        .collect()
}

/// Re-encode a decoded row as a snapshot JSON object
pub fn encode_json_row(row: &Row) -> JsonRow {
    row.iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect()
}
