//! Snapshot envelope
//!
//! The JSON artifact produced by a backup and consumed by a restore:
//! a `_metadata` block followed by one array of row objects per table.
//! Flat `{ table: [rows] }` documents without metadata are accepted too.

use crate::backup::value::JsonRow;
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

pub const BACKUP_VERSION: &str = "2.0";
const METADATA_KEY: &str = "_metadata";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("snapshot must be a JSON object of tables")]
    NotAnObject,

    #[error("invalid _metadata block: {0}")]
    Metadata(String),

    #[error("table \"{0}\" must be an array of row objects")]
    InvalidTable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMetadata {
    pub backup_version: String,
    pub backup_date: DateTime<Utc>,
    pub total_tables: usize,
    pub total_records: usize,
    pub tables_backed_up: Vec<String>,
}

/// A captured table's rows
#[derive(Debug, Clone, PartialEq)]
pub struct TableSnapshot {
    pub name: String,
    pub rows: Vec<JsonRow>,
}

/// Immutable once built
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "serde_json::Value")]
pub struct SnapshotEnvelope {
    metadata: SnapshotMetadata,
    tables: Vec<TableSnapshot>,
}

impl SnapshotEnvelope {
    /// Assemble an envelope; metadata is derived from the tables
    pub fn new(tables: Vec<TableSnapshot>, captured_at: DateTime<Utc>) -> Self {
        let metadata = SnapshotMetadata {
            backup_version: BACKUP_VERSION.to_string(),
            backup_date: captured_at,
            total_tables: tables.len(),
            total_records: tables.iter().map(|t| t.rows.len()).sum(),
            tables_backed_up: tables.iter().map(|t| t.name.clone()).collect(),
        };
        Self { metadata, tables }
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn rows(&self, table: &str) -> &[JsonRow] {
        self.tables
            .iter()
            .find(|t| t.name == table)
            .map(|t| t.rows.as_slice())
            .unwrap_or(&[])
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

impl Serialize for SnapshotEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.tables.len() + 1))?;
        map.serialize_entry(METADATA_KEY, &self.metadata)?;
        for table in &self.tables {
            map.serialize_entry(&table.name, &table.rows)?;
        }
        map.end()
    }
}

impl TryFrom<serde_json::Value> for SnapshotEnvelope {
    type Error = EnvelopeError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        let serde_json::Value::Object(document) = value else {
            return Err(EnvelopeError::NotAnObject);
        };

        let mut metadata = None;
        let mut tables = Vec::new();
        for (key, value) in document {
            if key == METADATA_KEY {
                let parsed: SnapshotMetadata = serde_json::from_value(value)
                    .map_err(|e| EnvelopeError::Metadata(e.to_string()))?;
                metadata = Some(parsed);
                continue;
            }

            let serde_json::Value::Array(items) = value else {
                return Err(EnvelopeError::InvalidTable(key));
            };
            let rows = items
                .into_iter()
                .map(|item| match item {
                    serde_json::Value::Object(row) => Ok(row),
                    _ => Err(EnvelopeError::InvalidTable(key.clone())),
                })
                .collect::<Result<Vec<_>, _>>()?;
            tables.push(TableSnapshot { name: key, rows });
        }

        Ok(match metadata {
            Some(metadata) => Self { metadata, tables },
            // Legacy flat map: synthesize metadata from the content
            None => Self::new(tables, Utc::now()),
        })
    }
}
