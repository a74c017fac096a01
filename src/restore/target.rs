//! Restore destination
//!
//! The orchestrator writes through [`RestoreTarget`]. The Postgres adapter
//! lets the server coerce JSON rows into the table's row type with
//! `json_populate_record[set]`, so no per-type binding is needed.

use crate::backup::value::JsonRow;
use crate::sql::{quote_ident, quote_ident_list, quote_qualified};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use thiserror::Error;
use tokio_postgres::error::SqlState;

#[derive(Debug, Error)]
pub enum TargetError {
    /// A foreign key points at a row that does not exist (SQLSTATE 23503)
    #[error("missing referenced record: {0}")]
    MissingReference(String),

    #[error("{0}")]
    Statement(String),

    #[error("connection unavailable: {0}")]
    Connection(String),
}

impl From<tokio_postgres::Error> for TargetError {
    fn from(e: tokio_postgres::Error) -> Self {
        let Some(db) = e.as_db_error() else {
            return TargetError::Statement(e.to_string());
        };
        let mut message = db.message().to_string();
        if let Some(detail) = db.detail() {
            message.push_str(": ");
            message.push_str(detail);
        }
        if db.code() == &SqlState::FOREIGN_KEY_VIOLATION {
            TargetError::MissingReference(message)
        } else {
            TargetError::Statement(message)
        }
    }
}

impl From<deadpool_postgres::PoolError> for TargetError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        TargetError::Connection(e.to_string())
    }
}

#[async_trait]
pub trait RestoreTarget: Send + Sync {
    /// Remove every row; returns the number deleted
    async fn delete_all(&self, table: &str) -> Result<u64, TargetError>;

    /// Insert `rows` as one statement, skipping rows that conflict.
    /// Either every row is attempted or none is.
    async fn insert_batch(&self, table: &str, columns: &[String], rows: &[JsonRow]) -> Result<u64, TargetError>;

    /// Insert one row, or overwrite the row with the same `key`
    async fn upsert_row(
        &self,
        table: &str,
        columns: &[String],
        key: &[String],
        row: &JsonRow,
    ) -> Result<u64, TargetError>;
}

pub struct PgRestoreTarget {
    pool: Pool,
    schema: String,
}

impl PgRestoreTarget {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }
}

/// Snapshot keys win over identity defaults, including `GENERATED ALWAYS`
fn insert_batch_sql(schema: &str, table: &str, columns: &[String]) -> String {
    let target = quote_qualified(schema, table);
    let cols = quote_ident_list(columns);
    format!(
        "INSERT INTO {target} ({cols}) OVERRIDING SYSTEM VALUE SELECT {cols} FROM json_populate_recordset(NULL::{target}, $1::json) ON CONFLICT DO NOTHING"
    )
}

fn upsert_sql(schema: &str, table: &str, columns: &[String], key: &[String]) -> String {
    let target = quote_qualified(schema, table);
    let cols = quote_ident_list(columns);
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !key.contains(*c))
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {target} ({cols}) OVERRIDING SYSTEM VALUE SELECT {cols} FROM json_populate_record(NULL::{target}, $1::json) ON CONFLICT ({}) {action}",
        quote_ident_list(key)
    )
}

#[async_trait]
impl RestoreTarget for PgRestoreTarget {
    async fn delete_all(&self, table: &str) -> Result<u64, TargetError> {
        let client = self.pool.get().await?;
        let sql = format!("DELETE FROM {}", quote_qualified(&self.schema, table));
        Ok(client.execute(sql.as_str(), &[]).await?)
    }

    async fn insert_batch(&self, table: &str, columns: &[String], rows: &[JsonRow]) -> Result<u64, TargetError> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }
        let client = self.pool.get().await?;
        let payload = serde_json::Value::Array(
            rows.iter().cloned().map(serde_json::Value::Object).collect(),
        );
        let sql = insert_batch_sql(&self.schema, table, columns);
        Ok(client.execute(sql.as_str(), &[&payload]).await?)
    }

    async fn upsert_row(
        &self,
        table: &str,
        columns: &[String],
        key: &[String],
        row: &JsonRow,
    ) -> Result<u64, TargetError> {
        if key.is_empty() {
            return Err(TargetError::Statement(format!("{} has no primary key to upsert on", table)));
        }
        let client = self.pool.get().await?;
        let payload = serde_json::Value::Object(row.clone());
        let sql = upsert_sql(&self.schema, table, columns, key);
        Ok(client.execute(sql.as_str(), &[&payload]).await?)
    }
}

#[cfg(test)]
pub mod memory {
    //! In-memory restore target with foreign key checks and failure injection

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Op {
        Delete(String),
        InsertBatch(String, usize),
        Upsert(String),
    }

    /// `child.column` must match an `id` in `parent`
    struct ForeignKey {
        child: String,
        column: String,
        parent: String,
    }

    #[derive(Default)]
    pub struct InMemoryTarget {
        pub tables: Mutex<HashMap<String, Vec<JsonRow>>>,
        foreign_keys: Vec<ForeignKey>,
        failing_deletes: HashSet<String>,
        /// Multi-row batches on these tables fail regardless of content
        failing_batches: HashSet<String>,
        pub ops: Mutex<Vec<Op>>,
    }

    impl InMemoryTarget {
        pub fn with_rows(self, table: &str, rows: Vec<JsonRow>) -> Self {
            self.tables.lock().unwrap().insert(table.to_string(), rows);
            self
        }

        pub fn with_foreign_key(mut self, child: &str, column: &str, parent: &str) -> Self {
            self.foreign_keys.push(ForeignKey {
                child: child.to_string(),
                column: column.to_string(),
                parent: parent.to_string(),
            });
            self
        }

        pub fn failing_delete(mut self, table: &str) -> Self {
            self.failing_deletes.insert(table.to_string());
            self
        }

        pub fn failing_batches(mut self, table: &str) -> Self {
            self.failing_batches.insert(table.to_string());
            self
        }

        pub fn count(&self, table: &str) -> usize {
            self.tables.lock().unwrap().get(table).map_or(0, Vec::len)
        }

        pub fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        fn check_references(
            &self,
            tables: &HashMap<String, Vec<JsonRow>>,
            table: &str,
            row: &JsonRow,
        ) -> Result<(), TargetError> {
            for fk in self.foreign_keys.iter().filter(|fk| fk.child == table) {
                let Some(value) = row.get(&fk.column).filter(|v| !v.is_null()) else { continue };
                let exists = tables
                    .get(&fk.parent)
                    .is_some_and(|rows| rows.iter().any(|r| r.get("id") == Some(value)));
                if !exists {
                    return Err(TargetError::MissingReference(format!(
                        "Key ({})=({}) is not present in table \"{}\".",
                        fk.column, value, fk.parent
                    )));
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RestoreTarget for InMemoryTarget {
        async fn delete_all(&self, table: &str) -> Result<u64, TargetError> {
            self.ops.lock().unwrap().push(Op::Delete(table.to_string()));
            if self.failing_deletes.contains(table) {
                return Err(TargetError::Statement(format!("permission denied for table {}", table)));
            }
            let removed = self.tables.lock().unwrap().remove(table).map_or(0, |rows| rows.len());
            Ok(removed as u64)
        }

        async fn insert_batch(&self, table: &str, _columns: &[String], rows: &[JsonRow]) -> Result<u64, TargetError> {
            self.ops.lock().unwrap().push(Op::InsertBatch(table.to_string(), rows.len()));
            if rows.len() > 1 && self.failing_batches.contains(table) {
                return Err(TargetError::Statement("batch rejected".to_string()));
            }

            let mut tables = self.tables.lock().unwrap();
            for row in rows {
                self.check_references(&tables, table, row)?;
            }
            let existing = tables.entry(table.to_string()).or_default();
            let mut inserted = 0;
            for row in rows {
                if existing.iter().any(|r| r.get("id") == row.get("id")) {
                    continue;
                }
                existing.push(row.clone());
                inserted += 1;
            }
            Ok(inserted)
        }

        async fn upsert_row(
            &self,
            table: &str,
            _columns: &[String],
            _key: &[String],
            row: &JsonRow,
        ) -> Result<u64, TargetError> {
            self.ops.lock().unwrap().push(Op::Upsert(table.to_string()));
            let mut tables = self.tables.lock().unwrap();
            self.check_references(&tables, table, row)?;
            let existing = tables.entry(table.to_string()).or_default();
            existing.retain(|r| r.get("id") != row.get("id"));
            existing.push(row.clone());
            Ok(1)
        }
    }
}
