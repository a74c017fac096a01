//! Row pagination
//!
//! Fetches every row of a table in fixed-size pages until a short page
//! signals exhaustion.

use crate::backup::value::JsonRow;
use crate::db::queries;
use crate::introspection::SchemaCatalog;
use crate::sql::{quote_ident, quote_ident_list, quote_qualified};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("connection unavailable: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("malformed row: {0}")]
    Malformed(String),
}

/// A column as selected by the page query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadColumn {
    pub name: String,
    pub cast: Option<&'static str>,
}

/// What to read from one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRead {
    pub table: String,
    /// Primary key columns; pages are unordered when empty
    pub order_by: Vec<String>,
    /// Explicit select list; empty selects every column as stored
    pub columns: Vec<ReadColumn>,
}

impl TableRead {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Order by the primary key and read exact numerics as text
    pub fn from_catalog(catalog: &SchemaCatalog, table: &str) -> Self {
        let columns = catalog
            .table(table)
            .map(|t| {
                t.columns
                    .iter()
                    .map(|c| ReadColumn {
                        name: c.name.clone(),
                        cast: c.exact_text_cast(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            order_by: catalog.primary_key(table),
            columns,
            ..Self::new(table)
        }
    }

    fn select_list(&self) -> String {
        if self.columns.iter().all(|c| c.cast.is_none()) {
            return "*".to_string();
        }
        self.columns
            .iter()
            .map(|c| match c.cast {
                Some(cast) => format!("{}::{} AS {}", quote_ident(&c.name), cast, quote_ident(&c.name)),
                None => quote_ident(&c.name),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Source of table rows, one page at a time
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Rows `offset..offset + limit` of `read.table`
    async fn fetch_page(&self, read: &TableRead, offset: usize, limit: usize) -> Result<Vec<JsonRow>, FetchError>;
}

/// All rows of one table, or why they could not be read
#[derive(Debug)]
pub struct TableRows {
    pub table: String,
    pub rows: Vec<JsonRow>,
    pub error: Option<String>,
}

pub struct Paginator<'a> {
    source: &'a dyn RowSource,
    page_size: usize,
}

impl<'a> Paginator<'a> {
    pub fn new(source: &'a dyn RowSource, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
        }
    }

    /// Read a whole table.
    ///
    /// A failing page stops the table; it is then reported empty with the
    /// error so a partial capture is never mistaken for a complete one.
    pub async fn fetch_all(&self, read: &TableRead) -> TableRows {
        let table = read.table.as_str();
        let mut rows = Vec::new();
        let mut offset = 0;

        loop {
            match self.source.fetch_page(read, offset, self.page_size).await {
                Ok(page) => {
                    let fetched = page.len();
                    rows.extend(page);
                    if fetched < self.page_size {
                        break;
                    }
                    offset += fetched;
                }
                Err(e) => {
                    warn!("Row fetch for {} failed at offset {}: {}", table, offset, e);
                    return TableRows {
                        table: table.to_string(),
                        rows: Vec::new(),
                        error: Some(format!("{}: {}", table, e)),
                    };
                }
            }
        }

        debug!("Fetched {} rows from {}", rows.len(), table);
        TableRows {
            table: table.to_string(),
            rows,
            error: None,
        }
    }
}

/// Reads pages with `row_to_json`, so every column type arrives as JSON
pub struct PgRowSource {
    pool: Pool,
    schema: String,
}

impl PgRowSource {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }
}

fn page_query(schema: &str, read: &TableRead) -> String {
    let order = if read.order_by.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", quote_ident_list(&read.order_by))
    };
    queries::PAGE_TEMPLATE
        .replace("{columns}", &read.select_list())
        .replace("{table}", &quote_qualified(schema, &read.table))
        .replace("{order}", &order)
}

#[async_trait]
impl RowSource for PgRowSource {
    async fn fetch_page(&self, read: &TableRead, offset: usize, limit: usize) -> Result<Vec<JsonRow>, FetchError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| FetchError::Connection(e.to_string()))?;

        let limit = i64::try_from(limit).map_err(|e| FetchError::Query(e.to_string()))?;
        let offset = i64::try_from(offset).map_err(|e| FetchError::Query(e.to_string()))?;

        let rows = client
            .query(page_query(&self.schema, read).as_str(), &[&limit, &offset])
            .await
            .map_err(|e| FetchError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let text: String = row.get("row");
                match serde_json::from_str(&text) {
                    Ok(serde_json::Value::Object(map)) => Ok(map),
                    Ok(other) => Err(FetchError::Malformed(format!("expected object, got {}", other))),
                    Err(e) => Err(FetchError::Malformed(e.to_string())),
                }
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::memory::InMemoryRowSource;
    use super::*;
    use crate::introspection::{ColumnDescriptor, TableSchema};
    use serde_json::json;

    fn rows(n: usize) -> Vec<JsonRow> {
        (0..n)
            .map(|i| json!({ "id": i }).as_object().cloned().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_stops_on_short_page() {
        let source = InMemoryRowSource::default().with_table("assets", rows(25));
        let paginator = Paginator::new(&source, 10);

        let result = paginator.fetch_all(&TableRead::new("assets")).await;

        assert_eq!(result.rows.len(), 25);
        assert!(result.error.is_none());
        let offsets: Vec<usize> = source.calls.lock().unwrap().iter().map(|c| c.1).collect();
        assert_eq!(offsets, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn test_exact_multiple_needs_one_empty_page() {
        let source = InMemoryRowSource::default().with_table("assets", rows(20));
        let paginator = Paginator::new(&source, 10);

        let result = paginator.fetch_all(&TableRead::new("assets")).await;

        assert_eq!(result.rows.len(), 20);
        assert_eq!(source.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_page_error_reports_table_empty() {
        let source = InMemoryRowSource::default()
            .with_table("assets", rows(25))
            .failing_at("assets", 10);
        let paginator = Paginator::new(&source, 10);

        let result = paginator.fetch_all(&TableRead::new("assets")).await;

        assert!(result.rows.is_empty());
        assert!(result.error.unwrap().contains("locked"));
    }

    #[test]
    fn test_page_query_orders_by_primary_key() {
        let read = TableRead {
            order_by: vec!["id".to_string()],
            ..TableRead::new("assets")
        };
        assert_eq!(
            page_query("public", &read),
            "SELECT row_to_json(t)::text AS row FROM (SELECT * FROM \"public\".\"assets\" ORDER BY \"id\" LIMIT $1 OFFSET $2) t"
        );
    }

    #[test]
    fn test_numeric_columns_are_read_as_text() {
        let column = |name: &str, udt: &str| ColumnDescriptor {
            name: name.to_string(),
            data_type: if udt.starts_with('_') { "ARRAY" } else { "numeric" }.to_string(),
            udt_name: udt.to_string(),
            nullable: true,
            default_value: None,
            max_length: None,
            numeric_precision: None,
            numeric_scale: None,
            identity: None,
            generated: None,
        };
        let mut catalog = SchemaCatalog::empty("public");
        catalog.tables.push(TableSchema {
            name: "ledger".to_string(),
            columns: vec![column("id", "int4"), column("amount", "numeric"), column("rates", "_numeric")],
            primary_key: None,
            unique_constraints: vec![],
        });

        let read = TableRead::from_catalog(&catalog, "ledger");

        assert_eq!(
            page_query("public", &read),
            "SELECT row_to_json(t)::text AS row FROM (SELECT \"id\", \"amount\"::text AS \"amount\", \"rates\"::text[] AS \"rates\" FROM \"public\".\"ledger\" LIMIT $1 OFFSET $2) t"
        );
    }
}
