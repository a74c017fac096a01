//! Snapshot builder
//!
//! Captures every table in dependency order through the [`Paginator`] and
//! assembles the JSON envelope.

use crate::backup::envelope::{SnapshotEnvelope, TableSnapshot};
use crate::backup::paginator::{Paginator, RowSource, TableRead, TableRows};
use crate::backup::value::{decode_row, encode_json_row};
use crate::introspection::SchemaCatalog;
use crate::registry::DependencyOrder;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::info;

/// Envelope plus the per-table accounting the backup response reports
#[derive(Debug)]
pub struct BuiltSnapshot {
    pub envelope: SnapshotEnvelope,
    pub record_counts: BTreeMap<String, usize>,
    pub errors: Vec<String>,
}

pub struct SnapshotBuilder<'a> {
    paginator: Paginator<'a>,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(source: &'a dyn RowSource, page_size: usize) -> Self {
        Self {
            paginator: Paginator::new(source, page_size),
        }
    }

    /// Read every table, strictly one after another, ordered by primary key
    /// where the table has one
    pub async fn capture(&self, catalog: &SchemaCatalog, order: &DependencyOrder) -> Vec<TableRows> {
        let mut captured = Vec::with_capacity(order.len());
        for table in order.forward() {
            let read = TableRead::from_catalog(catalog, &table.name);
            captured.push(self.paginator.fetch_all(&read).await);
        }
        captured
    }
}

/// Normalize captured rows through the typed decoder and wrap them in an envelope.
///
/// A table whose fetch failed is kept, empty, so the envelope still lists it.
pub fn assemble(
    catalog: &SchemaCatalog,
    captured: Vec<TableRows>,
    captured_at: DateTime<Utc>,
) -> BuiltSnapshot {
    let mut record_counts = BTreeMap::new();
    let mut errors = Vec::new();
    let mut tables = Vec::with_capacity(captured.len());

    for table in captured {
        if let Some(error) = table.error {
            errors.push(error);
        }
        let columns = catalog.columns_by_name(&table.table);
        let rows: Vec<_> = table
            .rows
            .into_iter()
            .map(|row| encode_json_row(&decode_row(row, &columns)))
            .collect();

        record_counts.insert(table.table.clone(), rows.len());
        tables.push(TableSnapshot {
            name: table.table,
            rows,
        });
    }

    let envelope = SnapshotEnvelope::new(tables, captured_at);
    info!(
        "Snapshot assembled: {} tables, {} records, {} errors",
        envelope.metadata().total_tables,
        envelope.metadata().total_records,
        errors.len()
    );

    BuiltSnapshot {
        envelope,
        record_counts,
        errors,
    }
}
