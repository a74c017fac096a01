//! Restore orchestrator
//!
//! Runs the write side of a restore: delete every non-identity table child
//! first, then insert every snapshot table parent first. Every failure below
//! the request level is recorded in the report and the run moves on to the
//! next table or record.

use crate::backup::envelope::SnapshotEnvelope;
use crate::backup::value::JsonRow;
use crate::introspection::SchemaCatalog;
use crate::registry::DependencyOrder;
use crate::restore::report::{RestoreReport, TableRestoreResult};
use crate::restore::target::{RestoreTarget, TargetError};
use crate::restore::RestoreMode;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Authorizing,
    Deleting,
    Inserting,
    Reporting,
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestorePhase::Authorizing => write!(f, "authorizing"),
            RestorePhase::Deleting => write!(f, "deleting"),
            RestorePhase::Inserting => write!(f, "inserting"),
            RestorePhase::Reporting => write!(f, "reporting"),
        }
    }
}

/// How one table is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePlan {
    pub name: String,
    pub identity_owned: bool,
    /// Writable columns of the target table in table order; generated columns
    /// are left out. Empty when the table is missing.
    pub columns: Vec<String>,
    /// Primary key columns
    pub key: Vec<String>,
}

/// Tables in dependency order, parents first
#[derive(Debug, Clone, Default)]
pub struct RestorePlan {
    pub tables: Vec<TablePlan>,
    /// Tables emptied in replace mode, children first; only tables the target has
    pub deletions: Vec<String>,
}

impl RestorePlan {
    pub fn new(order: &DependencyOrder, catalog: &SchemaCatalog) -> Self {
        let columns_of = |name: &str| -> Vec<String> {
            catalog
                .table(name)
                .map(|s| {
                    s.columns
                        .iter()
                        .filter(|c| !c.is_generated())
                        .map(|c| c.name.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        let tables = order
            .forward()
            .map(|t| TablePlan {
                name: t.name.clone(),
                identity_owned: t.identity_owned,
                columns: columns_of(&t.name),
                key: catalog.primary_key(&t.name),
            })
            .collect();
        let deletions = order
            .deletable()
            .filter(|t| !columns_of(&t.name).is_empty())
            .map(|t| t.name.clone())
            .collect();
        Self { tables, deletions }
    }
}

pub struct RestoreOrchestrator<'a> {
    target: &'a dyn RestoreTarget,
    batch_size: usize,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(target: &'a dyn RestoreTarget, batch_size: usize) -> Self {
        Self {
            target,
            batch_size: batch_size.max(1),
        }
    }

    /// Delete, insert and report. Always covers every planned table.
    pub async fn run(&self, plan: &RestorePlan, envelope: &SnapshotEnvelope, mode: RestoreMode) -> RestoreReport {
        let mut details: BTreeMap<String, TableRestoreResult> = BTreeMap::new();
        let mut delete_errors = Vec::new();

        if mode == RestoreMode::Replace {
            info!("Restore phase: {}", RestorePhase::Deleting);
            for table in &plan.deletions {
                match self.target.delete_all(table).await {
                    Ok(deleted) => {
                        debug!("Deleted {} rows from {}", deleted, table);
                        details.entry(table.clone()).or_default().deleted = deleted;
                    }
                    Err(e) => {
                        warn!("Delete from {} failed: {}", table, e);
                        delete_errors.push(format!("{}: {}", table, e));
                        details.entry(table.clone()).or_default();
                    }
                }
            }
        }

        info!("Restore phase: {}", RestorePhase::Inserting);
        for table in &plan.tables {
            let rows = envelope.rows(&table.name);
            if rows.is_empty() {
                continue;
            }
            let result = details.entry(table.name.clone()).or_default();
            if table.columns.is_empty() {
                warn!("Table {} is not present in the target", table.name);
                result.errors.push(format!(
                    "{}: table does not exist in the target database; {} rows skipped",
                    table.name,
                    rows.len()
                ));
                continue;
            }

            let columns = supplied_columns(table, rows);
            if table.identity_owned {
                self.upsert_rows(table, &columns, rows, result).await;
            } else {
                self.insert_rows(table, &columns, rows, result).await;
            }
            info!(
                "Restored {}: {}/{} rows inserted, {} errors",
                table.name,
                result.inserted,
                rows.len(),
                result.errors.len()
            );
        }

        info!("Restore phase: {}", RestorePhase::Reporting);
        let processed = plan
            .tables
            .iter()
            .filter(|t| details.contains_key(&t.name))
            .map(|t| t.name.clone())
            .collect();
        RestoreReport::new(processed, details, delete_errors)
    }

    /// One upsert per row, so a row whose identity is missing fails alone
    async fn upsert_rows(
        &self,
        table: &TablePlan,
        columns: &[String],
        rows: &[JsonRow],
        result: &mut TableRestoreResult,
    ) {
        for (index, row) in rows.iter().enumerate() {
            match self.target.upsert_row(&table.name, columns, &table.key, row).await {
                Ok(_) => result.inserted += 1,
                Err(TargetError::MissingReference(e)) => result.errors.push(format!(
                    "{} {}: referenced account is not provisioned yet ({})",
                    table.name,
                    row_label(table, row, index),
                    e
                )),
                Err(e) => result
                    .errors
                    .push(format!("{} {}: {}", table.name, row_label(table, row, index), e)),
            }
        }
    }

    /// Batches first; a failed batch is retried row by row to isolate the bad records
    async fn insert_rows(
        &self,
        table: &TablePlan,
        columns: &[String],
        rows: &[JsonRow],
        result: &mut TableRestoreResult,
    ) {
        for (batch_index, batch) in rows.chunks(self.batch_size).enumerate() {
            let offset = batch_index * self.batch_size;
            let batch_error = match self.target.insert_batch(&table.name, columns, batch).await {
                Ok(inserted) => {
                    result.inserted += inserted;
                    continue;
                }
                Err(e) => e,
            };

            if batch.len() == 1 {
                result.errors.push(format!(
                    "{} {}: {}",
                    table.name,
                    row_label(table, &batch[0], offset),
                    batch_error
                ));
                continue;
            }

            warn!(
                "Batch of {} rows into {} failed ({}); retrying row by row",
                batch.len(),
                table.name,
                batch_error
            );
            for (i, row) in batch.iter().enumerate() {
                match self
                    .target
                    .insert_batch(&table.name, columns, std::slice::from_ref(row))
                    .await
                {
                    Ok(inserted) => result.inserted += inserted,
                    Err(e) => result.errors.push(format!(
                        "{} {}: {}",
                        table.name,
                        row_label(table, row, offset + i),
                        e
                    )),
                }
            }
        }
    }
}

/// Target columns that appear in at least one supplied row, in table order
fn supplied_columns(table: &TablePlan, rows: &[JsonRow]) -> Vec<String> {
    let present: HashSet<&str> = rows.iter().flat_map(|r| r.keys().map(String::as_str)).collect();
    table
        .columns
        .iter()
        .filter(|c| present.contains(c.as_str()))
        .cloned()
        .collect()
}

/// `id=7`, or the row's position when the table has no key
fn row_label(table: &TablePlan, row: &JsonRow, index: usize) -> String {
    if table.key.is_empty() {
        return format!("row #{}", index + 1);
    }
    table
        .key
        .iter()
        .map(|k| {
            let value = row.get(k).map_or("NULL".to_string(), |v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            format!("{}={}", k, value)
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::{ColumnDescriptor, ConstraintDescriptor, ConstraintKind, ForeignReference, TableSchema};
    use crate::registry::TableRegistry;
    use crate::restore::target::memory::{InMemoryTarget, Op};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn plan_table(name: &str, identity_owned: bool, columns: &[&str]) -> TablePlan {
        TablePlan {
            name: name.to_string(),
            identity_owned,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            key: vec!["id".to_string()],
        }
    }

    impl RestorePlan {
        /// Plan over tables already in dependency order
        fn of(tables: Vec<TablePlan>) -> Self {
            let deletions = tables
                .iter()
                .rev()
                .filter(|t| !t.identity_owned && !t.columns.is_empty())
                .map(|t| t.name.clone())
                .collect();
            Self { tables, deletions }
        }
    }

    fn envelope(value: serde_json::Value) -> SnapshotEnvelope {
        SnapshotEnvelope::try_from(value).unwrap()
    }

    fn row(value: serde_json::Value) -> JsonRow {
        value.as_object().cloned().unwrap()
    }

    /// departments <- employees <- asset_assignments, plus identity-owned profiles
    fn company_plan() -> RestorePlan {
        RestorePlan::of(vec![
            plan_table("departments", false, &["id", "name"]),
            plan_table("profiles", true, &["id", "full_name"]),
            plan_table("employees", false, &["id", "name", "department_id", "profile_id"]),
        ])
    }

    fn company_target() -> InMemoryTarget {
        InMemoryTarget::default()
            .with_foreign_key("employees", "department_id", "departments")
            .with_foreign_key("employees", "profile_id", "profiles")
    }

    #[tokio::test]
    async fn test_parent_and_child_restore_into_empty_database() {
        let target = InMemoryTarget::default().with_foreign_key("b", "a_id", "a");
        let plan = RestorePlan::of(vec![plan_table("a", false, &["id"]), plan_table("b", false, &["id", "a_id"])]);
        let snapshot = envelope(json!({
            "a": [{"id": 1}, {"id": 2}],
            "b": [{"id": 10, "a_id": 1}, {"id": 11, "a_id": 2}, {"id": 12, "a_id": 2}]
        }));

        let report = RestoreOrchestrator::new(&target, 100)
            .run(&plan, &snapshot, RestoreMode::Replace)
            .await;

        assert_eq!(report.details["a"].inserted, 2);
        assert_eq!(report.details["b"].inserted, 3);
        assert_eq!(report.summary.total_errors, 0);
        assert_eq!(report.summary.total_records, 5);
        assert!(report.success);
        assert_eq!(target.count("b"), 3);
    }

    #[tokio::test]
    async fn test_deletes_run_child_first_and_skip_identity_owned() {
        let target = company_target();
        let snapshot = envelope(json!({}));

        for mode in [RestoreMode::Replace, RestoreMode::Merge] {
            RestoreOrchestrator::new(&target, 100)
                .run(&company_plan(), &snapshot, mode)
                .await;
        }

        assert_eq!(
            target.ops(),
            vec![Op::Delete("employees".into()), Op::Delete("departments".into())]
        );
    }

    #[tokio::test]
    async fn test_delete_failure_does_not_stop_inserts() {
        let target = company_target()
            .with_rows("departments", vec![row(json!({"id": 1, "name": "Old"}))])
            .failing_delete("employees");
        let snapshot = envelope(json!({
            "departments": [{"id": 2, "name": "Ops"}],
            "profiles": [{"id": "u-1", "full_name": "Asha"}],
            "employees": [{"id": 5, "name": "Asha", "department_id": 2, "profile_id": "u-1"}]
        }));

        let report = RestoreOrchestrator::new(&target, 100)
            .run(&company_plan(), &snapshot, RestoreMode::Replace)
            .await;

        assert_eq!(report.delete_errors.len(), 1);
        assert!(report.delete_errors[0].starts_with("employees:"));
        assert_eq!(report.summary.delete_errors, 1);
        assert_eq!(report.summary.total_records, 3);
        assert_eq!(report.details["departments"].deleted, 1);
        assert!(!report.success);
    }

    #[tokio::test]
    async fn test_missing_identity_fails_only_that_record() {
        let target = InMemoryTarget::default()
            .with_rows("accounts", vec![row(json!({"id": "u-1"})), row(json!({"id": "u-2"}))])
            .with_foreign_key("profiles", "id", "accounts");
        let plan = RestorePlan::of(vec![plan_table("profiles", true, &["id", "full_name"])]);
        let snapshot = envelope(json!({
            "profiles": [
                {"id": "u-1", "full_name": "Asha"},
                {"id": "u-9", "full_name": "Ghost"},
                {"id": "u-2", "full_name": "Ravi"}
            ]
        }));

        let report = RestoreOrchestrator::new(&target, 100)
            .run(&plan, &snapshot, RestoreMode::Replace)
            .await;

        let profiles = &report.details["profiles"];
        assert_eq!(profiles.inserted, 2);
        assert_eq!(profiles.errors.len(), 1);
        assert!(profiles.errors[0].contains("id=u-9"));
        assert!(profiles.errors[0].contains("not provisioned"));
    }

    #[tokio::test]
    async fn test_failed_batch_falls_back_to_single_rows() {
        let target = company_target()
            .with_rows("departments", vec![row(json!({"id": 1, "name": "Ops"}))])
            .failing_batches("employees");
        let plan = RestorePlan::of(vec![plan_table("employees", false, &["id", "name", "department_id"])]);
        let snapshot = envelope(json!({
            "employees": [
                {"id": 1, "name": "A", "department_id": 1},
                {"id": 2, "name": "B", "department_id": 99},
                {"id": 3, "name": "C", "department_id": 1}
            ]
        }));

        let report = RestoreOrchestrator::new(&target, 100)
            .run(&plan, &snapshot, RestoreMode::Merge)
            .await;

        let employees = &report.details["employees"];
        assert_eq!(employees.inserted, 2);
        assert_eq!(employees.errors.len(), 1);
        assert!(employees.errors[0].starts_with("employees id=2:"));
    }

    #[tokio::test]
    async fn test_rows_are_sent_in_batches_of_configured_size() {
        let target = InMemoryTarget::default();
        let plan = RestorePlan::of(vec![plan_table("assets", false, &["id"])]);
        let rows: Vec<serde_json::Value> = (0..250).map(|i| json!({"id": i})).collect();
        let snapshot = envelope(json!({ "assets": rows }));

        let report = RestoreOrchestrator::new(&target, 100)
            .run(&plan, &snapshot, RestoreMode::Merge)
            .await;

        assert_eq!(report.details["assets"].inserted, 250);
        assert_eq!(
            target.ops(),
            vec![
                Op::InsertBatch("assets".into(), 100),
                Op::InsertBatch("assets".into(), 100),
                Op::InsertBatch("assets".into(), 50),
            ]
        );
    }

    #[tokio::test]
    async fn test_merge_keeps_existing_rows() {
        let target = InMemoryTarget::default().with_rows("assets", vec![row(json!({"id": 1}))]);
        let plan = RestorePlan::of(vec![plan_table("assets", false, &["id"])]);
        let snapshot = envelope(json!({"assets": [{"id": 1}, {"id": 2}]}));

        let report = RestoreOrchestrator::new(&target, 100)
            .run(&plan, &snapshot, RestoreMode::Merge)
            .await;

        assert_eq!(report.details["assets"].inserted, 1);
        assert_eq!(target.count("assets"), 2);
        assert!(report.success);
    }

    #[tokio::test]
    async fn test_table_missing_from_target_is_reported() {
        let target = InMemoryTarget::default();
        let plan = RestorePlan::of(vec![plan_table("legacy_notes", false, &[])]);
        let snapshot = envelope(json!({"legacy_notes": [{"id": 1}, {"id": 2}]}));

        let report = RestoreOrchestrator::new(&target, 100)
            .run(&plan, &snapshot, RestoreMode::Merge)
            .await;

        assert_eq!(report.details["legacy_notes"].errors.len(), 1);
        assert_eq!(report.details["legacy_notes"].inserted, 0);
        assert!(target.ops().is_empty());
    }

    #[test]
    fn test_plan_follows_live_order_and_skips_generated_columns() {
        let column = |name: &str, generated: Option<&str>| ColumnDescriptor {
            name: name.to_string(),
            data_type: "integer".to_string(),
            udt_name: "int4".to_string(),
            nullable: true,
            default_value: None,
            max_length: None,
            numeric_precision: None,
            numeric_scale: None,
            identity: None,
            generated: generated.map(str::to_string),
        };
        let table = |name: &str, columns: Vec<ColumnDescriptor>| TableSchema {
            name: name.to_string(),
            columns,
            primary_key: None,
            unique_constraints: vec![],
        };
        let mut catalog = SchemaCatalog::empty("public");
        catalog.tables.push(table(
            "invoices",
            vec![column("id", None), column("customer_id", None), column("total", Some("(amount * 2)"))],
        ));
        catalog.tables.push(table("customers", vec![column("id", None)]));
        catalog.tables.push(table("profiles", vec![column("id", None)]));
        catalog.foreign_keys.push(ConstraintDescriptor {
            name: "invoices_customer_id_fkey".to_string(),
            kind: ConstraintKind::ForeignKey,
            table: "invoices".to_string(),
            columns: vec!["customer_id".to_string()],
            references: Some(ForeignReference {
                schema: "public".to_string(),
                table: "customers".to_string(),
                columns: vec!["id".to_string()],
            }),
        });
        let tables: Vec<String> = ["invoices", "customers", "profiles", "archived_notes"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        let order = TableRegistry::new(Vec::new(), vec!["profiles".to_string()])
            .resolve("public", &tables, &catalog.foreign_keys);

        let plan = RestorePlan::new(&order, &catalog);

        let names: Vec<&str> = plan.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["customers", "invoices", "profiles", "archived_notes"]);
        assert_eq!(plan.tables[1].columns, vec!["id", "customer_id"]);
        assert_eq!(plan.deletions, vec!["invoices", "customers"]);
    }

    #[test]
    fn test_supplied_columns_keep_table_order() {
        let table = plan_table("employees", false, &["id", "name", "department_id"]);
        let rows = vec![row(json!({"department_id": 1, "id": 1, "extra": true}))];
        assert_eq!(supplied_columns(&table, &rows), vec!["id", "department_id"]);
    }
}
