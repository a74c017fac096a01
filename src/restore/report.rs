//! Restore report types

use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome for one table
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TableRestoreResult {
    pub deleted: u64,
    pub inserted: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub total_tables: usize,
    pub total_records: u64,
    pub total_errors: usize,
    pub delete_errors: usize,
    pub tables_processed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub success: bool,
    pub summary: RestoreSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub delete_errors: Vec<String>,
    pub details: BTreeMap<String, TableRestoreResult>,
}

impl RestoreReport {
    /// Aggregate per-table results. `processed` lists tables in the order
    /// they were first touched.
    pub fn new(
        processed: Vec<String>,
        details: BTreeMap<String, TableRestoreResult>,
        delete_errors: Vec<String>,
    ) -> Self {
        let total_errors: usize = details.values().map(|r| r.errors.len()).sum();
        let summary = RestoreSummary {
            total_tables: processed.len(),
            total_records: details.values().map(|r| r.inserted).sum(),
            total_errors,
            delete_errors: delete_errors.len(),
            tables_processed: processed,
        };
        Self {
            success: total_errors == 0 && delete_errors.is_empty(),
            summary,
            delete_errors,
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summary_totals() {
        let mut details = BTreeMap::new();
        details.insert(
            "departments".to_string(),
            TableRestoreResult { deleted: 4, inserted: 2, errors: vec![] },
        );
        details.insert(
            "employees".to_string(),
            TableRestoreResult { deleted: 0, inserted: 2, errors: vec!["employees: id=3 failed".into()] },
        );

        let report = RestoreReport::new(
            vec!["departments".to_string(), "employees".to_string()],
            details,
            vec!["employees: permission denied".to_string()],
        );

        assert!(!report.success);
        assert_eq!(report.summary.total_records, 4);
        assert_eq!(report.summary.total_errors, 1);
        assert_eq!(report.summary.delete_errors, 1);
    }

    #[test]
    fn test_serialized_shape() {
        let report = RestoreReport::new(vec![], BTreeMap::new(), vec![]);
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(
            value,
            json!({
                "success": true,
                "summary": {
                    "totalTables": 0,
                    "totalRecords": 0,
                    "totalErrors": 0,
                    "deleteErrors": 0,
                    "tablesProcessed": []
                },
                "details": {}
            })
        );
    }
}
