//! Backup engine
//!
//! Entry points for a JSON snapshot run and a SQL export. Both introspect
//! the live schema, resolve the dependency order once and read every table
//! through the paginator. Publishing, notification and status recording are
//! best-effort and never fail a run that captured data.

pub mod builder;
pub mod ddl;
pub mod envelope;
pub mod paginator;
pub mod value;

pub use builder::{assemble, SnapshotBuilder};
pub use ddl::DdlSynthesizer;
pub use envelope::{SnapshotEnvelope, SnapshotMetadata};
pub use paginator::{PgRowSource, RowSource};

use crate::error::AppError;
use crate::introspection::{CatalogReader, IntrospectionScope, SchemaCatalog};
use crate::notify::{BackupSummary, NotificationSender};
use crate::registry::{is_engine_table, DependencyOrder, TableRegistry};
use crate::schedule::{verify_scheduler_token, BackupRunStatus, BackupStatus, ScheduleStore, ScheduledJob};
use crate::storage::StoragePublisher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Response of a JSON backup run
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupResponse {
    pub success: bool,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub metadata: SnapshotMetadata,
    pub record_counts: BTreeMap<String, usize>,
    pub backup_data: SnapshotEnvelope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

/// A rendered SQL document
#[derive(Debug)]
pub struct SqlExport {
    pub file_name: String,
    pub sql: String,
    pub download_url: Option<String>,
}

/// `backup-2026-10-15T02-30-00Z.json`
pub fn backup_file_name(at: DateTime<Utc>, extension: &str) -> String {
    format!("backup-{}.{}", at.format("%Y-%m-%dT%H-%M-%SZ"), extension)
}

pub struct BackupService {
    catalog: Arc<dyn CatalogReader>,
    rows: Arc<dyn RowSource>,
    registry: TableRegistry,
    page_size: usize,
    publisher: StoragePublisher,
    notifier: NotificationSender,
    schedule: Arc<dyn ScheduleStore>,
}

impl BackupService {
    pub fn new(
        catalog: Arc<dyn CatalogReader>,
        rows: Arc<dyn RowSource>,
        registry: TableRegistry,
        page_size: usize,
        publisher: StoragePublisher,
        notifier: NotificationSender,
        schedule: Arc<dyn ScheduleStore>,
    ) -> Self {
        Self {
            catalog,
            rows,
            registry,
            page_size,
            publisher,
            notifier,
            schedule,
        }
    }

    /// Tables in play, their catalog and the dependency order over them
    async fn resolve(&self, scope: IntrospectionScope) -> Result<(SchemaCatalog, DependencyOrder), AppError> {
        let mut tables = if self.registry.declared().is_empty() {
            let discovered = self.catalog.list_tables().await?;
            info!("No tables declared; discovered {} base tables", discovered.len());
            discovered
        } else {
            self.registry.declared().to_vec()
        };
        tables.retain(|t| !is_engine_table(t));

        let catalog = self.catalog.introspect(&tables, scope).await;
        let order = self.registry.resolve(&catalog.schema, &tables, &catalog.foreign_keys);
        debug!("Table order: {:?}", order.names());
        Ok((catalog, order))
    }

    /// Capture a JSON snapshot, publish it and optionally mail the stored recipient
    pub async fn run_backup(&self, notify: bool) -> Result<BackupResponse, AppError> {
        let captured_at = Utc::now();
        match self.capture_and_publish(captured_at, notify).await {
            Ok((response, problems)) => {
                let status = if problems.is_empty() {
                    BackupStatus::Success
                } else {
                    BackupStatus::Partial
                };
                let error = (!problems.is_empty()).then(|| problems.join("; "));
                self.record(captured_at, status, error, Some(response.file_name.clone()))
                    .await;
                Ok(response)
            }
            Err(e) => {
                error!("Backup failed: {}", e);
                self.record(captured_at, BackupStatus::Failed, Some(e.to_string()), None)
                    .await;
                Err(e)
            }
        }
    }

    async fn capture_and_publish(
        &self,
        captured_at: DateTime<Utc>,
        notify: bool,
    ) -> Result<(BackupResponse, Vec<String>), AppError> {
        let (catalog, order) = self.resolve(IntrospectionScope::Structure).await?;
        info!("Backing up {} tables", order.len());

        let builder = SnapshotBuilder::new(self.rows.as_ref(), self.page_size);
        let captured = builder.capture(&catalog, &order).await;
        let built = assemble(&catalog, captured, captured_at);

        let mut errors: Vec<String> = catalog
            .warnings
            .iter()
            .map(|w| format!("introspection: {}", w))
            .collect();
        errors.extend(built.errors);

        let file_name = backup_file_name(captured_at, "json");
        let bytes = serde_json::to_vec(&built.envelope)
            .map_err(|e| AppError::Internal(format!("Failed to serialize snapshot: {}", e)))?;
        let published = self.publisher.publish(&file_name, bytes).await;

        let mut problems = errors.clone();
        if let Some(e) = &published.error {
            problems.push(format!("publish: {}", e));
        }

        if notify {
            let summary = BackupSummary {
                file_name: file_name.clone(),
                captured_at,
                total_tables: built.envelope.metadata().total_tables,
                total_records: built.envelope.metadata().total_records,
                download_url: published.download_url.clone(),
                errors: errors.clone(),
            };
            if let Err(e) = self.notify(&summary).await {
                problems.push(e);
            }
        }

        let response = BackupResponse {
            success: true,
            file_name,
            download_url: published.download_url,
            metadata: built.envelope.metadata().clone(),
            record_counts: built.record_counts,
            backup_data: built.envelope,
            errors: (!errors.is_empty()).then_some(errors),
        };
        Ok((response, problems))
    }

    /// Mail the stored recipient; the error text is returned for the status record
    async fn notify(&self, summary: &BackupSummary) -> Result<(), String> {
        let settings = self
            .schedule
            .load()
            .await
            .map_err(|e| format!("notification: could not read recipient: {}", e))?;
        let Some(recipient) = settings.recipient_email else {
            warn!("Backup notification requested but no recipient is configured");
            return Ok(());
        };
        self.notifier
            .send_backup_summary(&recipient, summary)
            .await
            .map_err(|e| {
                warn!("Backup notification to {} failed: {}", recipient, e);
                format!("notification: {}", e)
            })
    }

    /// Render the full schema and data as one SQL document
    pub async fn export_sql(&self, publish: bool) -> Result<SqlExport, AppError> {
        let generated_at = Utc::now();
        let (catalog, order) = self.resolve(IntrospectionScope::Full).await?;
        info!("Exporting {} tables as SQL", order.len());

        let builder = SnapshotBuilder::new(self.rows.as_ref(), self.page_size);
        let captured = builder.capture(&catalog, &order).await;
        let sql = DdlSynthesizer::new(&catalog, &order).render(&captured);

        let file_name = backup_file_name(generated_at, "sql");
        let download_url = if publish {
            self.publisher
                .publish(&file_name, sql.clone().into_bytes())
                .await
                .download_url
        } else {
            None
        };

        info!("SQL export {} rendered ({} bytes)", file_name, sql.len());
        Ok(SqlExport {
            file_name,
            sql,
            download_url,
        })
    }

    async fn record(&self, at: DateTime<Utc>, status: BackupStatus, error: Option<String>, file: Option<String>) {
        let run = BackupRunStatus { at, status, error, file };
        if let Err(e) = self.schedule.record_run(&run).await {
            warn!("Failed to record backup status: {}", e);
        }
    }
}

#[async_trait]
impl ScheduledJob for BackupService {
    async fn run_scheduled(&self, token: &str) {
        match verify_scheduler_token(self.schedule.as_ref(), token).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Scheduled backup rejected: token does not match stored settings");
                return;
            }
            Err(e) => {
                error!("Scheduled backup could not verify its token: {}", e);
                return;
            }
        }

        info!("Scheduled backup starting");
        match self.run_backup(true).await {
            Ok(response) => info!("Scheduled backup {} complete", response.file_name),
            Err(e) => error!("Scheduled backup failed: {}", e),
        }
    }
}
