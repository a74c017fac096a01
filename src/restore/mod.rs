//! Snapshot restore
//!
//! Authorizes the caller, plans the table order against the target's live
//! foreign keys and hands the write phases to the orchestrator.

pub mod orchestrator;
pub mod report;
pub mod target;

pub use orchestrator::{RestoreOrchestrator, RestorePhase, RestorePlan};
pub use report::RestoreReport;
pub use target::{PgRestoreTarget, RestoreTarget};

use crate::auth::{Authenticator, Caller};
use crate::backup::envelope::SnapshotEnvelope;
use crate::error::AppError;
use crate::introspection::{CatalogReader, IntrospectionScope};
use crate::registry::{is_engine_table, TableRegistry, ENGINE_TABLES};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    /// Empty every non-identity table, then insert
    #[default]
    Replace,
    /// Insert only; rows that already exist are kept
    Merge,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub backup_data: SnapshotEnvelope,
    #[serde(default)]
    pub mode: RestoreMode,
    #[serde(default)]
    pub emergency_restore: bool,
    pub confirm_text: Option<String>,
}

impl RestoreRequest {
    pub fn from_slice(body: &[u8]) -> Result<Self, AppError> {
        serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("Invalid restore request: {}", e)))
    }
}

/// Result of checking the request headers, before the body is read
#[derive(Debug)]
pub enum Admission {
    Admitted(Caller),
    /// Header credentials were rejected; only a confirmed override in the
    /// body can still proceed, otherwise the rejection stands
    OverrideRequired(AppError),
}

pub struct RestoreService {
    authenticator: Arc<Authenticator>,
    catalog: Arc<dyn CatalogReader>,
    target: Arc<dyn RestoreTarget>,
    registry: TableRegistry,
    batch_size: usize,
    running: Mutex<()>,
}

impl RestoreService {
    pub fn new(
        authenticator: Arc<Authenticator>,
        catalog: Arc<dyn CatalogReader>,
        target: Arc<dyn RestoreTarget>,
        registry: TableRegistry,
        batch_size: usize,
    ) -> Self {
        Self {
            authenticator,
            catalog,
            target,
            registry,
            batch_size,
            running: Mutex::new(()),
        }
    }

    /// Check the bearer alone. A failed check is final unless the emergency
    /// override is enabled.
    pub async fn admit(&self, bearer: Option<&str>) -> Result<Admission, AppError> {
        info!("Restore phase: {}", RestorePhase::Authorizing);
        match self.authenticator.admin(bearer).await {
            Ok(caller) => Ok(Admission::Admitted(caller)),
            Err(rejection) if self.authenticator.emergency_enabled() => Ok(Admission::OverrideRequired(rejection)),
            Err(rejection) => Err(rejection),
        }
    }

    /// Parse `body` and run the restore for an admitted caller
    pub async fn restore(&self, admission: Admission, body: &[u8]) -> Result<RestoreReport, AppError> {
        let (caller, request) = match (admission, RestoreRequest::from_slice(body)) {
            (Admission::Admitted(caller), parsed) => (caller, parsed?),
            (Admission::OverrideRequired(rejection), Ok(request)) => {
                let caller = self
                    .authenticator
                    .emergency_override(request.emergency_restore, request.confirm_text.as_deref())
                    .ok_or(rejection)?;
                (caller, request)
            }
            (Admission::OverrideRequired(rejection), Err(_)) => return Err(rejection),
        };

        let _running = self
            .running
            .try_lock()
            .map_err(|_| AppError::Conflict("A restore is already running".to_string()))?;

        let run = Uuid::new_v4();
        let envelope = request.backup_data;
        info!(
            "Restore {} started by {} in {:?} mode: {} tables, {} records",
            run,
            caller,
            request.mode,
            envelope.metadata().total_tables,
            envelope.metadata().total_records
        );

        let plan = self.plan(&envelope).await?;
        let report = RestoreOrchestrator::new(self.target.as_ref(), self.batch_size)
            .run(&plan, &envelope, request.mode)
            .await;

        info!(
            "Restore {} finished: {} records in {} tables, {} errors, {} delete errors",
            run,
            report.summary.total_records,
            report.summary.total_tables,
            report.summary.total_errors,
            report.summary.delete_errors
        );
        Ok(report)
    }

    /// Registry tables plus any extra snapshot tables, ordered by the target's foreign keys
    async fn plan(&self, envelope: &SnapshotEnvelope) -> Result<RestorePlan, AppError> {
        let mut tables = if self.registry.declared().is_empty() {
            self.catalog.list_tables().await?
        } else {
            self.registry.declared().to_vec()
        };
        for name in envelope.table_names() {
            if !tables.contains(&name) {
                tables.push(name);
            }
        }
        if tables.iter().any(|t| is_engine_table(t)) {
            warn!("Engine tables are never restored; skipping {:?}", ENGINE_TABLES);
            tables.retain(|t| !is_engine_table(t));
        }

        let catalog = self.catalog.introspect(&tables, IntrospectionScope::Structure).await;
        if !catalog.warnings.is_empty() {
            warn!("Target structure unreadable: {:?}", catalog.warnings);
            return Err(AppError::Internal(format!(
                "Could not read the target schema; nothing was changed: {}",
                catalog.warnings.join("; ")
            )));
        }

        let order = self.registry.resolve(&catalog.schema, &tables, &catalog.foreign_keys);
        Ok(RestorePlan::new(&order, &catalog))
    }
}
