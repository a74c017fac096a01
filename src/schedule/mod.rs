//! Backup schedule
//!
//! Persisted schedule settings and the last-run status record, plus the
//! service behind the schedule endpoints. The engine itself only reads the
//! stored token to authenticate unattended runs.

pub mod timer;

pub use timer::{civil_to_utc, ScheduledJob, Scheduler, TokioScheduler};

use crate::db::queries;
use crate::error::AppError;
use crate::storage::to_hex;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

/// Outcome class of a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Success,
    /// Data was captured but something (a table, publishing, mail) failed
    Partial,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Success => "success",
            BackupStatus::Partial => "partial",
            BackupStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(BackupStatus::Success),
            "partial" => Some(BackupStatus::Partial),
            "failed" => Some(BackupStatus::Failed),
            _ => None,
        }
    }
}

/// Last-run record written after every backup
#[derive(Debug, Clone, PartialEq)]
pub struct BackupRunStatus {
    pub at: DateTime<Utc>,
    pub status: BackupStatus,
    pub error: Option<String>,
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSettings {
    /// Civil time of day
    pub hour: u32,
    pub minute: u32,
    pub recipient_email: Option<String>,
    pub enabled: bool,
    #[serde(skip)]
    pub scheduler_token: Option<String>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_backup_status: Option<BackupStatus>,
    pub last_backup_error: Option<String>,
    pub last_backup_file: Option<String>,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            hour: 2,
            minute: 0,
            recipient_email: None,
            enabled: false,
            scheduler_token: None,
            last_backup_at: None,
            last_backup_status: None,
            last_backup_error: None,
            last_backup_file: None,
        }
    }
}

/// Persistence for the single settings record
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Stored settings, or defaults when nothing has been saved
    async fn load(&self) -> Result<ScheduleSettings, AppError>;

    /// Persist hour, minute, recipient, enabled flag and token
    async fn save(&self, settings: &ScheduleSettings) -> Result<(), AppError>;

    async fn record_run(&self, run: &BackupRunStatus) -> Result<(), AppError>;
}

pub struct PgScheduleStore {
    pool: Pool,
}

impl PgScheduleStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn load(&self) -> Result<ScheduleSettings, AppError> {
        let client = self.pool.get().await?;
        let Some(row) = client.query_opt(queries::LOAD_BACKUP_SETTINGS, &[]).await? else {
            return Ok(ScheduleSettings::default());
        };

        let hour: i32 = row.get("hour");
        let minute: i32 = row.get("minute");
        let status: Option<String> = row.get("last_backup_status");
        Ok(ScheduleSettings {
            hour: u32::try_from(hour).map_err(|e| AppError::Internal(e.to_string()))?,
            minute: u32::try_from(minute).map_err(|e| AppError::Internal(e.to_string()))?,
            recipient_email: row.get("recipient_email"),
            enabled: row.get("enabled"),
            scheduler_token: row.get("scheduler_token"),
            last_backup_at: row.get("last_backup_at"),
            last_backup_status: status.as_deref().and_then(BackupStatus::parse),
            last_backup_error: row.get("last_backup_error"),
            last_backup_file: row.get("last_backup_file"),
        })
    }

    async fn save(&self, settings: &ScheduleSettings) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        let hour = i32::try_from(settings.hour).map_err(|e| AppError::Validation(e.to_string()))?;
        let minute = i32::try_from(settings.minute).map_err(|e| AppError::Validation(e.to_string()))?;
        client
            .execute(
                queries::SAVE_BACKUP_SETTINGS,
                &[
                    &hour,
                    &minute,
                    &settings.recipient_email,
                    &settings.enabled,
                    &settings.scheduler_token,
                ],
            )
            .await?;
        Ok(())
    }

    async fn record_run(&self, run: &BackupRunStatus) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client
            .execute(
                queries::RECORD_BACKUP_RUN,
                &[&run.at, &run.status.as_str(), &run.error, &run.file],
            )
            .await?;
        Ok(())
    }
}

/// 48 hex characters of randomness
pub fn mint_token() -> String {
    let bytes: [u8; 24] = rand::thread_rng().gen();
    to_hex(&bytes)
}

/// Whether `presented` is the stored scheduler token
pub async fn verify_scheduler_token(store: &dyn ScheduleStore, presented: &str) -> Result<bool, AppError> {
    let settings = store.load().await?;
    Ok(settings
        .scheduler_token
        .as_deref()
        .is_some_and(|stored| Sha256::digest(stored.as_bytes()) == Sha256::digest(presented.as_bytes())))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateScheduleRequest {
    #[validate(range(max = 23, message = "hour must be between 0 and 23"))]
    pub hour: u32,
    #[validate(range(max = 59, message = "minute must be between 0 and 59"))]
    pub minute: u32,
    #[validate(email(message = "recipientEmail must be an email address"))]
    pub recipient_email: Option<String>,
    pub enabled: bool,
}

/// Settings as shown to administrators: token redacted, UTC trigger time added
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleView {
    #[serde(flatten)]
    pub settings: ScheduleSettings,
    pub has_scheduler_token: bool,
    pub timezone_offset_minutes: i32,
    pub utc_hour: u32,
    pub utc_minute: u32,
}

pub struct ScheduleService {
    store: Arc<dyn ScheduleStore>,
    scheduler: Arc<dyn Scheduler>,
    offset_minutes: i32,
}

impl ScheduleService {
    pub fn new(store: Arc<dyn ScheduleStore>, scheduler: Arc<dyn Scheduler>, offset_minutes: i32) -> Self {
        Self {
            store,
            scheduler,
            offset_minutes,
        }
    }

    fn view(&self, settings: ScheduleSettings) -> ScheduleView {
        let (utc_hour, utc_minute) = civil_to_utc(settings.hour, settings.minute, self.offset_minutes);
        ScheduleView {
            has_scheduler_token: settings.scheduler_token.is_some(),
            settings,
            timezone_offset_minutes: self.offset_minutes,
            utc_hour,
            utc_minute,
        }
    }

    pub async fn get(&self) -> Result<ScheduleView, AppError> {
        Ok(self.view(self.store.load().await?))
    }

    /// Save new settings and re-register the trigger
    pub async fn update(&self, request: UpdateScheduleRequest) -> Result<ScheduleView, AppError> {
        let mut settings = self.store.load().await?;
        settings.hour = request.hour;
        settings.minute = request.minute;
        settings.recipient_email = request.recipient_email.filter(|e| !e.trim().is_empty());
        settings.enabled = request.enabled;
        if settings.scheduler_token.is_none() {
            settings.scheduler_token = Some(mint_token());
        }

        self.store.save(&settings).await?;
        self.register(&settings).await?;
        info!(
            "Backup schedule updated: {:02}:{:02} (offset {} min), enabled={}",
            settings.hour, settings.minute, self.offset_minutes, settings.enabled
        );
        Ok(self.view(settings))
    }

    /// Re-register stored settings, e.g. after a restart
    pub async fn register_stored(&self) -> Result<(), AppError> {
        let settings = self.store.load().await?;
        if settings.scheduler_token.is_none() {
            info!("No backup schedule saved yet");
            return Ok(());
        }
        self.register(&settings).await
    }

    async fn register(&self, settings: &ScheduleSettings) -> Result<(), AppError> {
        let Some(token) = settings.scheduler_token.as_deref() else {
            warn!("Cannot register a schedule without a token");
            return Ok(());
        };
        let (utc_hour, utc_minute) = civil_to_utc(settings.hour, settings.minute, self.offset_minutes);
        self.scheduler
            .register_daily(utc_hour, utc_minute, token, settings.enabled)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to register schedule: {}", e)))
    }
}


#[cfg(test)]
mod tests {
    use super::memory::{InMemoryScheduleStore, RecordingScheduler};
    use super::*;

    fn service() -> (ScheduleService, Arc<InMemoryScheduleStore>, Arc<RecordingScheduler>) {
        let store = Arc::new(InMemoryScheduleStore::default());
        let scheduler = Arc::new(RecordingScheduler::default());
        (ScheduleService::new(store.clone(), scheduler.clone(), 330), store, scheduler)
    }

    #[tokio::test]
    async fn test_update_mints_token_and_registers_utc_time() {
        let (service, store, scheduler) = service();

        let view = service
            .update(UpdateScheduleRequest {
                hour: 2,
                minute: 0,
                recipient_email: Some("ops@example.com".to_string()),
                enabled: true,
            })
            .await
            .unwrap();

        assert!(view.has_scheduler_token);
        assert_eq!((view.utc_hour, view.utc_minute), (20, 30));

        let token = store.settings.lock().unwrap().scheduler_token.clone().unwrap();
        assert_eq!(token.len(), 48);
        assert_eq!(
            scheduler.registrations.lock().unwrap().as_slice(),
            &[(20, 30, token, true)]
        );
    }

    #[tokio::test]
    async fn test_token_survives_later_updates() {
        let (service, store, _) = service();
        let request = || UpdateScheduleRequest {
            hour: 4,
            minute: 15,
            recipient_email: None,
            enabled: true,
        };

        service.update(request()).await.unwrap();
        let first = store.settings.lock().unwrap().scheduler_token.clone();
        service.update(request()).await.unwrap();

        assert_eq!(store.settings.lock().unwrap().scheduler_token, first);
    }

    #[tokio::test]
    async fn test_view_never_serializes_token() {
        let (service, store, _) = service();
        store.settings.lock().unwrap().scheduler_token = Some("secret-token".to_string());

        let json = serde_json::to_string(&service.get().await.unwrap()).unwrap();

        assert!(!json.contains("secret-token"));
        assert!(json.contains("\"hasSchedulerToken\":true"));
    }

    #[tokio::test]
    async fn test_verify_scheduler_token() {
        let store = InMemoryScheduleStore::with_token("abc123");

        assert!(verify_scheduler_token(&store, "abc123").await.unwrap());
        assert!(!verify_scheduler_token(&store, "abc124").await.unwrap());
        assert!(!verify_scheduler_token(&InMemoryScheduleStore::default(), "").await.unwrap());
    }

    #[tokio::test]
    async fn test_register_stored_skips_unsaved_schedule() {
        let (service, _, scheduler) = service();
        service.register_stored().await.unwrap();
        assert!(scheduler.registrations.lock().unwrap().is_empty());
    }

    #[test]
    fn test_request_validation() {
        let bad = UpdateScheduleRequest {
            hour: 24,
            minute: 0,
            recipient_email: Some("not-an-email".to_string()),
            enabled: true,
        };
        let errors = bad.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("hour"));
        assert!(fields.contains_key("recipient_email"));
    }
}
