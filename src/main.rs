//! PgVault - PostgreSQL snapshot, SQL export and restore engine
//!
//! Captures a live schema as a portable JSON snapshot or an idempotent SQL
//! document, and restores snapshots in foreign-key dependency order with
//! per-table and per-record error isolation. A daily in-process trigger runs
//! unattended backups and mails a summary.

mod auth;
mod backup;
mod config;
mod db;
mod error;
mod introspection;
mod notify;
mod registry;
mod restore;
mod routes;
mod schedule;
mod sql;
mod state;
mod storage;

use crate::auth::{Authenticator, PgRoleDirectory};
use crate::backup::{BackupService, PgRowSource};
use crate::config::Settings;
use crate::introspection::{CatalogReader, PostgresIntrospector};
use crate::notify::{mailer_from_config, NotificationSender};
use crate::registry::TableRegistry;
use crate::restore::{PgRestoreTarget, RestoreService};
use crate::routes::create_router;
use crate::schedule::{PgScheduleStore, ScheduleService, ScheduleStore, TokioScheduler};
use crate::state::AppState;
use crate::storage::{LocalObjectStore, ObjectStore, StoragePublisher};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting PgVault...");

    let settings = Settings::load()?;
    info!(
        "Configuration loaded: schema {}, {} declared tables",
        settings.backup.schema,
        settings.backup.tables.len()
    );

    let pool = db::connect(&settings.database).await?;
    db::ensure_engine_tables(&pool).await?;

    let schema = settings.backup.schema.clone();
    let registry = TableRegistry::new(
        settings.backup.tables.clone(),
        settings.backup.identity_owned_tables.clone(),
    );

    let catalog: Arc<dyn CatalogReader> = Arc::new(PostgresIntrospector::new(pool.clone(), schema.clone()));
    let schedule_store: Arc<dyn ScheduleStore> = Arc::new(PgScheduleStore::new(pool.clone()));
    let storage: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
        settings.storage.root_dir.clone(),
        settings.storage.public_base_url.clone(),
        settings.storage.signing_secret.clone(),
    ));

    let auth = Arc::new(Authenticator::new(
        settings.auth.clone(),
        Arc::new(PgRoleDirectory::new(pool.clone(), settings.auth.admin_role.clone())),
        schedule_store.clone(),
        settings.backup.emergency_restore_enabled,
    ));
    if settings.backup.emergency_restore_enabled {
        warn!("Emergency restore override is enabled");
    }

    let backup = Arc::new(BackupService::new(
        catalog.clone(),
        Arc::new(PgRowSource::new(pool.clone(), schema.clone())),
        registry.clone(),
        settings.backup.page_size,
        StoragePublisher::new(storage.clone(), settings.storage.signed_url_ttl_hours),
        NotificationSender::new(mailer_from_config(&settings.mail)),
        schedule_store.clone(),
    ));

    let restore = RestoreService::new(
        auth.clone(),
        catalog,
        Arc::new(PgRestoreTarget::new(pool.clone(), schema)),
        registry,
        settings.backup.insert_batch_size,
    );

    let scheduler = Arc::new(TokioScheduler::new(backup.clone()));
    let schedule = ScheduleService::new(
        schedule_store,
        scheduler,
        settings.backup.timezone_offset_minutes,
    );
    if let Err(e) = schedule.register_stored().await {
        warn!("Stored backup schedule not registered: {}", e);
    }

    let state = Arc::new(AppState {
        auth,
        backup,
        restore,
        schedule,
        storage,
    });

    let app = create_router(state, &settings);
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("Server listening on http://{}", addr);
    info!("   POST /api/backup            - JSON snapshot (?notify=true)");
    info!("   POST /api/backup/sql        - SQL export (?publish=true)");
    info!("   POST /api/restore           - Restore a snapshot");
    info!("   GET  /api/backup/schedule   - Read schedule");
    info!("   PUT  /api/backup/schedule   - Update schedule");
    info!("   GET  /api/backup/files/{{name}} - Signed download");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pgvault=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
