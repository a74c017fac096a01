//! Application state management
//!
//! Contains the services every handler reaches through shared state.

use crate::auth::Authenticator;
use crate::backup::BackupService;
use crate::restore::RestoreService;
use crate::schedule::ScheduleService;
use crate::storage::ObjectStore;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    pub auth: Arc<Authenticator>,

    /// Also registered as the scheduler's job
    pub backup: Arc<BackupService>,

    /// Holds the in-process restore guard
    pub restore: RestoreService,

    pub schedule: ScheduleService,

    /// Serves signed artifact downloads
    pub storage: Arc<dyn ObjectStore>,
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
