//! Authentication and authorization module
//!
//! Three kinds of caller may drive the engine: an administrator holding a
//! provider-issued JWT, the scheduler presenting its stored token, and, for
//! restore only, an emergency override that bypasses both.

mod jwt;
mod middleware;
mod roles;

#[cfg(test)]
pub(crate) use jwt::testing;
pub use jwt::decode_token;
pub use middleware::BearerToken;
pub use roles::{PgRoleDirectory, RoleDirectory};

use crate::config::AuthConfig;
use crate::error::AppError;
use crate::schedule::{verify_scheduler_token, ScheduleStore};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Confirmation phrase that must accompany an emergency restore
pub const EMERGENCY_CONFIRMATION: &str = "EMERGENCY RESTORE";

/// Who is making a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Admin { user_id: String },
    Scheduler,
    EmergencyOverride,
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::Admin { user_id } => write!(f, "admin {}", user_id),
            Caller::Scheduler => write!(f, "scheduler"),
            Caller::EmergencyOverride => write!(f, "emergency override"),
        }
    }
}

pub struct Authenticator {
    config: AuthConfig,
    roles: Arc<dyn RoleDirectory>,
    schedule: Arc<dyn ScheduleStore>,
    emergency_enabled: bool,
}

impl Authenticator {
    pub fn new(
        config: AuthConfig,
        roles: Arc<dyn RoleDirectory>,
        schedule: Arc<dyn ScheduleStore>,
        emergency_enabled: bool,
    ) -> Self {
        Self {
            config,
            roles,
            schedule,
            emergency_enabled,
        }
    }

    /// Require a valid JWT whose subject holds the admin role
    pub async fn admin(&self, bearer: Option<&str>) -> Result<Caller, AppError> {
        let token = bearer.ok_or_else(|| AppError::Unauthorized("Missing authorization header".to_string()))?;
        let claims = decode_token(token, &self.config)?;

        if !self.roles.is_admin(&claims.sub).await? {
            warn!("User {} denied: not an admin", claims.sub);
            return Err(AppError::Forbidden("Admin role required".to_string()));
        }
        debug!("Admin {} authorized", claims.sub);
        Ok(Caller::Admin { user_id: claims.sub })
    }

    /// Accept the stored scheduler token, otherwise fall back to admin checks
    pub async fn admin_or_scheduler(&self, bearer: Option<&str>) -> Result<Caller, AppError> {
        if let Some(token) = bearer {
            if verify_scheduler_token(self.schedule.as_ref(), token).await? {
                debug!("Scheduler token accepted");
                return Ok(Caller::Scheduler);
            }
        }
        self.admin(bearer).await
    }

    pub fn emergency_enabled(&self) -> bool {
        self.emergency_enabled
    }

    /// A requested override only counts when it is enabled and the
    /// confirmation phrase matches exactly
    pub fn emergency_override(&self, requested: bool, confirm_text: Option<&str>) -> Option<Caller> {
        if !requested {
            return None;
        }
        if !self.emergency_enabled {
            warn!("Emergency restore requested but disabled");
            None
        } else if confirm_text == Some(EMERGENCY_CONFIRMATION) {
            warn!("Emergency restore override in use; authentication bypassed");
            Some(Caller::EmergencyOverride)
        } else {
            warn!("Emergency restore requested without the confirmation phrase");
            None
        }
    }
}

#[cfg(test)]
pub mod memory {
    //! Fixed role directory

    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;

    #[derive(Default)]
    pub struct StaticRoles {
        admins: HashSet<String>,
    }

    impl StaticRoles {
        pub fn admins(ids: &[&str]) -> Self {
            Self {
                admins: ids.iter().map(|id| id.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl RoleDirectory for StaticRoles {
        async fn is_admin(&self, user_id: &str) -> Result<bool, AppError> {
            Ok(self.admins.contains(user_id))
        }
    }
}
