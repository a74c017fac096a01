//! Admin role lookup

use crate::db::queries;
use crate::error::AppError;
use async_trait::async_trait;
use deadpool_postgres::Pool;

/// Answers whether a user holds the administrator role
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    async fn is_admin(&self, user_id: &str) -> Result<bool, AppError>;
}

/// Reads the identity provider's role table
pub struct PgRoleDirectory {
    pool: Pool,
    admin_role: String,
}

impl PgRoleDirectory {
    pub fn new(pool: Pool, admin_role: impl Into<String>) -> Self {
        Self {
            pool,
            admin_role: admin_role.into(),
        }
    }
}

#[async_trait]
impl RoleDirectory for PgRoleDirectory {
    async fn is_admin(&self, user_id: &str) -> Result<bool, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(queries::IS_ADMIN, &[&user_id, &self.admin_role])
            .await?;
        Ok(row.get("is_admin"))
    }
}
