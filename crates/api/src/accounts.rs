//! Minimal user accounts
//!
//! Credentials and sessions belong to the auth collaborator. The core only
//! keeps the user rows that ownership checks and invitations refer to.

use std::sync::Arc;

use serde::Deserialize;
use sqlx::{PgConnection, PgPool};

use tenantry_shared::{
    dispatch, Notification, Notifier, QueryScope, Role, TenantId, TenantryError, TenantryResult,
    User, UserId,
};

/// Input for creating a user. `tenant_id` is honoured for administrators
/// only; everyone else creates users in their own tenant.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub email: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
}

#[derive(Clone)]
pub struct AccountService {
    pool: PgPool,
    notifier: Arc<dyn Notifier>,
}

impl AccountService {
    pub fn new(pool: PgPool, notifier: Arc<dyn Notifier>) -> Self {
        Self { pool, notifier }
    }

    pub async fn create_user(
        &self,
        email: &str,
        role: Role,
        tenant_id: Option<TenantId>,
    ) -> TenantryResult<User> {
        let mut conn = self.pool.acquire().await?;
        insert_user(&mut conn, email, role, tenant_id).await
    }

    /// Users visible under `scope`, by email
    pub async fn list_users(&self, scope: QueryScope) -> TenantryResult<Vec<User>> {
        let Some(tenant_id) = scope.sql_tenant_param() else {
            return Ok(Vec::new());
        };

        let users = sqlx::query_as(
            r#"
            SELECT * FROM users
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY email ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    pub async fn get_user(&self, id: UserId) -> TenantryResult<User> {
        sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TenantryError::NotFound(format!("User {}", id)))
    }

    /// Emit a password-reset notification for an active account.
    ///
    /// Succeeds whether or not the address is known, and regardless of
    /// whether the notification is delivered.
    pub async fn request_password_reset(&self, email: &str) -> TenantryResult<()> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(TenantryError::validation("email", "email is required"));
        }

        let known: Option<UserId> =
            sqlx::query_scalar("SELECT id FROM users WHERE email = $1 AND is_active")
                .bind(&email)
                .fetch_optional(&self.pool)
                .await?;

        match known {
            Some(user_id) => {
                tracing::info!(user_id = %user_id, "Password reset requested");
                dispatch(
                    self.notifier.clone(),
                    Notification::PasswordResetRequested { email },
                );
            }
            None => tracing::debug!("Password reset requested for unknown address"),
        }
        Ok(())
    }
}

pub(crate) async fn insert_user(
    conn: &mut PgConnection,
    email: &str,
    role: Role,
    tenant_id: Option<TenantId>,
) -> TenantryResult<User> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(TenantryError::validation("email", "a valid email address is required"));
    }
    if !role.is_system_admin() && tenant_id.is_none() {
        return Err(TenantryError::validation(
            "tenant_id",
            "tenant users must belong to a tenant",
        ));
    }

    let user: User = sqlx::query_as(
        r#"
        INSERT INTO users (id, email, tenant_id, role, is_active, created_at)
        VALUES ($1, $2, $3, $4, true, NOW())
        RETURNING *
        "#,
    )
    .bind(UserId::new())
    .bind(&email)
    .bind(tenant_id)
    .bind(role)
    .fetch_one(conn)
    .await?;

    tracing::info!(user_id = %user.id, role = %role, tenant_id = ?tenant_id, "Created user");
    Ok(user)
}
