//! Tenant invitations
//!
//! Tokens have the form `{invitation_uuid}.{hmac_prefix}`: the invitation id
//! signed with HMAC-SHA256, truncated to 8 bytes and hex encoded.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::{PgConnection, PgPool};
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use tenantry_shared::{
    dispatch, utc_now, Invitation, InvitationId, InvitationStatus, Notification, Notifier,
    QueryScope, Role, TenantId, TenantryError, TenantryResult, User, UserId,
};

type HmacSha256 = Hmac<Sha256>;

fn signature(payload: &str, secret: &str) -> TenantryResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| TenantryError::Internal("invalid invitation signing key".into()))?;
    mac.update(payload.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(hex::encode(&digest[..8]))
}

/// Sign an invitation id into a token
pub fn generate_invitation_token(id: InvitationId, secret: &str) -> TenantryResult<String> {
    let payload = id.to_string();
    let sig = signature(&payload, secret)?;
    Ok(format!("{}.{}", payload, sig))
}

/// Extract the invitation id from a token whose signature checks out
pub fn validate_invitation_token(token: &str, secret: &str) -> Option<InvitationId> {
    let (payload, provided) = token.split_once('.')?;
    let id = Uuid::parse_str(payload).ok()?;
    let expected = signature(payload, secret).ok()?;

    if provided.len() != expected.len() {
        return None;
    }
    let matches: bool = provided.as_bytes().ct_eq(expected.as_bytes()).into();
    matches.then_some(InvitationId(id))
}

/// Service for tenant invitations
#[derive(Clone)]
pub struct InvitationService {
    pool: PgPool,
    notifier: Arc<dyn Notifier>,
    hmac_secret: String,
    expiry_days: i64,
}

impl InvitationService {
    pub fn new(
        pool: PgPool,
        notifier: Arc<dyn Notifier>,
        hmac_secret: String,
        expiry_days: i64,
    ) -> Self {
        Self {
            pool,
            notifier,
            hmac_secret,
            expiry_days,
        }
    }

    /// Invite an email address into a tenant. The notifier is told in the
    /// background; its outcome never affects the invitation.
    pub async fn create_invitation(
        &self,
        tenant_id: TenantId,
        email: &str,
        role: Role,
        invited_by: UserId,
    ) -> TenantryResult<Invitation> {
        let email = email.trim().to_lowercase();
        if !is_plausible_email(&email) {
            return Err(TenantryError::validation("email", "a valid email address is required"));
        }
        if !role.is_invitable() {
            return Err(TenantryError::validation(
                "role",
                format!("role {} cannot be granted by invitation", role),
            ));
        }

        let tenant: Option<(String, bool)> =
            sqlx::query_as("SELECT name, is_active FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        let tenant_name = match tenant {
            None => return Err(TenantryError::NotFound(format!("Tenant {}", tenant_id))),
            Some((_, false)) => {
                return Err(TenantryError::validation("tenant_id", "tenant is deactivated"))
            }
            Some((name, true)) => name,
        };

        let now = utc_now();
        let id = InvitationId::new();
        let invitation = Invitation {
            id,
            tenant_id,
            email,
            role,
            invited_by,
            token: generate_invitation_token(id, &self.hmac_secret)?,
            status: InvitationStatus::Pending,
            expires_at: now + Duration::days(self.expiry_days),
            accepted_at: None,
            created_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO invitations (
                id, tenant_id, email, role, invited_by, token, status, expires_at, accepted_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(invitation.id)
        .bind(invitation.tenant_id)
        .bind(&invitation.email)
        .bind(invitation.role)
        .bind(invitation.invited_by)
        .bind(&invitation.token)
        .bind(invitation.status)
        .bind(invitation.expires_at)
        .bind(invitation.accepted_at)
        .bind(invitation.created_at)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            invitation_id = %invitation.id,
            tenant_id = %tenant_id,
            role = %role,
            "Created invitation"
        );

        dispatch(
            self.notifier.clone(),
            Notification::InvitationCreated {
                tenant_id,
                tenant_name,
                email: invitation.email.clone(),
                role,
                token: invitation.token.clone(),
                expires_at: invitation.expires_at,
            },
        );

        Ok(invitation)
    }

    /// Accept an invitation on behalf of a user: the user joins the tenant
    /// with the invited role. All-or-nothing.
    pub async fn accept_invitation(
        &self,
        token: &str,
        user_id: UserId,
    ) -> TenantryResult<(Invitation, User)> {
        let mut tx = self.pool.begin().await?;
        let mut invitation = self.lock_by_token(&mut tx, token).await?;

        let now = utc_now();
        invitation.accept(now)?;

        let user: User = sqlx::query_as(
            r#"
            UPDATE users SET tenant_id = $2, role = $3
            WHERE id = $1 AND is_active
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(invitation.tenant_id)
        .bind(invitation.role)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| TenantryError::NotFound(format!("User {}", user_id)))?;

        save_status(&mut tx, &invitation).await?;
        tx.commit().await?;

        tracing::info!(
            invitation_id = %invitation.id,
            tenant_id = %invitation.tenant_id,
            user_id = %user_id,
            "Invitation accepted"
        );
        Ok((invitation, user))
    }

    pub async fn decline_invitation(&self, token: &str) -> TenantryResult<Invitation> {
        let mut tx = self.pool.begin().await?;
        let mut invitation = self.lock_by_token(&mut tx, token).await?;

        invitation.decline()?;
        save_status(&mut tx, &invitation).await?;
        tx.commit().await?;

        tracing::info!(invitation_id = %invitation.id, "Invitation declined");
        Ok(invitation)
    }

    /// Mark pending invitations past their expiry as expired
    pub async fn expire_invitations(&self, now: OffsetDateTime) -> TenantryResult<u64> {
        let result = sqlx::query(
            "UPDATE invitations SET status = 'expired' WHERE status = 'pending' AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        let expired = result.rows_affected();
        if expired > 0 {
            tracing::info!(count = expired, "Expired invitations");
        }
        Ok(expired)
    }

    pub async fn list_invitations(&self, scope: QueryScope) -> TenantryResult<Vec<Invitation>> {
        let Some(tenant_id) = scope.sql_tenant_param() else {
            return Ok(Vec::new());
        };

        let invitations = sqlx::query_as(
            r#"
            SELECT * FROM invitations
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(invitations)
    }

    async fn lock_by_token(&self, conn: &mut PgConnection, token: &str) -> TenantryResult<Invitation> {
        let id = validate_invitation_token(token, &self.hmac_secret)
            .ok_or_else(|| TenantryError::validation("token", "invalid invitation token"))?;

        sqlx::query_as("SELECT * FROM invitations WHERE id = $1 AND token = $2 FOR UPDATE")
            .bind(id)
            .bind(token)
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| TenantryError::validation("token", "invalid invitation token"))
    }
}

async fn save_status(conn: &mut PgConnection, invitation: &Invitation) -> TenantryResult<()> {
    sqlx::query("UPDATE invitations SET status = $2, accepted_at = $3 WHERE id = $1")
        .bind(invitation.id)
        .bind(invitation.status)
        .bind(invitation.accepted_at)
        .execute(conn)
        .await?;
    Ok(())
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SECRET: &str = "test-invitation-secret-at-least-32-chars";

    #[test]
    fn test_token_round_trip() {
        let id = InvitationId::new();
        let token = generate_invitation_token(id, SECRET).unwrap();

        let (payload, sig) = token.split_once('.').unwrap();
        assert_eq!(payload, id.to_string());
        assert_eq!(sig.len(), 16);
        assert_eq!(validate_invitation_token(&token, SECRET), Some(id));
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = generate_invitation_token(InvitationId::new(), SECRET).unwrap();
        let b = generate_invitation_token(InvitationId::new(), SECRET).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_tokens_are_rejected() {
        let id = InvitationId::new();
        let token = generate_invitation_token(id, SECRET).unwrap();

        // Wrong secret
        assert!(validate_invitation_token(&token, "another-secret-of-at-least-32-chars").is_none());

        // Swapped id
        let (_, sig) = token.split_once('.').unwrap();
        let forged = format!("{}.{}", Uuid::new_v4(), sig);
        assert!(validate_invitation_token(&forged, SECRET).is_none());

        // Malformed
        let unsigned = format!("{}.", id);
        for bad in ["", "no-dot", "not-a-uuid.abcdef0123456789", unsigned.as_str()] {
            assert!(validate_invitation_token(bad, SECRET).is_none(), "{bad}");
        }
    }

    #[test]
    fn test_email_plausibility() {
        assert!(is_plausible_email("dev@acme.test"));
        assert!(!is_plausible_email("dev@localhost"));
        assert!(!is_plausible_email("@acme.test"));
        assert!(!is_plausible_email("dev acme@acme.test"));
        assert!(!is_plausible_email("acme.test"));
    }
}
