//! Tenant directory: tenants and their domains
//!
//! Also the PostgreSQL-backed `TenantLookup` used by the resolver. Writes
//! evict the affected hosts from the shared `TenantCache`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;

use tenantry_shared::{
    slug_or_derive, utc_now, Domain, DomainId, QueryScope, Role, Tenant, TenantId, TenantryError,
    TenantryResult, User,
};

use crate::accounts::insert_user;
use crate::routing::{normalize_host, TenantCache, TenantLookup};

/// Input for creating a tenant
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTenant {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

impl NewTenant {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Build the tenant row, deriving the slug when none is given
    pub fn into_tenant(self, now: OffsetDateTime) -> TenantryResult<Tenant> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(TenantryError::validation("name", "tenant name is required"));
        }
        let slug = slug_or_derive(self.slug.as_deref(), &name);
        let settings = self.settings.unwrap_or_else(|| serde_json::json!({}));
        if !settings.is_object() {
            return Err(TenantryError::validation("settings", "settings must be a JSON object"));
        }

        Ok(Tenant {
            id: TenantId::new(),
            name,
            slug,
            description: self.description,
            is_active: true,
            contact_email: self.contact_email,
            contact_phone: self.contact_phone,
            address: self.address,
            city: self.city,
            state: self.state,
            country: self.country,
            postal_code: self.postal_code,
            settings,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Validate and normalise a domain name for storage
pub fn normalize_domain(domain: &str) -> TenantryResult<String> {
    let domain = normalize_host(domain);
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !valid {
        return Err(TenantryError::validation("domain", "invalid domain name"));
    }
    Ok(domain)
}

/// PostgreSQL tenant directory
#[derive(Clone)]
pub struct PgTenantDirectory {
    pool: PgPool,
    cache: Arc<TenantCache>,
}

impl PgTenantDirectory {
    pub fn new(pool: PgPool, cache: Arc<TenantCache>) -> Self {
        Self { pool, cache }
    }

    pub async fn create_tenant(&self, input: NewTenant) -> TenantryResult<Tenant> {
        let tenant = input.into_tenant(utc_now())?;
        let mut conn = self.pool.acquire().await?;
        insert_tenant(&mut conn, &tenant).await?;

        // A new slug may answer a previously cached miss
        self.cache.clear();

        tracing::info!(tenant_id = %tenant.id, slug = %tenant.slug, "Created tenant");
        Ok(tenant)
    }

    /// Create a tenant together with its first `tenant_admin`; neither row
    /// exists unless both do
    pub async fn register(&self, input: NewTenant, email: &str) -> TenantryResult<(Tenant, User)> {
        let tenant = input.into_tenant(utc_now())?;

        let mut tx = self.pool.begin().await?;
        insert_tenant(&mut tx, &tenant).await?;
        let user = insert_user(&mut tx, email, Role::TenantAdmin, Some(tenant.id)).await?;
        tx.commit().await?;

        self.cache.clear();

        tracing::info!(
            tenant_id = %tenant.id,
            slug = %tenant.slug,
            user_id = %user.id,
            "Registered tenant"
        );
        Ok((tenant, user))
    }

    pub async fn get_tenant(&self, id: TenantId) -> TenantryResult<Tenant> {
        sqlx::query_as("SELECT * FROM tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TenantryError::NotFound(format!("Tenant {}", id)))
    }

    pub async fn list_tenants(&self, scope: QueryScope) -> TenantryResult<Vec<Tenant>> {
        let Some(tenant_id) = scope.sql_tenant_param() else {
            return Ok(Vec::new());
        };

        let tenants = sqlx::query_as(
            r#"
            SELECT * FROM tenants
            WHERE ($1::uuid IS NULL OR id = $1)
            ORDER BY name ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tenants)
    }

    /// Soft-disable a tenant. It stops resolving immediately.
    pub async fn deactivate_tenant(&self, id: TenantId) -> TenantryResult<Tenant> {
        let tenant: Tenant = sqlx::query_as(
            "UPDATE tenants SET is_active = false, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TenantryError::NotFound(format!("Tenant {}", id)))?;

        self.cache.invalidate_tenant(id);

        tracing::info!(tenant_id = %id, "Deactivated tenant");
        Ok(tenant)
    }

    /// Attach a domain. A primary domain demotes the tenant's other primaries
    /// in the same transaction.
    pub async fn add_domain(
        &self,
        tenant_id: TenantId,
        domain: &str,
        is_primary: bool,
    ) -> TenantryResult<Domain> {
        let domain = normalize_domain(domain)?;

        let mut tx = self.pool.begin().await?;
        lock_tenant(&mut tx, tenant_id).await?;

        if is_primary {
            demote_primaries(&mut tx, tenant_id).await?;
        }

        let row: Domain = sqlx::query_as(
            r#"
            INSERT INTO domains (id, tenant_id, domain, is_primary, is_active, created_at)
            VALUES ($1, $2, $3, $4, true, NOW())
            RETURNING *
            "#,
        )
        .bind(DomainId::new())
        .bind(tenant_id)
        .bind(&domain)
        .bind(is_primary)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        self.cache.invalidate_host(&domain);

        tracing::info!(
            tenant_id = %tenant_id,
            domain = %domain,
            is_primary,
            "Added domain"
        );
        Ok(row)
    }

    /// Make a domain its tenant's only primary domain
    pub async fn set_primary_domain(&self, domain_id: DomainId) -> TenantryResult<Domain> {
        let mut tx = self.pool.begin().await?;

        let tenant_id: Option<TenantId> =
            sqlx::query_scalar("SELECT tenant_id FROM domains WHERE id = $1")
                .bind(domain_id)
                .fetch_optional(&mut *tx)
                .await?;
        let tenant_id =
            tenant_id.ok_or_else(|| TenantryError::NotFound(format!("Domain {}", domain_id)))?;

        lock_tenant(&mut tx, tenant_id).await?;
        demote_primaries(&mut tx, tenant_id).await?;

        let row: Domain =
            sqlx::query_as("UPDATE domains SET is_primary = true WHERE id = $1 RETURNING *")
                .bind(domain_id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        tracing::info!(tenant_id = %tenant_id, domain = %row.domain, "Set primary domain");
        Ok(row)
    }

    pub async fn deactivate_domain(&self, domain_id: DomainId) -> TenantryResult<Domain> {
        let row: Domain = sqlx::query_as(
            "UPDATE domains SET is_active = false, is_primary = false WHERE id = $1 RETURNING *",
        )
        .bind(domain_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TenantryError::NotFound(format!("Domain {}", domain_id)))?;

        self.cache.invalidate_host(&row.domain);
        Ok(row)
    }

    pub async fn get_domain(&self, domain_id: DomainId) -> TenantryResult<Domain> {
        sqlx::query_as("SELECT * FROM domains WHERE id = $1")
            .bind(domain_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TenantryError::NotFound(format!("Domain {}", domain_id)))
    }

    pub async fn list_domains(&self, scope: QueryScope) -> TenantryResult<Vec<Domain>> {
        let Some(tenant_id) = scope.sql_tenant_param() else {
            return Ok(Vec::new());
        };

        let domains = sqlx::query_as(
            r#"
            SELECT * FROM domains
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY is_primary DESC, domain ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(domains)
    }
}

async fn insert_tenant(conn: &mut PgConnection, tenant: &Tenant) -> TenantryResult<()> {
    sqlx::query(
        r#"
        INSERT INTO tenants (
            id, name, slug, description, is_active, contact_email, contact_phone,
            address, city, state, country, postal_code, settings, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(tenant.id)
    .bind(&tenant.name)
    .bind(&tenant.slug)
    .bind(&tenant.description)
    .bind(tenant.is_active)
    .bind(&tenant.contact_email)
    .bind(&tenant.contact_phone)
    .bind(&tenant.address)
    .bind(&tenant.city)
    .bind(&tenant.state)
    .bind(&tenant.country)
    .bind(&tenant.postal_code)
    .bind(&tenant.settings)
    .bind(tenant.created_at)
    .bind(tenant.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Serializes domain writes per tenant
async fn lock_tenant(conn: &mut PgConnection, tenant_id: TenantId) -> TenantryResult<()> {
    let found: Option<TenantId> = sqlx::query_scalar("SELECT id FROM tenants WHERE id = $1 FOR UPDATE")
        .bind(tenant_id)
        .fetch_optional(conn)
        .await?;
    found
        .map(|_| ())
        .ok_or_else(|| TenantryError::NotFound(format!("Tenant {}", tenant_id)))
}

async fn demote_primaries(conn: &mut PgConnection, tenant_id: TenantId) -> TenantryResult<()> {
    sqlx::query("UPDATE domains SET is_primary = false WHERE tenant_id = $1 AND is_primary")
        .bind(tenant_id)
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait]
impl TenantLookup for PgTenantDirectory {
    async fn active_tenant_by_domain(&self, host: &str) -> TenantryResult<Option<Tenant>> {
        let tenant = sqlx::query_as(
            r#"
            SELECT t.*
            FROM domains d
            JOIN tenants t ON t.id = d.tenant_id
            WHERE LOWER(d.domain) = $1
              AND d.is_active
              AND t.is_active
            "#,
        )
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    async fn active_tenant_by_slug(&self, slug: &str) -> TenantryResult<Option<Tenant>> {
        let tenant = sqlx::query_as("SELECT * FROM tenants WHERE slug = $1 AND is_active")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tenant)
    }

    async fn active_tenant_by_id(&self, id: TenantId) -> TenantryResult<Option<Tenant>> {
        let tenant = sqlx::query_as("SELECT * FROM tenants WHERE id = $1 AND is_active")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tenant)
    }
}
