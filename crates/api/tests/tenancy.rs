//! Database-backed tests for the tenant directory, resolution, invitations
//! and cross-tenant isolation
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/tenantry_test"
//! cargo test -p tenantry-api --test tenancy -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serial_test::serial;
use sqlx::PgPool;
use uuid::Uuid;

use tenantry_api::config::{DEFAULT_EXEMPT_PATHS, DEFAULT_RESERVED_SUBDOMAINS, DEFAULT_TENANT_HEADER};
use tenantry_api::routing::Resolution;
use tenantry_api::{
    ApiError, AppState, Config, NewTenant, NewUser, RequestContext, TenantContext,
};
use tenantry_billing::{BillingConfig, BillingSettingsUpdate, NewPlan, PaymentRequest, SimulatedGateway};
use tenantry_shared::{
    BillingCycle, LogNotifier, PaymentMethod, Principal, Role, SubscriptionStatus, Tenant,
    TenantId, User, UserId,
};

// ============================================================================
// Test Utilities
// ============================================================================

fn test_config(database_url: String) -> Config {
    Config {
        public_url: "http://localhost:3000".into(),
        database_url,
        database_max_connections: 10,
        tenant_header: DEFAULT_TENANT_HEADER.into(),
        reserved_subdomains: DEFAULT_RESERVED_SUBDOMAINS.iter().map(|s| s.to_string()).collect(),
        exempt_paths: DEFAULT_EXEMPT_PATHS.iter().map(|s| s.to_string()).collect(),
        domain_cache_ttl: Duration::from_secs(300),
        invitation_hmac_secret: "tenancy-test-secret-of-at-least-32-chars".into(),
        invitation_expiry_days: 7,
        billing: BillingConfig::default(),
    }
}

async fn setup() -> (AppState, PgPool) {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = tenantry_shared::create_pool(&database_url, 10)
        .await
        .expect("Failed to connect to test database");
    tenantry_shared::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let state = AppState::new(
        pool.clone(),
        test_config(database_url),
        Arc::new(SimulatedGateway::approving()),
        Arc::new(LogNotifier),
    );
    (state, pool)
}

fn admin() -> RequestContext {
    RequestContext::new(Principal::system_admin(UserId::new()), TenantContext::none())
}

fn as_user(user: &User) -> RequestContext {
    RequestContext::new(Principal::from(user), TenantContext::none())
}

async fn create_tenant(state: &AppState, name: &str) -> Tenant {
    state
        .create_tenant(&admin(), NewTenant::named(format!("{} {}", name, Uuid::new_v4().simple())))
        .await
        .expect("Failed to create test tenant")
}

fn unique_email(prefix: &str) -> String {
    format!("{}-{}@example.com", prefix, Uuid::new_v4().simple())
}

fn unique_domain(prefix: &str) -> String {
    format!("{}-{}.tenancy.test", prefix, Uuid::new_v4().simple())
}

async fn cleanup(pool: &PgPool, tenants: &[TenantId]) {
    for tenant_id in tenants {
        for statement in [
            "DELETE FROM payments WHERE tenant_id = $1",
            "DELETE FROM invoice_items WHERE invoice_id IN (SELECT id FROM invoices WHERE tenant_id = $1)",
            "DELETE FROM invoices WHERE tenant_id = $1",
            "DELETE FROM plan_changes WHERE subscription_id IN (SELECT id FROM subscriptions WHERE tenant_id = $1)",
            "DELETE FROM subscriptions WHERE tenant_id = $1",
            "DELETE FROM billing_settings WHERE tenant_id = $1",
            "DELETE FROM invitations WHERE tenant_id = $1",
            "DELETE FROM users WHERE tenant_id = $1",
            "DELETE FROM domains WHERE tenant_id = $1",
            "DELETE FROM tenants WHERE id = $1",
        ] {
            sqlx::query(statement).bind(tenant_id).execute(pool).await.ok();
        }
    }
}

// ============================================================================
// Directory
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
#[serial(sqlx_db)]
async fn test_tenant_keeps_a_single_primary_domain() {
    let (state, pool) = setup().await;
    let tenant = create_tenant(&state, "Primary").await;
    let ctx = admin();

    let first = state
        .add_domain(&ctx, tenant.id, &unique_domain("first"), true)
        .await
        .unwrap();
    let second = state
        .add_domain(&ctx, tenant.id, &unique_domain("second"), true)
        .await
        .unwrap();

    let primaries = |domains: Vec<tenantry_shared::Domain>| -> Vec<_> {
        domains
            .into_iter()
            .filter(|d| d.tenant_id == tenant.id && d.is_primary)
            .map(|d| d.id)
            .collect()
    };

    let domains = state.list_domains(&ctx).await.unwrap();
    assert_eq!(primaries(domains), vec![second.id]);

    state.set_primary_domain(&ctx, first.id).await.unwrap();
    let domains = state.list_domains(&ctx).await.unwrap();
    assert_eq!(primaries(domains), vec![first.id]);

    cleanup(&pool, &[tenant.id]).await;
}

#[tokio::test]
#[ignore] // Requires database
#[serial(sqlx_db)]
async fn test_duplicate_domain_conflicts() {
    let (state, pool) = setup().await;
    let a = create_tenant(&state, "Dup A").await;
    let b = create_tenant(&state, "Dup B").await;
    let domain = unique_domain("shared");

    state.add_domain(&admin(), a.id, &domain, false).await.unwrap();
    let err = state
        .add_domain(&admin(), b.id, &domain.to_uppercase(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)), "{err:?}");

    cleanup(&pool, &[a.id, b.id]).await;
}

// ============================================================================
// Resolution
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
#[serial(sqlx_db)]
async fn test_resolution_by_domain_subdomain_and_header() {
    let (state, pool) = setup().await;
    let tenant = create_tenant(&state, "Resolve").await;
    let domain = unique_domain("shop");
    state.add_domain(&admin(), tenant.id, &domain, true).await.unwrap();

    let by_domain = state
        .resolver
        .resolve(Some(&format!("{}:8443", domain.to_uppercase())), None, "/")
        .await
        .unwrap()
        .expect("domain should resolve");
    assert_eq!(by_domain.tenant_id, tenant.id);
    assert_eq!(by_domain.resolution, Resolution::Domain);

    let by_subdomain = state
        .resolver
        .resolve(Some(&format!("{}.platform.test", tenant.slug)), None, "/")
        .await
        .unwrap()
        .expect("subdomain should resolve");
    assert_eq!(by_subdomain.tenant_id, tenant.id);
    assert_eq!(by_subdomain.resolution, Resolution::Subdomain);

    let header = tenant.id.to_string();
    let by_header = state
        .resolver
        .resolve(Some("unknown.platform.test"), Some(&header), "/")
        .await
        .unwrap()
        .expect("header should resolve");
    assert_eq!(by_header.resolution, Resolution::Header);

    // Exempt paths never resolve
    assert!(state
        .resolver
        .resolve(Some(&domain), Some(&header), "/health/")
        .await
        .unwrap()
        .is_none());

    // Deactivation evicts cached resolutions
    state.deactivate_tenant(&admin(), tenant.id).await.unwrap();
    assert!(state.resolver.resolve(Some(&domain), None, "/").await.unwrap().is_none());
    assert!(state.resolver.resolve(None, Some(&header), "/").await.unwrap().is_none());

    cleanup(&pool, &[tenant.id]).await;
}

// ============================================================================
// Isolation
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
#[serial(sqlx_db)]
async fn test_tenant_admin_cannot_reach_another_tenant() {
    let (state, pool) = setup().await;
    let a = create_tenant(&state, "Iso A").await;
    let b = create_tenant(&state, "Iso B").await;

    let owner = state
        .accounts
        .create_user(&unique_email("owner"), Role::TenantAdmin, Some(a.id))
        .await
        .unwrap();
    let ctx = as_user(&owner);

    let err = state
        .add_domain(&ctx, b.id, &unique_domain("steal"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::PermissionDenied(_)), "{err:?}");

    let err = state.get_tenant(&ctx, b.id).await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)), "{err:?}");

    let visible = state.list_tenants(&ctx).await.unwrap();
    assert_eq!(visible.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a.id]);

    let err = state
        .create_tenant(&ctx, NewTenant::named("Not allowed"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::PermissionDenied(_)), "{err:?}");

    // Own tenant is writable
    state
        .add_domain(&ctx, a.id, &unique_domain("own"), true)
        .await
        .unwrap();

    cleanup(&pool, &[a.id, b.id]).await;
}

// ============================================================================
// Invitations
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
#[serial(sqlx_db)]
async fn test_invitation_accept_moves_user_into_tenant() {
    let (state, pool) = setup().await;
    let tenant = create_tenant(&state, "Invite").await;
    let elsewhere = create_tenant(&state, "Elsewhere").await;

    let owner = state
        .accounts
        .create_user(&unique_email("owner"), Role::TenantAdmin, Some(tenant.id))
        .await
        .unwrap();
    let invitee = state
        .accounts
        .create_user(&unique_email("invitee"), Role::User, Some(elsewhere.id))
        .await
        .unwrap();

    let invitation = state
        .invite(&as_user(&owner), &invitee.email, Role::User)
        .await
        .unwrap();
    assert_eq!(invitation.tenant_id, tenant.id);

    let joined = state
        .accept_invitation(&as_user(&invitee), &invitation.token)
        .await
        .unwrap();
    assert_eq!(joined.tenant_id, Some(tenant.id));
    assert_eq!(joined.role, Role::User);

    // A used invitation cannot be accepted again
    assert!(state
        .accept_invitation(&as_user(&invitee), &invitation.token)
        .await
        .is_err());

    // Forged tokens are rejected before touching the database
    let forged = format!("{}.0000000000000000", invitation.id);
    let err = state
        .accept_invitation(&as_user(&invitee), &forged)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Validation { .. }), "{err:?}");

    cleanup(&pool, &[tenant.id, elsewhere.id]).await;
}

#[tokio::test]
#[ignore] // Requires database
#[serial(sqlx_db)]
async fn test_password_reset_does_not_reveal_accounts() {
    let (state, _pool) = setup().await;

    assert!(state
        .request_password_reset(&unique_email("nobody"))
        .await
        .is_ok());
    assert!(state.request_password_reset("  ").await.is_err());
}

// ============================================================================
// Billing
// ============================================================================

fn pro_plan() -> NewPlan {
    NewPlan {
        name: format!("Pro {}", Uuid::new_v4().simple()),
        slug: None,
        description: None,
        price: Decimal::new(2900, 2),
        currency: "USD".into(),
        billing_cycle: BillingCycle::Monthly,
        max_users: 10,
        max_storage_gb: 50,
        max_api_calls: 100_000,
        features: vec![],
        is_popular: false,
        sort_order: 0,
    }
}

#[tokio::test]
#[ignore] // Requires database
#[serial(sqlx_db)]
async fn test_billing_through_authorized_operations() {
    let (state, pool) = setup().await;
    let acme = create_tenant(&state, "Acme").await;
    let rival = create_tenant(&state, "Rival").await;

    let owner = state
        .accounts
        .create_user(&unique_email("acme"), Role::TenantAdmin, Some(acme.id))
        .await
        .unwrap();
    let rival_owner = state
        .accounts
        .create_user(&unique_email("rival"), Role::TenantAdmin, Some(rival.id))
        .await
        .unwrap();
    let ctx = as_user(&owner);
    let rival_ctx = as_user(&rival_owner);

    // Catalog writes are admin only
    let err = state.create_plan(&ctx, pro_plan()).await.unwrap_err();
    assert!(matches!(err, ApiError::PermissionDenied(_)), "{err:?}");
    let plan = state.create_plan(&admin(), pro_plan()).await.unwrap();
    assert!(state
        .list_active_plans(&ctx)
        .await
        .unwrap()
        .iter()
        .any(|p| p.id == plan.id));

    let sub = state.subscribe(&ctx, acme.id, plan.id, None).await.unwrap();
    state.activate_subscription(&ctx, sub.id).await.unwrap();
    let current = state.current_subscription(&ctx, acme.id).await.unwrap();
    assert_eq!(current.map(|s| s.id), Some(sub.id));

    assert_eq!(state.record_usage(&ctx, sub.id, "api_calls", 5).await.unwrap(), 5);
    assert_eq!(state.record_usage(&ctx, sub.id, "api_calls", 3).await.unwrap(), 8);
    let err = state
        .record_usage(&rival_ctx, sub.id, "api_calls", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::PermissionDenied(_)), "{err:?}");

    // The rival tenant can neither see nor change Acme's subscription
    let err = state.get_subscription(&rival_ctx, sub.id).await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)), "{err:?}");
    let err = state
        .cancel_subscription(&rival_ctx, sub.id, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::PermissionDenied(_)), "{err:?}");
    assert!(state.list_subscriptions(&rival_ctx).await.unwrap().is_empty());

    let update = BillingSettingsUpdate {
        grace_period_days: Some(14),
        ..Default::default()
    };
    state
        .update_billing_settings(&ctx, acme.id, update)
        .await
        .unwrap();
    assert_eq!(
        state.billing_settings(&ctx, acme.id).await.unwrap().grace_period_days,
        14
    );
    let err = state
        .update_billing_settings(&rival_ctx, acme.id, BillingSettingsUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::PermissionDenied(_)), "{err:?}");

    let invoice = state.generate_invoice(&ctx, sub.id).await.unwrap().invoice;
    assert_eq!(invoice.total_amount, plan.price);
    let err = state.get_invoice(&rival_ctx, invoice.id).await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)), "{err:?}");

    let request = |external: Option<String>| PaymentRequest {
        invoice_id: invoice.id,
        amount: None,
        method: PaymentMethod::Card,
        external_payment_id: external,
    };
    let err = state
        .process_payment(&rival_ctx, request(None))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::PermissionDenied(_)), "{err:?}");

    let receipt = state
        .process_payment(&ctx, request(Some(format!("ext-{}", Uuid::new_v4()))))
        .await
        .unwrap();
    assert!(receipt.succeeded());
    assert!(receipt.invoice_paid);
    assert_eq!(
        state.get_payment(&ctx, receipt.payment.id).await.unwrap().invoice_id,
        invoice.id
    );
    assert_eq!(state.list_payments(&ctx).await.unwrap().len(), 1);
    assert_eq!(state.list_invoices(&ctx).await.unwrap().len(), 1);
    assert!(state.list_invoices(&rival_ctx).await.unwrap().is_empty());

    // A paid invoice is final
    let err = state
        .mark_invoice_uncollectible(&ctx, invoice.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)), "{err:?}");

    let csv = state.export_billing_history(&ctx).await.unwrap();
    assert!(csv.contains(&invoice.invoice_number));
    assert!(!state
        .export_billing_history(&rival_ctx)
        .await
        .unwrap()
        .contains(&invoice.invoice_number));

    state.cancel_subscription(&ctx, sub.id, false).await.unwrap();
    let back = state.reactivate_subscription(&ctx, sub.id).await.unwrap();
    assert_eq!(back.status, SubscriptionStatus::Active);

    cleanup(&pool, &[acme.id, rival.id]).await;
    sqlx::query("DELETE FROM plans WHERE id = $1")
        .bind(plan.id)
        .execute(&pool)
        .await
        .ok();
}

#[tokio::test]
#[ignore] // Requires database
#[serial(sqlx_db)]
async fn test_users_see_themselves_and_their_tenant() {
    let (state, pool) = setup().await;
    let acme = create_tenant(&state, "People").await;
    let rival = create_tenant(&state, "Strangers").await;

    let member = state
        .accounts
        .create_user(&unique_email("member"), Role::User, Some(acme.id))
        .await
        .unwrap();
    let colleague = state
        .accounts
        .create_user(&unique_email("colleague"), Role::User, Some(acme.id))
        .await
        .unwrap();
    let stranger = state
        .accounts
        .create_user(&unique_email("stranger"), Role::User, Some(rival.id))
        .await
        .unwrap();

    let ctx = as_user(&member);
    assert_eq!(state.get_user(&ctx, member.id).await.unwrap().id, member.id);
    assert_eq!(state.get_user(&ctx, colleague.id).await.unwrap().id, colleague.id);
    let err = state.get_user(&ctx, stranger.id).await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)), "{err:?}");

    cleanup(&pool, &[acme.id, rival.id]).await;
}

#[tokio::test]
#[ignore] // Requires database
#[serial(sqlx_db)]
async fn test_user_directory_is_tenant_scoped() {
    let (state, pool) = setup().await;
    let acme = create_tenant(&state, "Roster").await;
    let rival = create_tenant(&state, "Other Roster").await;

    let owner = state
        .create_user(
            &admin(),
            NewUser {
                email: unique_email("owner"),
                role: Role::TenantAdmin,
                tenant_id: Some(acme.id),
            },
        )
        .await
        .unwrap();
    assert_eq!(owner.tenant_id, Some(acme.id));
    let stranger = state
        .create_user(
            &admin(),
            NewUser {
                email: unique_email("stranger"),
                role: Role::User,
                tenant_id: Some(rival.id),
            },
        )
        .await
        .unwrap();

    // Members add users to their own tenant, whatever tenant they ask for
    let ctx = as_user(&owner);
    let hire = state
        .create_user(
            &ctx,
            NewUser {
                email: unique_email("hire"),
                role: Role::User,
                tenant_id: Some(rival.id),
            },
        )
        .await
        .unwrap();
    assert_eq!(hire.tenant_id, Some(acme.id));

    let err = state
        .create_user(
            &ctx,
            NewUser {
                email: unique_email("root"),
                role: Role::Admin,
                tenant_id: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::PermissionDenied(_)), "{err:?}");

    let roster = state.list_users(&ctx).await.unwrap();
    assert!(roster.iter().all(|u| u.tenant_id == Some(acme.id)));
    assert!(roster.iter().any(|u| u.id == hire.id));
    assert!(!roster.iter().any(|u| u.id == stranger.id));

    let everyone = state.list_users(&admin()).await.unwrap();
    assert!(everyone.iter().any(|u| u.id == stranger.id));

    // No tenant: sees nobody, adds nobody
    let tenantless = RequestContext::new(
        Principal::authenticated(UserId::new(), Role::User, None),
        TenantContext::none(),
    );
    assert!(state.list_users(&tenantless).await.unwrap().is_empty());
    let err = state
        .create_user(
            &tenantless,
            NewUser {
                email: unique_email("orphan"),
                role: Role::User,
                tenant_id: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::PermissionDenied(_)), "{err:?}");

    cleanup(&pool, &[acme.id, rival.id]).await;
}

#[tokio::test]
#[ignore] // Requires database
#[serial(sqlx_db)]
async fn test_registration_creates_tenant_and_admin_together() {
    let (state, pool) = setup().await;
    let email = unique_email("founder");

    let (tenant, founder) = state
        .register(NewTenant::named(format!("Founded {}", Uuid::new_v4().simple())), &email)
        .await
        .unwrap();
    assert_eq!(founder.tenant_id, Some(tenant.id));
    assert_eq!(founder.role, Role::TenantAdmin);

    // Same email again: the second tenant is rolled back with the user
    let second_name = format!("Second {}", Uuid::new_v4().simple());
    let err = state
        .register(NewTenant::named(second_name.clone()), &email)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)), "{err:?}");

    let tenants = state.list_tenants(&admin()).await.unwrap();
    assert!(!tenants.iter().any(|t| t.name == second_name));

    // The new admin manages their tenant
    let domain = unique_domain("founded");
    state
        .add_domain(&as_user(&founder), tenant.id, &domain, true)
        .await
        .unwrap();

    cleanup(&pool, &[tenant.id]).await;
}
