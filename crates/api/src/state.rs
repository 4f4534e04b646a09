//! Application state shared across handlers and jobs

use std::sync::Arc;

use sqlx::PgPool;

use tenantry_billing::{
    BillingReports, BillingSettingsService, InvoiceService, PaymentGateway, PaymentService,
    PlanCatalog, SubscriptionService,
};
use tenantry_shared::Notifier;

use crate::accounts::AccountService;
use crate::config::Config;
use crate::directory::PgTenantDirectory;
use crate::invitations::InvitationService;
use crate::routing::{ResolverConfig, TenantCache, TenantResolver};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub resolver: TenantResolver,
    pub directory: PgTenantDirectory,
    pub invitations: InvitationService,
    pub accounts: AccountService,
    pub plans: PlanCatalog,
    pub subscriptions: SubscriptionService,
    pub invoices: InvoiceService,
    pub payments: PaymentService,
    pub reports: BillingReports,
    pub settings: BillingSettingsService,
}

impl AppState {
    /// Wire every service onto one pool. The directory and the resolver share
    /// a host cache so directory writes evict stale resolutions.
    pub fn new(
        pool: PgPool,
        config: Config,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let cache = Arc::new(TenantCache::with_ttl(config.domain_cache_ttl));
        let directory = PgTenantDirectory::new(pool.clone(), cache.clone());
        let resolver = TenantResolver::with_cache(
            Arc::new(directory.clone()),
            ResolverConfig::from(&config),
            cache,
        );

        Self {
            resolver,
            directory,
            invitations: InvitationService::new(
                pool.clone(),
                notifier.clone(),
                config.invitation_hmac_secret.clone(),
                config.invitation_expiry_days,
            ),
            accounts: AccountService::new(pool.clone(), notifier.clone()),
            plans: PlanCatalog::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            invoices: InvoiceService::new(pool.clone(), config.billing.clone()),
            payments: PaymentService::new(pool.clone(), gateway, notifier, config.billing.clone()),
            reports: BillingReports::new(pool.clone()),
            settings: BillingSettingsService::new(pool.clone()),
            config: Arc::new(config),
            pool,
        }
    }
}
