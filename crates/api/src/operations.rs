//! Authorized entry points
//!
//! Every operation takes the caller's `RequestContext`, checks it with
//! `ensure_authorized` or narrows it with `scope_query`, and only then calls
//! into the directory and billing services. Single-row reads outside the
//! caller's scope answer `NotFound`.

use time::OffsetDateTime;

use tenantry_billing::{
    BillingAnalytics, BillingHistoryEntry, BillingSettingsUpdate, InvoiceWithItems, NewInvoice,
    NewPlan, PaymentReceipt, PaymentRequest, PlanChangeRequest,
};
use tenantry_shared::{
    ensure_authorized, scope_query, BillingSettings, Domain, DomainId, Invitation, Invoice,
    InvoiceId, Operation, Payment, PaymentId, Plan, PlanChange, PlanId, QueryScope, Role,
    Subscription, SubscriptionId, Tenant, TenantId, TenantScoped, TenantryError, User, UserId,
};

use crate::accounts::NewUser;
use crate::context::RequestContext;
use crate::directory::NewTenant;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// The plan catalog as a whole; it belongs to no tenant
struct PlanCatalogResource;

impl TenantScoped for PlanCatalogResource {
    fn tenant_id(&self) -> Option<TenantId> {
        None
    }

    fn resource_kind(&self) -> &'static str {
        "plan catalog"
    }
}

fn visible<R: TenantScoped>(ctx: &RequestContext, row: R, what: String) -> ApiResult<R> {
    if scope_query(&ctx.principal).permits(&row) {
        Ok(row)
    } else {
        Err(ApiError::NotFound(what))
    }
}

fn scope(ctx: &RequestContext) -> QueryScope {
    scope_query(&ctx.principal)
}

impl AppState {
    // =========================================================================
    // Tenants and domains
    // =========================================================================

    pub async fn create_tenant(&self, ctx: &RequestContext, input: NewTenant) -> ApiResult<Tenant> {
        if !ctx.principal.is_system_admin() {
            return Err(TenantryError::PermissionDenied("only administrators create tenants".into()).into());
        }
        Ok(self.directory.create_tenant(input).await?)
    }

    pub async fn get_tenant(&self, ctx: &RequestContext, id: TenantId) -> ApiResult<Tenant> {
        let tenant = self.directory.get_tenant(id).await?;
        visible(ctx, tenant, format!("Tenant {}", id))
    }

    pub async fn list_tenants(&self, ctx: &RequestContext) -> ApiResult<Vec<Tenant>> {
        Ok(self.directory.list_tenants(scope(ctx)).await?)
    }

    pub async fn deactivate_tenant(&self, ctx: &RequestContext, id: TenantId) -> ApiResult<Tenant> {
        let tenant = self.directory.get_tenant(id).await?;
        ensure_authorized(&ctx.principal, &tenant, Operation::Write)?;
        Ok(self.directory.deactivate_tenant(id).await?)
    }

    pub async fn add_domain(
        &self,
        ctx: &RequestContext,
        tenant_id: TenantId,
        domain: &str,
        is_primary: bool,
    ) -> ApiResult<Domain> {
        let tenant = self.directory.get_tenant(tenant_id).await?;
        ensure_authorized(&ctx.principal, &tenant, Operation::Write)?;
        Ok(self.directory.add_domain(tenant_id, domain, is_primary).await?)
    }

    pub async fn set_primary_domain(&self, ctx: &RequestContext, id: DomainId) -> ApiResult<Domain> {
        let domain = self.directory.get_domain(id).await?;
        ensure_authorized(&ctx.principal, &domain, Operation::Write)?;
        Ok(self.directory.set_primary_domain(id).await?)
    }

    pub async fn deactivate_domain(&self, ctx: &RequestContext, id: DomainId) -> ApiResult<Domain> {
        let domain = self.directory.get_domain(id).await?;
        ensure_authorized(&ctx.principal, &domain, Operation::Write)?;
        Ok(self.directory.deactivate_domain(id).await?)
    }

    pub async fn list_domains(&self, ctx: &RequestContext) -> ApiResult<Vec<Domain>> {
        Ok(self.directory.list_domains(scope(ctx)).await?)
    }

    // =========================================================================
    // Invitations
    // =========================================================================

    /// Invite someone into the caller's acting tenant
    pub async fn invite(&self, ctx: &RequestContext, email: &str, role: Role) -> ApiResult<Invitation> {
        let inviter = ctx
            .principal
            .user_id
            .ok_or_else(|| TenantryError::PermissionDenied("invitations need a signed-in user".into()))?;
        let tenant_id = ctx
            .acting_tenant()
            .ok_or_else(|| TenantryError::validation("tenant_id", "no tenant for this request"))?;

        let tenant = self.directory.get_tenant(tenant_id).await?;
        ensure_authorized(&ctx.principal, &tenant, Operation::Write)?;

        Ok(self
            .invitations
            .create_invitation(tenant_id, email, role, inviter)
            .await?)
    }

    /// The caller joins the inviting tenant
    pub async fn accept_invitation(&self, ctx: &RequestContext, token: &str) -> ApiResult<User> {
        let user_id = match (ctx.principal.is_authenticated, ctx.principal.user_id) {
            (true, Some(id)) => id,
            _ => {
                return Err(TenantryError::PermissionDenied(
                    "sign in to accept an invitation".into(),
                )
                .into())
            }
        };
        let (_, user) = self.invitations.accept_invitation(token, user_id).await?;
        Ok(user)
    }

    /// Declining only needs the token
    pub async fn decline_invitation(&self, token: &str) -> ApiResult<Invitation> {
        Ok(self.invitations.decline_invitation(token).await?)
    }

    pub async fn list_invitations(&self, ctx: &RequestContext) -> ApiResult<Vec<Invitation>> {
        Ok(self.invitations.list_invitations(scope(ctx)).await?)
    }

    pub async fn get_user(&self, ctx: &RequestContext, id: UserId) -> ApiResult<User> {
        let user = self.accounts.get_user(id).await?;
        if ctx.principal.user_id == Some(id) && ctx.principal.is_authenticated {
            return Ok(user);
        }
        visible(ctx, user, format!("User {}", id))
    }

    pub async fn list_users(&self, ctx: &RequestContext) -> ApiResult<Vec<User>> {
        Ok(self.accounts.list_users(scope(ctx)).await?)
    }

    /// Administrators place users anywhere; everyone else adds users to
    /// their own tenant and cannot mint administrators
    pub async fn create_user(&self, ctx: &RequestContext, input: NewUser) -> ApiResult<User> {
        let is_admin = ctx.principal.is_system_admin();
        if input.role.is_system_admin() && !is_admin {
            return Err(TenantryError::PermissionDenied(
                "only administrators create administrators".into(),
            )
            .into());
        }

        let tenant_id = if is_admin {
            input.tenant_id
        } else {
            let own = ctx.principal.tenant_id.ok_or_else(|| {
                TenantryError::PermissionDenied("users without a tenant cannot add users".into())
            })?;
            Some(own)
        };
        if let Some(tenant_id) = tenant_id {
            let tenant = self.directory.get_tenant(tenant_id).await?;
            ensure_authorized(&ctx.principal, &tenant, Operation::Write)?;
        }

        Ok(self.accounts.create_user(&input.email, input.role, tenant_id).await?)
    }

    /// Self-service signup: a new tenant and its `tenant_admin`
    pub async fn register(&self, tenant: NewTenant, email: &str) -> ApiResult<(Tenant, User)> {
        Ok(self.directory.register(tenant, email).await?)
    }

    pub async fn request_password_reset(&self, email: &str) -> ApiResult<()> {
        Ok(self.accounts.request_password_reset(email).await?)
    }

    // =========================================================================
    // Plan catalog
    // =========================================================================

    pub async fn create_plan(&self, ctx: &RequestContext, input: NewPlan) -> ApiResult<Plan> {
        ensure_authorized(&ctx.principal, &PlanCatalogResource, Operation::Write)?;
        Ok(self.plans.create_plan(input).await?)
    }

    pub async fn list_active_plans(&self, ctx: &RequestContext) -> ApiResult<Vec<Plan>> {
        ensure_authorized(&ctx.principal, &PlanCatalogResource, Operation::Read)?;
        Ok(self.plans.list_active_plans().await?)
    }

    pub async fn get_plan(&self, ctx: &RequestContext, id: PlanId) -> ApiResult<Plan> {
        ensure_authorized(&ctx.principal, &PlanCatalogResource, Operation::Read)?;
        Ok(self.plans.get_plan(id).await?)
    }

    pub async fn deactivate_plan(&self, ctx: &RequestContext, id: PlanId) -> ApiResult<Plan> {
        let plan = self.plans.get_plan(id).await?;
        ensure_authorized(&ctx.principal, &plan, Operation::Write)?;
        Ok(self.plans.deactivate_plan(id).await?)
    }

    pub async fn delete_plan(&self, ctx: &RequestContext, id: PlanId) -> ApiResult<()> {
        let plan = self.plans.get_plan(id).await?;
        ensure_authorized(&ctx.principal, &plan, Operation::Write)?;
        Ok(self.plans.delete_plan(id).await?)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub async fn subscribe(
        &self,
        ctx: &RequestContext,
        tenant_id: TenantId,
        plan_id: PlanId,
        trial_days: Option<i64>,
    ) -> ApiResult<Subscription> {
        let tenant = self.directory.get_tenant(tenant_id).await?;
        ensure_authorized(&ctx.principal, &tenant, Operation::Write)?;
        Ok(self.subscriptions.create(tenant_id, plan_id, trial_days).await?)
    }

    pub async fn get_subscription(&self, ctx: &RequestContext, id: SubscriptionId) -> ApiResult<Subscription> {
        let sub = self.subscriptions.get(id).await?;
        visible(ctx, sub, format!("Subscription {}", id))
    }

    /// The tenant's live (`active` or `trial`) subscription, if any
    pub async fn current_subscription(
        &self,
        ctx: &RequestContext,
        tenant_id: TenantId,
    ) -> ApiResult<Option<Subscription>> {
        self.get_tenant(ctx, tenant_id).await?;
        Ok(self.subscriptions.current_for_tenant(tenant_id).await?)
    }

    pub async fn list_subscriptions(&self, ctx: &RequestContext) -> ApiResult<Vec<Subscription>> {
        Ok(self.subscriptions.list(scope(ctx)).await?)
    }

    async fn writable_subscription(
        &self,
        ctx: &RequestContext,
        id: SubscriptionId,
    ) -> ApiResult<Subscription> {
        let sub = self.subscriptions.get(id).await?;
        ensure_authorized(&ctx.principal, &sub, Operation::Write)?;
        Ok(sub)
    }

    pub async fn activate_subscription(&self, ctx: &RequestContext, id: SubscriptionId) -> ApiResult<Subscription> {
        self.writable_subscription(ctx, id).await?;
        Ok(self.subscriptions.activate(id).await?)
    }

    pub async fn cancel_subscription(
        &self,
        ctx: &RequestContext,
        id: SubscriptionId,
        at_period_end: bool,
    ) -> ApiResult<Subscription> {
        self.writable_subscription(ctx, id).await?;
        Ok(self.subscriptions.cancel(id, at_period_end).await?)
    }

    pub async fn reactivate_subscription(&self, ctx: &RequestContext, id: SubscriptionId) -> ApiResult<Subscription> {
        self.writable_subscription(ctx, id).await?;
        Ok(self.subscriptions.reactivate(id).await?)
    }

    pub async fn change_plan(
        &self,
        ctx: &RequestContext,
        id: SubscriptionId,
        new_plan_id: PlanId,
        effective_date: Option<OffsetDateTime>,
        reason: Option<String>,
    ) -> ApiResult<(Subscription, PlanChange)> {
        self.writable_subscription(ctx, id).await?;
        let request = PlanChangeRequest {
            new_plan_id,
            changed_by: ctx.principal.user_id,
            effective_date,
            reason,
        };
        Ok(self.subscriptions.change_plan(id, request).await?)
    }

    pub async fn plan_changes(&self, ctx: &RequestContext, id: SubscriptionId) -> ApiResult<Vec<PlanChange>> {
        self.get_subscription(ctx, id).await?;
        Ok(self.subscriptions.plan_changes(id).await?)
    }

    pub async fn record_usage(
        &self,
        ctx: &RequestContext,
        id: SubscriptionId,
        counter: &str,
        delta: i64,
    ) -> ApiResult<i64> {
        self.writable_subscription(ctx, id).await?;
        Ok(self.subscriptions.record_usage(id, counter, delta).await?)
    }

    // =========================================================================
    // Invoices and payments
    // =========================================================================

    pub async fn generate_invoice(&self, ctx: &RequestContext, id: SubscriptionId) -> ApiResult<InvoiceWithItems> {
        self.writable_subscription(ctx, id).await?;
        Ok(self.invoices.generate_invoice(id).await?)
    }

    pub async fn create_invoice(&self, ctx: &RequestContext, input: NewInvoice) -> ApiResult<InvoiceWithItems> {
        self.writable_subscription(ctx, input.subscription_id).await?;
        Ok(self.invoices.create_invoice(input).await?)
    }

    pub async fn get_invoice(&self, ctx: &RequestContext, id: InvoiceId) -> ApiResult<InvoiceWithItems> {
        let invoice = self.invoices.get(id).await?;
        let invoice = visible(ctx, invoice, format!("Invoice {}", id))?;
        let items = self.invoices.items(id).await?;
        Ok(InvoiceWithItems { invoice, items })
    }

    pub async fn list_invoices(&self, ctx: &RequestContext) -> ApiResult<Vec<Invoice>> {
        Ok(self.invoices.list(scope(ctx)).await?)
    }

    async fn writable_invoice(&self, ctx: &RequestContext, id: InvoiceId) -> ApiResult<Invoice> {
        let invoice = self.invoices.get(id).await?;
        ensure_authorized(&ctx.principal, &invoice, Operation::Write)?;
        Ok(invoice)
    }

    pub async fn void_invoice(&self, ctx: &RequestContext, id: InvoiceId) -> ApiResult<Invoice> {
        self.writable_invoice(ctx, id).await?;
        Ok(self.invoices.void_invoice(id).await?)
    }

    pub async fn mark_invoice_uncollectible(&self, ctx: &RequestContext, id: InvoiceId) -> ApiResult<Invoice> {
        self.writable_invoice(ctx, id).await?;
        Ok(self.invoices.mark_uncollectible(id).await?)
    }

    pub async fn process_payment(&self, ctx: &RequestContext, request: PaymentRequest) -> ApiResult<PaymentReceipt> {
        let invoice = self.writable_invoice(ctx, request.invoice_id).await?;
        tracing::debug!(
            invoice_id = %invoice.id,
            tenant_id = %invoice.tenant_id,
            user_id = ?ctx.principal.user_id,
            "Processing payment"
        );
        Ok(self.payments.process_payment(request).await?)
    }

    pub async fn list_payments(&self, ctx: &RequestContext) -> ApiResult<Vec<Payment>> {
        Ok(self.payments.list(scope(ctx)).await?)
    }

    pub async fn get_payment(&self, ctx: &RequestContext, id: PaymentId) -> ApiResult<Payment> {
        let payment = self.payments.get(id).await?;
        visible(ctx, payment, format!("Payment {}", id))
    }

    pub async fn billing_settings(&self, ctx: &RequestContext, tenant_id: TenantId) -> ApiResult<BillingSettings> {
        self.get_tenant(ctx, tenant_id).await?;
        Ok(self.settings.get(tenant_id).await?)
    }

    pub async fn update_billing_settings(
        &self,
        ctx: &RequestContext,
        tenant_id: TenantId,
        update: BillingSettingsUpdate,
    ) -> ApiResult<BillingSettings> {
        let tenant = self.directory.get_tenant(tenant_id).await?;
        ensure_authorized(&ctx.principal, &tenant, Operation::Write)?;
        Ok(self.settings.update(tenant_id, update).await?)
    }

    pub async fn billing_history(&self, ctx: &RequestContext) -> ApiResult<Vec<BillingHistoryEntry>> {
        Ok(self.reports.billing_history(scope(ctx)).await?)
    }

    pub async fn billing_analytics(&self, ctx: &RequestContext) -> ApiResult<BillingAnalytics> {
        Ok(self.reports.billing_analytics(scope(ctx)).await?)
    }

    pub async fn export_billing_history(&self, ctx: &RequestContext) -> ApiResult<String> {
        Ok(self.reports.export_history_csv(scope(ctx)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantry_shared::{authorize, Decision, Principal, UserId};

    #[test]
    fn test_catalog_writes_need_an_admin() {
        let tenant = TenantId::new();
        let member = Principal::authenticated(UserId::new(), Role::TenantAdmin, Some(tenant));
        let admin = Principal::system_admin(UserId::new());

        assert_eq!(
            authorize(&member, &PlanCatalogResource, Operation::Write),
            Decision::Deny
        );
        assert_eq!(
            authorize(&member, &PlanCatalogResource, Operation::Read),
            Decision::Allow
        );
        assert_eq!(
            authorize(&admin, &PlanCatalogResource, Operation::Write),
            Decision::Allow
        );
        assert_eq!(
            authorize(&Principal::anonymous(), &PlanCatalogResource, Operation::Read),
            Decision::Deny
        );
    }
}
