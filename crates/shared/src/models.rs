//! Persistent domain models and their in-memory state transitions.
//!
//! Every transition here is pure: it validates the current status, mutates the
//! value and reports what happened. Persisting services load a row under a
//! lock, apply the transition and write the row back in the same transaction.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use time::{Duration, OffsetDateTime};

use crate::error::LifecycleError;
use crate::types::*;

// =============================================================================
// Directory
// =============================================================================

/// An isolated customer organization
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
    pub settings: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Minimal user record; credentials live with the auth collaborator
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub tenant_id: Option<TenantId>,
    pub role: Role,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Domain {
    pub id: DomainId,
    pub tenant_id: TenantId,
    pub domain: String,
    pub is_primary: bool,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invitation {
    pub id: InvitationId,
    pub tenant_id: TenantId,
    pub email: String,
    pub role: Role,
    pub invited_by: UserId,
    #[serde(skip_serializing)]
    pub token: String,
    pub status: InvitationStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub accepted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Invitation {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    fn ensure_pending(&self) -> Result<(), LifecycleError> {
        if self.status != InvitationStatus::Pending {
            return Err(LifecycleError::invalid(
                "token",
                format!("invitation is already {}", self.status),
            ));
        }
        Ok(())
    }

    /// pending → accepted. Expired or non-pending invitations are invalid input.
    pub fn accept(&mut self, now: OffsetDateTime) -> Result<(), LifecycleError> {
        self.ensure_pending()?;
        if self.is_expired(now) {
            return Err(LifecycleError::invalid("token", "invitation has expired"));
        }
        self.status = InvitationStatus::Accepted;
        self.accepted_at = Some(now);
        Ok(())
    }

    /// pending → declined
    pub fn decline(&mut self) -> Result<(), LifecycleError> {
        self.ensure_pending()?;
        self.status = InvitationStatus::Declined;
        Ok(())
    }

    /// pending and past expiry → expired. Returns whether the status changed.
    pub fn expire(&mut self, now: OffsetDateTime) -> bool {
        if self.status == InvitationStatus::Pending && self.is_expired(now) {
            self.status = InvitationStatus::Expired;
            return true;
        }
        false
    }
}

// =============================================================================
// Plan Catalog
// =============================================================================

/// Usage counter names tracked on a subscription
pub const USAGE_USERS: &str = "users";
pub const USAGE_STORAGE_GB: &str = "storage_gb";
pub const USAGE_API_CALLS: &str = "api_calls";

/// Usage limits of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimits {
    pub max_users: i64,
    pub max_storage_gb: i64,
    pub max_api_calls: i64,
}

impl UsageLimits {
    /// Limit for a named counter, `None` for counters without a limit
    pub fn limit_for(&self, counter: &str) -> Option<i64> {
        match counter {
            USAGE_USERS => Some(self.max_users),
            USAGE_STORAGE_GB => Some(self.max_storage_gb),
            USAGE_API_CALLS => Some(self.max_api_calls),
            _ => None,
        }
    }
}

/// A purchasable service tier
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub max_users: i32,
    pub max_storage_gb: i32,
    pub max_api_calls: i64,
    pub features: Value,
    pub is_active: bool,
    pub is_popular: bool,
    pub sort_order: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Plan {
    /// Price normalised to one month
    pub fn monthly_price(&self) -> Decimal {
        let monthly = match self.billing_cycle {
            BillingCycle::Monthly => self.price,
            BillingCycle::Quarterly => self.price / Decimal::from(3),
            BillingCycle::Yearly => self.price / Decimal::from(12),
        };
        round_money(monthly)
    }

    /// Price normalised to one year
    pub fn yearly_price(&self) -> Decimal {
        let yearly = match self.billing_cycle {
            BillingCycle::Monthly => self.price * Decimal::from(12),
            BillingCycle::Quarterly => self.price * Decimal::from(4),
            BillingCycle::Yearly => self.price,
        };
        round_money(yearly)
    }

    pub fn limits(&self) -> UsageLimits {
        UsageLimits {
            max_users: i64::from(self.max_users),
            max_storage_gb: i64::from(self.max_storage_gb),
            max_api_calls: self.max_api_calls,
        }
    }

    /// Feature list; non-string entries are skipped
    pub fn feature_list(&self) -> Vec<String> {
        self.features
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub current_usage: Value,
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// New subscription on `plan`. With a trial window it starts in `trial`,
    /// otherwise `inactive`; the first period is [now, now + cycle).
    pub fn new(
        tenant_id: TenantId,
        plan: &Plan,
        trial_days: Option<i64>,
        now: OffsetDateTime,
    ) -> Result<Self, LifecycleError> {
        let (status, trial_start, trial_end) = match trial_days {
            Some(days) if days <= 0 => {
                return Err(LifecycleError::invalid(
                    "trial_days",
                    "trial length must be positive",
                ));
            }
            Some(days) => (
                SubscriptionStatus::Trial,
                Some(now),
                Some(now + Duration::days(days)),
            ),
            None => (SubscriptionStatus::Inactive, None, None),
        };

        Ok(Self {
            id: SubscriptionId::new(),
            tenant_id,
            plan_id: plan.id,
            status,
            current_period_start: now,
            current_period_end: now + plan.billing_cycle.period_length(),
            trial_start,
            trial_end,
            cancelled_at: None,
            cancel_at_period_end: false,
            current_usage: Value::Object(Default::default()),
            metadata: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trial
        )
    }

    pub fn is_trial(&self, now: OffsetDateTime) -> bool {
        self.trial_end.is_some_and(|end| end > now)
    }

    pub fn days_until_renewal(&self, now: OffsetDateTime) -> i64 {
        (self.current_period_end - now).whole_days().max(0)
    }

    /// Current value of a usage counter (0 when never recorded)
    pub fn usage(&self, counter: &str) -> i64 {
        self.current_usage
            .get(counter)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// Share of the plan's user limit in use, capped at 100. A zero limit is 0%.
    pub fn usage_percentage(&self, plan: &Plan) -> f64 {
        if plan.max_users <= 0 {
            return 0.0;
        }
        let pct = 100.0 * self.usage(USAGE_USERS) as f64 / f64::from(plan.max_users);
        pct.clamp(0.0, 100.0)
    }

    /// inactive/trial → active, period restarted from the plan's cycle
    pub fn activate(&mut self, plan: &Plan, now: OffsetDateTime) -> Result<(), LifecycleError> {
        if !matches!(
            self.status,
            SubscriptionStatus::Inactive | SubscriptionStatus::Trial
        ) {
            return Err(LifecycleError::transition("activate", self.status));
        }
        self.status = SubscriptionStatus::Active;
        self.current_period_start = now;
        self.current_period_end = now + plan.billing_cycle.period_length();
        self.updated_at = now;
        Ok(())
    }

    /// Cancel now or at the end of the running period.
    ///
    /// Returns `false` when the subscription was already cancelled and nothing
    /// changed.
    pub fn cancel(&mut self, at_period_end: bool, now: OffsetDateTime) -> Result<bool, LifecycleError> {
        if self.status == SubscriptionStatus::Cancelled {
            return Ok(false);
        }

        if at_period_end {
            if !self.status.is_live() {
                return Err(LifecycleError::transition(
                    "cancel at period end",
                    self.status,
                ));
            }
            self.cancel_at_period_end = true;
        } else {
            self.status = SubscriptionStatus::Cancelled;
            self.cancelled_at = Some(now);
            self.cancel_at_period_end = false;
        }
        self.updated_at = now;
        Ok(true)
    }

    /// cancelled → active
    pub fn reactivate(&mut self, now: OffsetDateTime) -> Result<(), LifecycleError> {
        if self.status != SubscriptionStatus::Cancelled {
            return Err(LifecycleError::transition("reactivate", self.status));
        }
        self.status = SubscriptionStatus::Active;
        self.cancelled_at = None;
        self.cancel_at_period_end = false;
        self.updated_at = now;
        Ok(())
    }

    /// Swap the plan reference and return the audit record to append.
    /// Status and billing period are untouched.
    pub fn change_plan(
        &mut self,
        new_plan: &Plan,
        changed_by: Option<UserId>,
        effective_date: OffsetDateTime,
        reason: Option<String>,
        now: OffsetDateTime,
    ) -> Result<PlanChange, LifecycleError> {
        if !new_plan.is_active {
            return Err(LifecycleError::invalid("plan_id", "plan is not active"));
        }
        if new_plan.id == self.plan_id {
            return Err(LifecycleError::invalid(
                "plan_id",
                "subscription is already on this plan",
            ));
        }

        let change = PlanChange {
            id: PlanChangeId::new(),
            subscription_id: self.id,
            old_plan_id: Some(self.plan_id),
            new_plan_id: new_plan.id,
            changed_by,
            effective_date,
            reason,
            created_at: now,
        };
        self.plan_id = new_plan.id;
        self.updated_at = now;
        Ok(change)
    }

    /// Add `delta` to a usage counter and return the new value
    pub fn record_usage(&mut self, counter: &str, delta: i64) -> Result<i64, LifecycleError> {
        if counter.trim().is_empty() {
            return Err(LifecycleError::invalid("counter", "counter name is required"));
        }
        let updated = self
            .usage(counter)
            .checked_add(delta)
            .ok_or_else(|| LifecycleError::invalid("delta", "usage counter overflow"))?;
        if updated < 0 {
            return Err(LifecycleError::invalid(
                "delta",
                format!("usage for '{}' cannot go below zero", counter),
            ));
        }

        if !self.current_usage.is_object() {
            self.current_usage = Value::Object(Default::default());
        }
        if let Some(map) = self.current_usage.as_object_mut() {
            map.insert(counter.to_string(), Value::from(updated));
        }
        Ok(updated)
    }

    /// Terminal step of a period-end cancellation once the period has elapsed.
    /// Returns whether the status changed.
    pub fn finalize_period_end(&mut self, now: OffsetDateTime) -> bool {
        if !self.cancel_at_period_end
            || self.status == SubscriptionStatus::Cancelled
            || self.current_period_end > now
        {
            return false;
        }
        self.status = SubscriptionStatus::Cancelled;
        self.cancelled_at = Some(self.current_period_end);
        self.cancel_at_period_end = false;
        self.updated_at = now;
        true
    }

    /// active → past_due
    pub fn mark_past_due(&mut self, now: OffsetDateTime) -> Result<(), LifecycleError> {
        if self.status != SubscriptionStatus::Active {
            return Err(LifecycleError::transition("mark past due", self.status));
        }
        self.status = SubscriptionStatus::PastDue;
        self.updated_at = now;
        Ok(())
    }
}

/// Immutable audit record of a plan swap
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanChange {
    pub id: PlanChangeId,
    pub subscription_id: SubscriptionId,
    pub old_plan_id: Option<PlanId>,
    pub new_plan_id: PlanId,
    pub changed_by: Option<UserId>,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_date: OffsetDateTime,
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Invoices & Payments
// =============================================================================

/// `subtotal + tax` unless an explicit total is supplied. Negative totals are rejected.
pub fn compute_total(
    subtotal: Decimal,
    tax_amount: Decimal,
    total_override: Option<Decimal>,
) -> Result<Decimal, LifecycleError> {
    let total = round_money(total_override.unwrap_or(subtotal + tax_amount));
    if total.is_sign_negative() && !total.is_zero() {
        return Err(LifecycleError::invalid(
            "total_amount",
            "invoice total cannot be negative",
        ));
    }
    Ok(total)
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: InvoiceId,
    pub tenant_id: TenantId,
    pub subscription_id: SubscriptionId,
    pub invoice_number: String,
    pub status: InvoiceStatus,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issue_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub due_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub billing_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub billing_period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Invoice {
    /// Open invoice for one period of `subscription` on `plan`, with its single
    /// line item. The period starts at `now` and lasts one plan cycle.
    pub fn for_subscription(
        subscription: &Subscription,
        plan: &Plan,
        invoice_number: String,
        due_in: Duration,
        now: OffsetDateTime,
    ) -> Result<(Invoice, InvoiceItem), LifecycleError> {
        let subtotal = round_money(plan.price);
        let tax_amount = Decimal::ZERO;
        let total_amount = compute_total(subtotal, tax_amount, None)?;

        let invoice = Invoice {
            id: InvoiceId::new(),
            tenant_id: subscription.tenant_id,
            subscription_id: subscription.id,
            invoice_number,
            status: InvoiceStatus::Open,
            subtotal,
            tax_amount,
            total_amount,
            currency: plan.currency.clone(),
            issue_date: now,
            due_date: now + due_in,
            paid_date: None,
            billing_period_start: now,
            billing_period_end: now + plan.billing_cycle.period_length(),
            created_at: now,
            updated_at: now,
        };

        let item = InvoiceItem::new(
            invoice.id,
            format!("{} plan ({})", plan.name, plan.billing_cycle),
            1,
            plan.price,
            None,
        )?;

        Ok((invoice, item))
    }

    /// Whether the billing period contains `at`
    pub fn covers(&self, at: OffsetDateTime) -> bool {
        self.billing_period_start <= at && at < self.billing_period_end
    }

    pub fn is_overdue(&self, now: OffsetDateTime) -> bool {
        self.status == InvoiceStatus::Open && self.due_date < now
    }

    pub fn days_overdue(&self, now: OffsetDateTime) -> i64 {
        if !self.is_overdue(now) {
            return 0;
        }
        (now - self.due_date).whole_days()
    }

    /// open → paid. Returns `false` (and changes nothing) from any other status,
    /// so re-applying a settlement never pays twice.
    pub fn mark_paid(&mut self, now: OffsetDateTime) -> bool {
        if self.status != InvoiceStatus::Open {
            return false;
        }
        self.status = InvoiceStatus::Paid;
        self.paid_date = Some(now);
        self.updated_at = now;
        true
    }

    /// draft/open → void
    pub fn void(&mut self, now: OffsetDateTime) -> Result<(), LifecycleError> {
        if !matches!(self.status, InvoiceStatus::Draft | InvoiceStatus::Open) {
            return Err(LifecycleError::transition("void", self.status));
        }
        self.status = InvoiceStatus::Void;
        self.updated_at = now;
        Ok(())
    }

    /// open → uncollectible
    pub fn mark_uncollectible(&mut self, now: OffsetDateTime) -> Result<(), LifecycleError> {
        if self.status != InvoiceStatus::Open {
            return Err(LifecycleError::transition("mark uncollectible", self.status));
        }
        self.status = InvoiceStatus::Uncollectible;
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceItem {
    pub id: InvoiceItemId,
    pub invoice_id: InvoiceId,
    pub description: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
}

impl InvoiceItem {
    pub fn new(
        invoice_id: InvoiceId,
        description: String,
        quantity: i32,
        unit_price: Decimal,
        total_override: Option<Decimal>,
    ) -> Result<Self, LifecycleError> {
        if quantity <= 0 {
            return Err(LifecycleError::invalid("quantity", "quantity must be positive"));
        }
        let unit_price = round_money(unit_price);
        let total_price =
            round_money(total_override.unwrap_or(unit_price * Decimal::from(quantity)));
        Ok(Self {
            id: InvoiceItemId::new(),
            invoice_id,
            description,
            quantity,
            unit_price,
            total_price,
        })
    }
}

/// One settlement attempt against an invoice
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: PaymentId,
    pub invoice_id: InvoiceId,
    pub tenant_id: TenantId,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method: PaymentMethod,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    pub external_payment_id: Option<String>,
    pub external_transaction_id: Option<String>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Payment {
    /// New `pending` attempt. The amount must be positive.
    pub fn pending(
        invoice: &Invoice,
        amount: Decimal,
        payment_method: PaymentMethod,
        external_payment_id: Option<String>,
        now: OffsetDateTime,
    ) -> Result<Self, LifecycleError> {
        let amount = round_money(amount);
        if amount <= Decimal::ZERO {
            return Err(LifecycleError::invalid("amount", "payment amount must be positive"));
        }
        Ok(Self {
            id: PaymentId::new(),
            invoice_id: invoice.id,
            tenant_id: invoice.tenant_id,
            amount,
            currency: invoice.currency.clone(),
            status: PaymentStatus::Pending,
            payment_method,
            processed_at: None,
            external_payment_id,
            external_transaction_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// pending → processing
    pub fn mark_processing(&mut self, now: OffsetDateTime) -> bool {
        if self.status != PaymentStatus::Pending {
            return false;
        }
        self.status = PaymentStatus::Processing;
        self.updated_at = now;
        true
    }

    /// Settle as succeeded. No-op on a terminal payment.
    pub fn mark_succeeded(&mut self, transaction_id: Option<String>, now: OffsetDateTime) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = PaymentStatus::Succeeded;
        self.processed_at = Some(now);
        if transaction_id.is_some() {
            self.external_transaction_id = transaction_id;
        }
        self.error_message = None;
        self.updated_at = now;
        true
    }

    /// Settle as failed with a reason. No-op on a terminal payment.
    pub fn mark_failed(&mut self, reason: impl Into<String>, now: OffsetDateTime) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = PaymentStatus::Failed;
        self.processed_at = Some(now);
        self.error_message = Some(reason.into());
        self.updated_at = now;
        true
    }
}

/// Per-tenant billing preferences
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingSettings {
    pub tenant_id: TenantId,
    pub tax_rate: Decimal,
    pub grace_period_days: i32,
    pub default_payment_method: PaymentMethod,
    pub send_invoice_emails: bool,
    pub send_payment_reminders: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Grace period applied when a tenant has no stored settings
pub const DEFAULT_GRACE_PERIOD_DAYS: i32 = 7;

impl BillingSettings {
    pub fn defaults_for(tenant_id: TenantId, now: OffsetDateTime) -> Self {
        Self {
            tenant_id,
            tax_rate: Decimal::ZERO,
            grace_period_days: DEFAULT_GRACE_PERIOD_DAYS,
            default_payment_method: PaymentMethod::Card,
            send_invoice_emails: true,
            send_payment_reminders: true,
            created_at: now,
            updated_at: now,
        }
    }
}
