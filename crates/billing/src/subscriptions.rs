//! Subscription lifecycle management
//!
//! Every persisting transition locks the subscription row, applies the
//! in-memory transition from `tenantry_shared::Subscription` and writes the
//! row back in the same transaction. Any error drops the transaction.

use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;

use tenantry_shared::{
    utc_now, Plan, PlanChange, PlanId, QueryScope, Subscription, SubscriptionId, TenantId,
    UserId, DEFAULT_GRACE_PERIOD_DAYS,
};

use crate::error::{BillingError, BillingResult};

/// Plan swap request
#[derive(Debug, Clone)]
pub struct PlanChangeRequest {
    pub new_plan_id: PlanId,
    pub changed_by: Option<UserId>,
    /// Defaults to now
    pub effective_date: Option<OffsetDateTime>,
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Subscribe a tenant to a plan, in `trial` when a trial length is given,
    /// otherwise `inactive`.
    pub async fn create(
        &self,
        tenant_id: TenantId,
        plan_id: PlanId,
        trial_days: Option<i64>,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let tenant: Option<(bool,)> =
            sqlx::query_as("SELECT is_active FROM tenants WHERE id = $1 FOR SHARE")
                .bind(tenant_id)
                .fetch_optional(&mut *tx)
                .await?;
        match tenant {
            None => return Err(BillingError::NotFound(format!("Tenant {}", tenant_id))),
            Some((false,)) => {
                return Err(BillingError::validation("tenant_id", "tenant is deactivated"))
            }
            Some((true,)) => {}
        }

        let plan = fetch_plan(&mut tx, plan_id).await?;
        if !plan.is_active {
            return Err(BillingError::validation("plan_id", "plan is not active"));
        }

        let live: Option<(SubscriptionId,)> = sqlx::query_as(
            r#"
            SELECT id FROM subscriptions
            WHERE tenant_id = $1 AND status IN ('active', 'trial')
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((existing,)) = live {
            return Err(BillingError::Conflict(format!(
                "Tenant {} already has an active subscription {}",
                tenant_id, existing
            )));
        }

        let sub = Subscription::new(tenant_id, &plan, trial_days, utc_now())?;

        // Partial unique index on (tenant_id) for active/trial rows backs the check above
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, tenant_id, plan_id, status, current_period_start, current_period_end,
                trial_start, trial_end, cancelled_at, cancel_at_period_end,
                current_usage, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(sub.id)
        .bind(sub.tenant_id)
        .bind(sub.plan_id)
        .bind(sub.status)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.trial_start)
        .bind(sub.trial_end)
        .bind(sub.cancelled_at)
        .bind(sub.cancel_at_period_end)
        .bind(&sub.current_usage)
        .bind(&sub.metadata)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %sub.id,
            tenant_id = %tenant_id,
            plan_id = %plan_id,
            status = %sub.status,
            "Created subscription"
        );

        Ok(sub)
    }

    pub async fn get(&self, id: SubscriptionId) -> BillingResult<Subscription> {
        sqlx::query_as("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", id)))
    }

    /// The tenant's subscription in `active` or `trial`, if any
    pub async fn current_for_tenant(&self, tenant_id: TenantId) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE tenant_id = $1 AND status IN ('active', 'trial')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    /// Subscriptions visible under `scope`, newest first
    pub async fn list(&self, scope: QueryScope) -> BillingResult<Vec<Subscription>> {
        let Some(tenant_id) = scope.sql_tenant_param() else {
            return Ok(Vec::new());
        };

        let subs = sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    /// inactive/trial → active with a fresh period from the plan's cycle
    pub async fn activate(&self, id: SubscriptionId) -> BillingResult<Subscription> {
        self.transition(id, "activate", |sub, plan, now| {
            sub.activate(plan, now)?;
            Ok(true)
        })
        .await
    }

    /// Cancel immediately, or flag for cancellation when the period ends.
    /// Cancelling an already cancelled subscription is a no-op.
    pub async fn cancel(&self, id: SubscriptionId, at_period_end: bool) -> BillingResult<Subscription> {
        self.transition(id, "cancel", |sub, _, now| Ok(sub.cancel(at_period_end, now)?))
            .await
    }

    /// cancelled → active; any other status is a conflict
    pub async fn reactivate(&self, id: SubscriptionId) -> BillingResult<Subscription> {
        self.transition(id, "reactivate", |sub, _, now| {
            sub.reactivate(now)?;
            Ok(true)
        })
        .await
    }

    /// Swap the plan and append the audit record in one transaction
    pub async fn change_plan(
        &self,
        id: SubscriptionId,
        request: PlanChangeRequest,
    ) -> BillingResult<(Subscription, PlanChange)> {
        let mut tx = self.pool.begin().await?;
        let mut sub = lock_subscription(&mut tx, id).await?;

        let new_plan = match fetch_plan(&mut tx, request.new_plan_id).await {
            Ok(plan) => plan,
            Err(BillingError::NotFound(_)) => {
                return Err(BillingError::validation("plan_id", "plan does not exist"));
            }
            Err(e) => return Err(e),
        };

        let now = utc_now();
        let change = sub.change_plan(
            &new_plan,
            request.changed_by,
            request.effective_date.unwrap_or(now),
            request.reason,
            now,
        )?;

        sqlx::query(
            r#"
            INSERT INTO plan_changes (
                id, subscription_id, old_plan_id, new_plan_id, changed_by,
                effective_date, reason, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(change.id)
        .bind(change.subscription_id)
        .bind(change.old_plan_id)
        .bind(change.new_plan_id)
        .bind(change.changed_by)
        .bind(change.effective_date)
        .bind(&change.reason)
        .bind(change.created_at)
        .execute(&mut *tx)
        .await?;

        save_subscription(&mut tx, &sub).await?;
        tx.commit().await?;

        tracing::info!(
            subscription_id = %id,
            tenant_id = %sub.tenant_id,
            old_plan_id = ?change.old_plan_id,
            new_plan_id = %change.new_plan_id,
            "Changed subscription plan"
        );

        Ok((sub, change))
    }

    /// Plan change audit log, oldest first
    pub async fn plan_changes(&self, id: SubscriptionId) -> BillingResult<Vec<PlanChange>> {
        let changes = sqlx::query_as(
            r#"
            SELECT * FROM plan_changes
            WHERE subscription_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(changes)
    }

    /// Add `delta` to a usage counter; returns the new value
    pub async fn record_usage(&self, id: SubscriptionId, counter: &str, delta: i64) -> BillingResult<i64> {
        let mut tx = self.pool.begin().await?;
        let mut sub = lock_subscription(&mut tx, id).await?;
        let value = sub.record_usage(counter, delta)?;

        sqlx::query("UPDATE subscriptions SET current_usage = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(&sub.current_usage)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!(subscription_id = %id, counter = %counter, delta, value, "Recorded usage");
        Ok(value)
    }

    /// Sweep: subscriptions flagged `cancel_at_period_end` whose period has
    /// elapsed become `cancelled` as of their period end.
    pub async fn finalize_period_end_cancellations(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let mut tx = self.pool.begin().await?;

        let due: Vec<Subscription> = sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE cancel_at_period_end = true
              AND status <> 'cancelled'
              AND current_period_end <= $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut finalized = 0u64;
        for mut sub in due {
            if sub.finalize_period_end(now) {
                save_subscription(&mut tx, &sub).await?;
                finalized += 1;
                tracing::info!(
                    subscription_id = %sub.id,
                    tenant_id = %sub.tenant_id,
                    "Subscription cancelled at period end"
                );
            }
        }

        tx.commit().await?;
        Ok(finalized)
    }

    /// Sweep: active subscriptions with an open invoice overdue beyond the
    /// tenant's grace period become `past_due`.
    pub async fn flag_past_due(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let mut tx = self.pool.begin().await?;

        let overdue: Vec<Subscription> = sqlx::query_as(
            r#"
            SELECT s.* FROM subscriptions s
            WHERE s.status = 'active'
              AND EXISTS (
                  SELECT 1 FROM invoices i
                  LEFT JOIN billing_settings bs ON bs.tenant_id = i.tenant_id
                  WHERE i.subscription_id = s.id
                    AND i.status = 'open'
                    AND i.due_date + make_interval(days => COALESCE(bs.grace_period_days, $2)) < $1
              )
            FOR UPDATE OF s SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(DEFAULT_GRACE_PERIOD_DAYS)
        .fetch_all(&mut *tx)
        .await?;

        let mut flagged = 0u64;
        for mut sub in overdue {
            sub.mark_past_due(now)?;
            save_subscription(&mut tx, &sub).await?;
            flagged += 1;
            tracing::warn!(
                subscription_id = %sub.id,
                tenant_id = %sub.tenant_id,
                "Subscription past due"
            );
        }

        tx.commit().await?;
        Ok(flagged)
    }

    /// Lock, apply, persist. `apply` returns `false` when nothing changed, in
    /// which case nothing is written.
    async fn transition<F>(
        &self,
        id: SubscriptionId,
        action: &'static str,
        apply: F,
    ) -> BillingResult<Subscription>
    where
        F: FnOnce(&mut Subscription, &Plan, OffsetDateTime) -> BillingResult<bool> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut sub = lock_subscription(&mut tx, id).await?;
        let plan = fetch_plan(&mut tx, sub.plan_id).await?;

        let from = sub.status;
        let changed = apply(&mut sub, &plan, utc_now())?;
        if !changed {
            tx.rollback().await?;
            tracing::info!(
                subscription_id = %id,
                action,
                status = %from,
                "Subscription transition was a no-op"
            );
            return Ok(sub);
        }

        save_subscription(&mut tx, &sub).await?;
        tx.commit().await?;

        tracing::info!(
            subscription_id = %id,
            tenant_id = %sub.tenant_id,
            action,
            from = %from,
            to = %sub.status,
            cancel_at_period_end = sub.cancel_at_period_end,
            "Subscription transition"
        );

        Ok(sub)
    }
}

pub(crate) async fn lock_subscription(
    conn: &mut PgConnection,
    id: SubscriptionId,
) -> BillingResult<Subscription> {
    sqlx::query_as("SELECT * FROM subscriptions WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", id)))
}

pub(crate) async fn fetch_plan(conn: &mut PgConnection, plan_id: PlanId) -> BillingResult<Plan> {
    sqlx::query_as("SELECT * FROM plans WHERE id = $1")
        .bind(plan_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Plan {}", plan_id)))
}

async fn save_subscription(conn: &mut PgConnection, sub: &Subscription) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE subscriptions SET
            plan_id = $2,
            status = $3,
            current_period_start = $4,
            current_period_end = $5,
            trial_start = $6,
            trial_end = $7,
            cancelled_at = $8,
            cancel_at_period_end = $9,
            current_usage = $10,
            metadata = $11,
            updated_at = $12
        WHERE id = $1
        "#,
    )
    .bind(sub.id)
    .bind(sub.plan_id)
    .bind(sub.status)
    .bind(sub.current_period_start)
    .bind(sub.current_period_end)
    .bind(sub.trial_start)
    .bind(sub.trial_end)
    .bind(sub.cancelled_at)
    .bind(sub.cancel_at_period_end)
    .bind(&sub.current_usage)
    .bind(&sub.metadata)
    .bind(sub.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

