//! Per-tenant billing settings

use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::PgPool;
use time::OffsetDateTime;

use tenantry_shared::{round_money, utc_now, BillingSettings, PaymentMethod, TenantId};

use crate::error::{BillingError, BillingResult};

/// Partial update; absent fields keep their stored (or default) value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BillingSettingsUpdate {
    pub tax_rate: Option<Decimal>,
    pub grace_period_days: Option<i32>,
    pub default_payment_method: Option<PaymentMethod>,
    pub send_invoice_emails: Option<bool>,
    pub send_payment_reminders: Option<bool>,
}

impl BillingSettingsUpdate {
    /// Merge onto `current`, validating the result
    pub fn apply(self, mut current: BillingSettings, now: OffsetDateTime) -> BillingResult<BillingSettings> {
        if let Some(rate) = self.tax_rate {
            if rate < Decimal::ZERO || rate >= Decimal::ONE {
                return Err(BillingError::validation(
                    "tax_rate",
                    "tax rate is a fraction between 0 and 1",
                ));
            }
            current.tax_rate = rate.round_dp(4);
        }
        if let Some(days) = self.grace_period_days {
            if days < 0 {
                return Err(BillingError::validation(
                    "grace_period_days",
                    "grace period cannot be negative",
                ));
            }
            current.grace_period_days = days;
        }
        if let Some(method) = self.default_payment_method {
            current.default_payment_method = method;
        }
        if let Some(flag) = self.send_invoice_emails {
            current.send_invoice_emails = flag;
        }
        if let Some(flag) = self.send_payment_reminders {
            current.send_payment_reminders = flag;
        }
        current.updated_at = now;
        Ok(current)
    }
}

#[derive(Clone)]
pub struct BillingSettingsService {
    pool: PgPool,
}

impl BillingSettingsService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Stored settings, or the defaults when the tenant never saved any
    pub async fn get(&self, tenant_id: TenantId) -> BillingResult<BillingSettings> {
        let stored: Option<BillingSettings> =
            sqlx::query_as("SELECT * FROM billing_settings WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(stored.unwrap_or_else(|| BillingSettings::defaults_for(tenant_id, utc_now())))
    }

    pub async fn update(
        &self,
        tenant_id: TenantId,
        update: BillingSettingsUpdate,
    ) -> BillingResult<BillingSettings> {
        let now = utc_now();
        let settings = update.apply(self.get(tenant_id).await?, now)?;

        let saved: BillingSettings = sqlx::query_as(
            r#"
            INSERT INTO billing_settings (
                tenant_id, tax_rate, grace_period_days, default_payment_method,
                send_invoice_emails, send_payment_reminders, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id) DO UPDATE SET
                tax_rate = EXCLUDED.tax_rate,
                grace_period_days = EXCLUDED.grace_period_days,
                default_payment_method = EXCLUDED.default_payment_method,
                send_invoice_emails = EXCLUDED.send_invoice_emails,
                send_payment_reminders = EXCLUDED.send_payment_reminders,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(settings.tax_rate)
        .bind(settings.grace_period_days)
        .bind(settings.default_payment_method)
        .bind(settings.send_invoice_emails)
        .bind(settings.send_payment_reminders)
        .bind(settings.created_at)
        .bind(settings.updated_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            tax_rate = %saved.tax_rate,
            grace_period_days = saved.grace_period_days,
            "Updated billing settings"
        );
        Ok(saved)
    }
}

/// Tax for a subtotal at the given rate, rounded to cents
pub fn tax_for(subtotal: Decimal, rate: Decimal) -> Decimal {
    round_money(subtotal * rate)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tenantry_shared::DEFAULT_GRACE_PERIOD_DAYS;

    fn defaults() -> BillingSettings {
        BillingSettings::defaults_for(TenantId::new(), OffsetDateTime::now_utc())
    }

    #[test]
    fn test_defaults() {
        let settings = defaults();
        assert_eq!(settings.tax_rate, Decimal::ZERO);
        assert_eq!(settings.grace_period_days, DEFAULT_GRACE_PERIOD_DAYS);
        assert_eq!(settings.default_payment_method, PaymentMethod::Card);
    }

    #[test]
    fn test_partial_update_keeps_other_fields() {
        let update = BillingSettingsUpdate {
            grace_period_days: Some(14),
            ..Default::default()
        };
        let settings = update.apply(defaults(), OffsetDateTime::now_utc()).unwrap();
        assert_eq!(settings.grace_period_days, 14);
        assert_eq!(settings.tax_rate, Decimal::ZERO);
        assert!(settings.send_invoice_emails);
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        for rate in [Decimal::new(-1, 2), Decimal::ONE] {
            let update = BillingSettingsUpdate {
                tax_rate: Some(rate),
                ..Default::default()
            };
            assert!(update.apply(defaults(), OffsetDateTime::now_utc()).is_err(), "{rate}");
        }

        let update = BillingSettingsUpdate {
            grace_period_days: Some(-1),
            ..Default::default()
        };
        assert!(update.apply(defaults(), OffsetDateTime::now_utc()).is_err());
    }

    #[test]
    fn test_tax_for_rounds_to_cents() {
        assert_eq!(tax_for(Decimal::new(2900, 2), Decimal::new(825, 4)), Decimal::new(239, 2));
    }
}
