//! Plan catalog
//!
//! Plans are created administratively and soft-disabled. Deleting a plan is
//! only possible while no subscription references it.

use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::PgPool;
use tenantry_shared::{round_money, slug_or_derive, utc_now, BillingCycle, Plan, PlanId};

use crate::error::{BillingError, BillingResult};

/// Input for a new plan
#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub name: String,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub price: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub max_users: i32,
    pub max_storage_gb: i32,
    pub max_api_calls: i64,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub is_popular: bool,
    #[serde(default)]
    pub sort_order: i32,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl NewPlan {
    pub fn validate(&self) -> BillingResult<()> {
        if self.name.trim().is_empty() {
            return Err(BillingError::validation("name", "name is required"));
        }
        if self.price.is_sign_negative() && !self.price.is_zero() {
            return Err(BillingError::validation("price", "price cannot be negative"));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::validation(
                "currency",
                "currency must be a 3-letter code",
            ));
        }
        if self.max_users < 0 || self.max_storage_gb < 0 || self.max_api_calls < 0 {
            return Err(BillingError::validation(
                "limits",
                "usage limits cannot be negative",
            ));
        }
        Ok(())
    }
}

/// Read-heavy plan catalog backed by the `plans` table
#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_plan(&self, input: NewPlan) -> BillingResult<Plan> {
        input.validate()?;

        let slug = slug_or_derive(input.slug.as_deref(), &input.name);
        let now = utc_now();

        let plan: Plan = sqlx::query_as(
            r#"
            INSERT INTO plans (
                id, name, slug, description, price, currency, billing_cycle,
                max_users, max_storage_gb, max_api_calls, features,
                is_active, is_popular, sort_order, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, true, $12, $13, $14, $14)
            RETURNING *
            "#,
        )
        .bind(PlanId::new())
        .bind(input.name.trim())
        .bind(&slug)
        .bind(&input.description)
        .bind(round_money(input.price))
        .bind(input.currency.to_uppercase())
        .bind(input.billing_cycle)
        .bind(input.max_users)
        .bind(input.max_storage_gb)
        .bind(input.max_api_calls)
        .bind(serde_json::json!(input.features))
        .bind(input.is_popular)
        .bind(input.sort_order)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            plan_id = %plan.id,
            slug = %plan.slug,
            price = %plan.price,
            billing_cycle = %plan.billing_cycle,
            "Created plan"
        );

        Ok(plan)
    }

    /// Active plans, cheapest first within the configured sort order
    pub async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let plans = sqlx::query_as(
            r#"
            SELECT * FROM plans
            WHERE is_active = true
            ORDER BY sort_order ASC, price ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    pub async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Plan> {
        sqlx::query_as("SELECT * FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {}", plan_id)))
    }

    pub async fn deactivate_plan(&self, plan_id: PlanId) -> BillingResult<Plan> {
        let plan: Plan = sqlx::query_as(
            r#"
            UPDATE plans SET is_active = false, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Plan {}", plan_id)))?;

        tracing::info!(plan_id = %plan_id, "Deactivated plan");
        Ok(plan)
    }

    /// Hard delete. Refused while any subscription references the plan.
    pub async fn delete_plan(&self, plan_id: PlanId) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(PlanId,)> =
            sqlx::query_as("SELECT id FROM plans WHERE id = $1 FOR UPDATE")
                .bind(plan_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(BillingError::NotFound(format!("Plan {}", plan_id)));
        }

        let (references,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE plan_id = $1")
                .bind(plan_id)
                .fetch_one(&mut *tx)
                .await?;
        if references > 0 {
            return Err(BillingError::Conflict(format!(
                "Plan {} is referenced by {} subscription(s); deactivate it instead",
                plan_id, references
            )));
        }

        // FK from subscriptions (ON DELETE RESTRICT) backs this up
        sqlx::query("DELETE FROM plans WHERE id = $1")
            .bind(plan_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(plan_id = %plan_id, "Deleted plan");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_plan() -> NewPlan {
        NewPlan {
            name: "Pro".into(),
            slug: None,
            description: None,
            price: Decimal::new(2900, 2),
            currency: "USD".into(),
            billing_cycle: BillingCycle::Monthly,
            max_users: 10,
            max_storage_gb: 50,
            max_api_calls: 100_000,
            features: vec!["sso".into()],
            is_popular: true,
            sort_order: 1,
        }
    }

    #[test]
    fn test_valid_plan() {
        assert!(new_plan().validate().is_ok());

        let free = NewPlan {
            price: Decimal::ZERO,
            ..new_plan()
        };
        assert!(free.validate().is_ok());
    }

    #[test]
    fn test_negative_price_rejected() {
        let plan = NewPlan {
            price: Decimal::new(-1, 2),
            ..new_plan()
        };
        match plan.validate() {
            Err(BillingError::Validation { field, .. }) => assert_eq!(field, "price"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_currency_and_limits_rejected() {
        let plan = NewPlan {
            currency: "US".into(),
            ..new_plan()
        };
        assert!(plan.validate().is_err());

        let plan = NewPlan {
            max_users: -1,
            ..new_plan()
        };
        assert!(plan.validate().is_err());

        let plan = NewPlan {
            name: "  ".into(),
            ..new_plan()
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_new_plan_deserializes_with_defaults() {
        let plan: NewPlan = serde_json::from_value(serde_json::json!({
            "name": "Starter",
            "price": "9.00",
            "billing_cycle": "monthly",
            "max_users": 3,
            "max_storage_gb": 5,
            "max_api_calls": 1000
        }))
        .unwrap();
        assert_eq!(plan.currency, "USD");
        assert!(plan.features.is_empty());
        assert_eq!(slug_or_derive(plan.slug.as_deref(), &plan.name), "starter");
    }
}
