//! Invoice generation and status transitions

use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;

use tenantry_shared::{
    compute_total, round_money, utc_now, Invoice, InvoiceId, InvoiceItem, InvoiceStatus,
    QueryScope, Subscription, SubscriptionId, SubscriptionStatus,
};

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::settings::tax_for;
use crate::subscriptions::{fetch_plan, lock_subscription};

/// `INV-YYYYMM-` followed by 10 random upper-case alphanumerics
pub fn generate_invoice_number(now: OffsetDateTime) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    format!("INV-{:04}{:02}-{}", now.year(), u8::from(now.month()), suffix)
}

/// An invoice together with its line items
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceWithItems {
    pub invoice: Invoice,
    pub items: Vec<InvoiceItem>,
}

/// Line of a manually composed invoice
#[derive(Debug, Clone, Deserialize)]
pub struct NewInvoiceItem {
    pub description: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_override: Option<Decimal>,
}

/// Manually composed invoice for the subscription's current period
#[derive(Debug, Clone, Deserialize)]
pub struct NewInvoice {
    pub subscription_id: SubscriptionId,
    pub items: Vec<NewInvoiceItem>,
    /// Defaults to subtotal × the tenant's tax rate
    pub tax_amount: Option<Decimal>,
    pub total_override: Option<Decimal>,
}

#[derive(Clone)]
pub struct InvoiceService {
    pool: PgPool,
    config: BillingConfig,
}

impl InvoiceService {
    pub fn new(pool: PgPool, config: BillingConfig) -> Self {
        Self { pool, config }
    }

    /// Invoice the subscription for the period starting now.
    ///
    /// The subscription row lock serializes concurrent calls for the same
    /// subscription; the second caller sees the first caller's invoice and
    /// gets a conflict.
    pub async fn generate_invoice(&self, subscription_id: SubscriptionId) -> BillingResult<InvoiceWithItems> {
        let mut tx = self.pool.begin().await?;

        let sub = lock_subscription(&mut tx, subscription_id).await?;
        ensure_billable(&sub)?;
        let plan = fetch_plan(&mut tx, sub.plan_id).await?;

        let now = utc_now();
        ensure_no_invoice_covering(&mut tx, subscription_id, now).await?;

        let (invoice, item) = Invoice::for_subscription(
            &sub,
            &plan,
            generate_invoice_number(now),
            self.config.invoice_due_in(),
            now,
        )?;

        insert_invoice(&mut tx, &invoice).await?;
        insert_item(&mut tx, &item).await?;
        tx.commit().await?;

        tracing::info!(
            invoice_id = %invoice.id,
            invoice_number = %invoice.invoice_number,
            subscription_id = %subscription_id,
            tenant_id = %invoice.tenant_id,
            total = %invoice.total_amount,
            currency = %invoice.currency,
            "Generated invoice"
        );

        Ok(InvoiceWithItems {
            invoice,
            items: vec![item],
        })
    }

    /// Open invoice built from explicit line items
    pub async fn create_invoice(&self, input: NewInvoice) -> BillingResult<InvoiceWithItems> {
        if input.items.is_empty() {
            return Err(BillingError::validation("items", "at least one line item is required"));
        }

        let mut tx = self.pool.begin().await?;
        let sub = lock_subscription(&mut tx, input.subscription_id).await?;
        ensure_billable(&sub)?;
        let plan = fetch_plan(&mut tx, sub.plan_id).await?;

        let now = utc_now();
        let invoice_id = InvoiceId::new();
        let items = input
            .items
            .into_iter()
            .map(|line| {
                InvoiceItem::new(
                    invoice_id,
                    line.description,
                    line.quantity,
                    line.unit_price,
                    line.total_override,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let subtotal = round_money(items.iter().map(|i| i.total_price).sum());
        let tax_amount = match input.tax_amount {
            Some(tax) => round_money(tax),
            None => tax_for(subtotal, tenant_tax_rate(&mut tx, &sub).await?),
        };
        let total_amount = compute_total(subtotal, tax_amount, input.total_override)?;

        let invoice = Invoice {
            id: invoice_id,
            tenant_id: sub.tenant_id,
            subscription_id: sub.id,
            invoice_number: generate_invoice_number(now),
            status: InvoiceStatus::Open,
            subtotal,
            tax_amount,
            total_amount,
            currency: plan.currency.clone(),
            issue_date: now,
            due_date: now + self.config.invoice_due_in(),
            paid_date: None,
            billing_period_start: sub.current_period_start,
            billing_period_end: sub.current_period_end,
            created_at: now,
            updated_at: now,
        };

        insert_invoice(&mut tx, &invoice).await?;
        for item in &items {
            insert_item(&mut tx, item).await?;
        }
        tx.commit().await?;

        tracing::info!(
            invoice_id = %invoice.id,
            invoice_number = %invoice.invoice_number,
            tenant_id = %invoice.tenant_id,
            items = items.len(),
            total = %invoice.total_amount,
            "Created invoice"
        );

        Ok(InvoiceWithItems { invoice, items })
    }

    pub async fn get(&self, id: InvoiceId) -> BillingResult<Invoice> {
        sqlx::query_as("SELECT * FROM invoices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {}", id)))
    }

    pub async fn items(&self, id: InvoiceId) -> BillingResult<Vec<InvoiceItem>> {
        let items = sqlx::query_as("SELECT * FROM invoice_items WHERE invoice_id = $1 ORDER BY description")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    /// Invoices visible under `scope`, newest first
    pub async fn list(&self, scope: QueryScope) -> BillingResult<Vec<Invoice>> {
        let Some(tenant_id) = scope.sql_tenant_param() else {
            return Ok(Vec::new());
        };

        let invoices = sqlx::query_as(
            r#"
            SELECT * FROM invoices
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY issue_date DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    /// draft/open → void
    pub async fn void_invoice(&self, id: InvoiceId) -> BillingResult<Invoice> {
        self.transition(id, "void", |invoice, now| invoice.void(now)).await
    }

    /// open → uncollectible
    pub async fn mark_uncollectible(&self, id: InvoiceId) -> BillingResult<Invoice> {
        self.transition(id, "mark uncollectible", |invoice, now| invoice.mark_uncollectible(now))
            .await
    }

    async fn transition<F>(&self, id: InvoiceId, action: &'static str, apply: F) -> BillingResult<Invoice>
    where
        F: FnOnce(&mut Invoice, OffsetDateTime) -> Result<(), tenantry_shared::LifecycleError> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut invoice = lock_invoice(&mut tx, id).await?;
        let from = invoice.status;
        apply(&mut invoice, utc_now())?;
        update_invoice_status(&mut tx, &invoice).await?;
        tx.commit().await?;

        tracing::info!(
            invoice_id = %id,
            tenant_id = %invoice.tenant_id,
            action,
            from = %from,
            to = %invoice.status,
            "Invoice transition"
        );
        Ok(invoice)
    }
}

fn ensure_billable(sub: &Subscription) -> BillingResult<()> {
    if matches!(
        sub.status,
        SubscriptionStatus::Cancelled | SubscriptionStatus::Inactive
    ) {
        return Err(BillingError::Conflict(format!(
            "Subscription {} is {} and cannot be invoiced",
            sub.id, sub.status
        )));
    }
    Ok(())
}

async fn ensure_no_invoice_covering(
    conn: &mut PgConnection,
    subscription_id: SubscriptionId,
    at: OffsetDateTime,
) -> BillingResult<()> {
    let existing: Option<(InvoiceId, String)> = sqlx::query_as(
        r#"
        SELECT id, invoice_number FROM invoices
        WHERE subscription_id = $1
          AND status IN ('open', 'paid')
          AND billing_period_start <= $2
          AND billing_period_end > $2
        LIMIT 1
        "#,
    )
    .bind(subscription_id)
    .bind(at)
    .fetch_optional(conn)
    .await?;

    match existing {
        Some((id, number)) => Err(BillingError::Conflict(format!(
            "Invoice {} ({}) already covers the current period",
            number, id
        ))),
        None => Ok(()),
    }
}

async fn tenant_tax_rate(conn: &mut PgConnection, sub: &Subscription) -> BillingResult<Decimal> {
    let rate: Option<(Decimal,)> =
        sqlx::query_as("SELECT tax_rate FROM billing_settings WHERE tenant_id = $1")
            .bind(sub.tenant_id)
            .fetch_optional(conn)
            .await?;
    Ok(rate.map(|(r,)| r).unwrap_or(Decimal::ZERO))
}

pub(crate) async fn lock_invoice(conn: &mut PgConnection, id: InvoiceId) -> BillingResult<Invoice> {
    sqlx::query_as("SELECT * FROM invoices WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Invoice {}", id)))
}

pub(crate) async fn update_invoice_status(conn: &mut PgConnection, invoice: &Invoice) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE invoices SET status = $2, paid_date = $3, updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(invoice.id)
    .bind(invoice.status)
    .bind(invoice.paid_date)
    .bind(invoice.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_invoice(conn: &mut PgConnection, invoice: &Invoice) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO invoices (
            id, tenant_id, subscription_id, invoice_number, status,
            subtotal, tax_amount, total_amount, currency,
            issue_date, due_date, paid_date, billing_period_start, billing_period_end,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(invoice.id)
    .bind(invoice.tenant_id)
    .bind(invoice.subscription_id)
    .bind(&invoice.invoice_number)
    .bind(invoice.status)
    .bind(invoice.subtotal)
    .bind(invoice.tax_amount)
    .bind(invoice.total_amount)
    .bind(&invoice.currency)
    .bind(invoice.issue_date)
    .bind(invoice.due_date)
    .bind(invoice.paid_date)
    .bind(invoice.billing_period_start)
    .bind(invoice.billing_period_end)
    .bind(invoice.created_at)
    .bind(invoice.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_item(conn: &mut PgConnection, item: &InvoiceItem) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO invoice_items (id, invoice_id, description, quantity, unit_price, total_price)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(item.id)
    .bind(item.invoice_id)
    .bind(&item.description)
    .bind(item.quantity)
    .bind(item.unit_price)
    .bind(item.total_price)
    .execute(conn)
    .await?;
    Ok(())
}
