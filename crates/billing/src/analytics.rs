//! Billing history and analytics
//!
//! Read-only rollups over invoices and payments. Both sets are read inside one
//! `REPEATABLE READ` transaction so totals never mix two points in time.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;

use tenantry_shared::{utc_now, Invoice, InvoiceId, Payment, PaymentStatus, QueryScope, TenantId};

use crate::error::BillingResult;

/// An invoice with every payment attempt made against it
#[derive(Debug, Clone, Serialize)]
pub struct BillingHistoryEntry {
    pub invoice: Invoice,
    pub payments: Vec<Payment>,
}

/// Aggregate billing figures
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingAnalytics {
    /// Sum of all invoice totals
    pub total_invoiced: Decimal,
    /// Sum of succeeded payment amounts
    pub total_paid: Decimal,
    /// `total_invoiced - total_paid`
    pub outstanding: Decimal,
    pub invoice_count: usize,
    pub invoices_by_status: BTreeMap<String, usize>,
    pub overdue_count: usize,
    pub overdue_amount: Decimal,
    pub succeeded_payments: usize,
    pub failed_payments: usize,
}

impl BillingAnalytics {
    pub fn compute(invoices: &[Invoice], payments: &[Payment], now: OffsetDateTime) -> Self {
        let mut invoices_by_status = BTreeMap::new();
        let mut total_invoiced = Decimal::ZERO;
        let mut overdue_count = 0;
        let mut overdue_amount = Decimal::ZERO;

        for invoice in invoices {
            total_invoiced += invoice.total_amount;
            *invoices_by_status
                .entry(invoice.status.as_str().to_string())
                .or_insert(0) += 1;
            if invoice.is_overdue(now) {
                overdue_count += 1;
                overdue_amount += invoice.total_amount;
            }
        }

        let mut total_paid = Decimal::ZERO;
        let mut succeeded_payments = 0;
        let mut failed_payments = 0;
        for payment in payments {
            match payment.status {
                PaymentStatus::Succeeded => {
                    total_paid += payment.amount;
                    succeeded_payments += 1;
                }
                PaymentStatus::Failed => failed_payments += 1,
                _ => {}
            }
        }

        Self {
            total_invoiced,
            total_paid,
            outstanding: total_invoiced - total_paid,
            invoice_count: invoices.len(),
            invoices_by_status,
            overdue_count,
            overdue_amount,
            succeeded_payments,
            failed_payments,
        }
    }
}

/// Group payments under their invoices, newest invoice first
pub fn assemble_history(mut invoices: Vec<Invoice>, payments: Vec<Payment>) -> Vec<BillingHistoryEntry> {
    let mut by_invoice: HashMap<InvoiceId, Vec<Payment>> = HashMap::new();
    for payment in payments {
        by_invoice.entry(payment.invoice_id).or_default().push(payment);
    }

    invoices.sort_by(|a, b| b.issue_date.cmp(&a.issue_date));
    invoices
        .into_iter()
        .map(|invoice| {
            let mut payments = by_invoice.remove(&invoice.id).unwrap_or_default();
            payments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            BillingHistoryEntry { invoice, payments }
        })
        .collect()
}

/// Service for billing history and analytics
#[derive(Clone)]
pub struct BillingReports {
    pool: PgPool,
}

impl BillingReports {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Invoices visible under `scope` with their payments, newest first
    pub async fn billing_history(&self, scope: QueryScope) -> BillingResult<Vec<BillingHistoryEntry>> {
        let Some(tenant_id) = scope.sql_tenant_param() else {
            return Ok(Vec::new());
        };
        let (invoices, payments) = self.snapshot(tenant_id).await?;
        Ok(assemble_history(invoices, payments))
    }

    /// Aggregates over the rows visible under `scope`
    pub async fn billing_analytics(&self, scope: QueryScope) -> BillingResult<BillingAnalytics> {
        let now = utc_now();
        let Some(tenant_id) = scope.sql_tenant_param() else {
            return Ok(BillingAnalytics::compute(&[], &[], now));
        };
        let (invoices, payments) = self.snapshot(tenant_id).await?;
        let analytics = BillingAnalytics::compute(&invoices, &payments, now);

        tracing::debug!(
            tenant_id = ?tenant_id,
            invoices = analytics.invoice_count,
            outstanding = %analytics.outstanding,
            "Computed billing analytics"
        );
        Ok(analytics)
    }

    /// Billing history as CSV, one row per invoice
    pub async fn export_history_csv(&self, scope: QueryScope) -> BillingResult<String> {
        let history = self.billing_history(scope).await?;
        Ok(history_to_csv(&history))
    }

    async fn snapshot(&self, tenant_id: Option<TenantId>) -> BillingResult<(Vec<Invoice>, Vec<Payment>)> {
        let mut tx = self.pool.begin().await?;
        set_snapshot_isolation(&mut tx).await?;

        let invoices: Vec<Invoice> = sqlx::query_as(
            r#"
            SELECT * FROM invoices
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY issue_date DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&mut *tx)
        .await?;

        let payments: Vec<Payment> = sqlx::query_as(
            r#"
            SELECT * FROM payments
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((invoices, payments))
    }
}

async fn set_snapshot_isolation(tx: &mut Transaction<'_, Postgres>) -> BillingResult<()> {
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Render history entries as CSV
pub fn history_to_csv(history: &[BillingHistoryEntry]) -> String {
    let mut csv = String::new();
    csv.push_str("Invoice Number,Issue Date,Due Date,Status,Total,Currency,Paid,Payments\n");

    for entry in history {
        let invoice = &entry.invoice;
        let paid: Decimal = entry
            .payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Succeeded)
            .map(|p| p.amount)
            .sum();
        let issue_date = invoice
            .issue_date
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());
        let due_date = invoice
            .due_date
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());

        csv.push_str(&format!(
            "{},{},{},{},{:.2},{},{:.2},{}\n",
            escape_csv_field(&invoice.invoice_number),
            issue_date,
            due_date,
            invoice.status,
            invoice.total_amount,
            escape_csv_field(&invoice.currency),
            paid,
            entry.payments.len()
        ));
    }

    csv
}

/// Escape a field for CSV output
fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tenantry_shared::{InvoiceStatus, PaymentMethod, SubscriptionId};
    use time::Duration;

    fn invoice(total: i64, status: InvoiceStatus, issued: OffsetDateTime) -> Invoice {
        Invoice {
            id: InvoiceId::new(),
            tenant_id: TenantId::new(),
            subscription_id: SubscriptionId::new(),
            invoice_number: format!("INV-202601-{:010}", total),
            status,
            subtotal: Decimal::new(total, 2),
            tax_amount: Decimal::ZERO,
            total_amount: Decimal::new(total, 2),
            currency: "USD".into(),
            issue_date: issued,
            due_date: issued + Duration::days(30),
            paid_date: None,
            billing_period_start: issued,
            billing_period_end: issued + Duration::days(30),
            created_at: issued,
            updated_at: issued,
        }
    }

    fn payment(invoice: &Invoice, status: PaymentStatus) -> Payment {
        let mut p = Payment::pending(
            invoice,
            invoice.total_amount,
            PaymentMethod::Card,
            None,
            invoice.issue_date,
        )
        .unwrap();
        p.status = status;
        p
    }

    #[test]
    fn test_analytics_rollup() {
        let now = OffsetDateTime::now_utc();
        let paid = invoice(2900, InvoiceStatus::Paid, now - Duration::days(40));
        let overdue = invoice(9900, InvoiceStatus::Open, now - Duration::days(35));
        let current = invoice(2900, InvoiceStatus::Open, now);

        let payments = vec![
            payment(&paid, PaymentStatus::Failed),
            payment(&paid, PaymentStatus::Succeeded),
            payment(&overdue, PaymentStatus::Failed),
        ];
        let invoices = vec![paid, overdue, current];

        let a = BillingAnalytics::compute(&invoices, &payments, now);
        assert_eq!(a.total_invoiced, Decimal::new(15700, 2));
        assert_eq!(a.total_paid, Decimal::new(2900, 2));
        assert_eq!(a.outstanding, Decimal::new(12800, 2));
        assert_eq!(a.invoice_count, 3);
        assert_eq!(a.invoices_by_status.get("open"), Some(&2));
        assert_eq!(a.invoices_by_status.get("paid"), Some(&1));
        assert_eq!(a.overdue_count, 1);
        assert_eq!(a.overdue_amount, Decimal::new(9900, 2));
        assert_eq!(a.succeeded_payments, 1);
        assert_eq!(a.failed_payments, 2);
    }

    #[test]
    fn test_empty_analytics() {
        let a = BillingAnalytics::compute(&[], &[], OffsetDateTime::now_utc());
        assert_eq!(a.total_invoiced, Decimal::ZERO);
        assert_eq!(a.outstanding, Decimal::ZERO);
        assert!(a.invoices_by_status.is_empty());
    }

    #[test]
    fn test_history_groups_payments_newest_invoice_first() {
        let now = OffsetDateTime::now_utc();
        let older = invoice(1000, InvoiceStatus::Paid, now - Duration::days(30));
        let newer = invoice(2000, InvoiceStatus::Open, now);
        let payments = vec![
            payment(&older, PaymentStatus::Succeeded),
            payment(&newer, PaymentStatus::Failed),
            payment(&older, PaymentStatus::Failed),
        ];
        let (older_id, newer_id) = (older.id, newer.id);

        let history = assemble_history(vec![older, newer], payments);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].invoice.id, newer_id);
        assert_eq!(history[0].payments.len(), 1);
        assert_eq!(history[1].invoice.id, older_id);
        assert_eq!(history[1].payments.len(), 2);
    }

    #[test]
    fn test_csv_export() {
        let now = OffsetDateTime::now_utc();
        let inv = invoice(2900, InvoiceStatus::Paid, now);
        let history = vec![BillingHistoryEntry {
            payments: vec![payment(&inv, PaymentStatus::Succeeded)],
            invoice: inv,
        }];

        let csv = history_to_csv(&history);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Invoice Number,"));
        assert!(lines[1].contains(",paid,29.00,USD,29.00,1"));
    }

    #[test]
    fn test_escape_csv_field() {
        assert_eq!(escape_csv_field("plain"), "plain");
        assert_eq!(escape_csv_field("a,b"), "\"a,b\"");
        assert_eq!(escape_csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
