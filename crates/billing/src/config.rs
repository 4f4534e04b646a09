//! Billing engine configuration

use std::time::Duration;

/// Days until a generated invoice is due, independent of the billing cycle
pub const DEFAULT_INVOICE_DUE_DAYS: i64 = 30;

/// Upper bound on a single payment-gateway call
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(15);

/// Added to the gateway timeout before an unsettled attempt counts as stale
pub const STALE_PAYMENT_MARGIN: time::Duration = time::Duration::minutes(5);

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub invoice_due_days: i64,
    pub gateway_timeout: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            invoice_due_days: DEFAULT_INVOICE_DUE_DAYS,
            gateway_timeout: DEFAULT_GATEWAY_TIMEOUT,
        }
    }
}

impl BillingConfig {
    /// Load from `INVOICE_DUE_DAYS` and `PAYMENT_GATEWAY_TIMEOUT_MS`, falling
    /// back to defaults for missing or unparsable values
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            invoice_due_days: std::env::var("INVOICE_DUE_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|days: &i64| *days > 0)
                .unwrap_or(defaults.invoice_due_days),
            gateway_timeout: std::env::var("PAYMENT_GATEWAY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.gateway_timeout),
        }
    }

    pub fn invoice_due_in(&self) -> time::Duration {
        time::Duration::days(self.invoice_due_days)
    }

    /// Age after which a `pending` or `processing` payment is failed
    pub fn stale_payment_after(&self) -> time::Duration {
        time::Duration::try_from(self.gateway_timeout).unwrap_or(time::Duration::ZERO)
            + STALE_PAYMENT_MARGIN
    }
}
