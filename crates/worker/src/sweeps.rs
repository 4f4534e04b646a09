//! Scheduled maintenance sweeps
//!
//! Each sweep is a single idempotent database pass. A failing run is logged
//! and retried on the next tick.

use time::OffsetDateTime;
use tracing::{error, info};

use tenantry_api::InvitationService;
use tenantry_billing::{StalePayments, SubscriptionService};
use tenantry_shared::utc_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    /// Cancel subscriptions flagged `cancel_at_period_end` once the period is over
    PeriodEndCancellations,
    /// Move active subscriptions with overdue open invoices to `past_due`
    PastDue,
    /// Expire pending invitations
    InvitationExpiry,
    /// Fail payment attempts that never got a gateway result
    StalePayments,
}

impl Sweep {
    pub const ALL: [Sweep; 4] = [
        Sweep::PeriodEndCancellations,
        Sweep::PastDue,
        Sweep::InvitationExpiry,
        Sweep::StalePayments,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Sweep::PeriodEndCancellations => "period_end_cancellations",
            Sweep::PastDue => "past_due",
            Sweep::InvitationExpiry => "invitation_expiry",
            Sweep::StalePayments => "stale_payments",
        }
    }

    /// Cron expression (with seconds)
    pub fn schedule(self) -> &'static str {
        match self {
            Sweep::PeriodEndCancellations => "0 */15 * * * *",
            Sweep::PastDue => "0 5 * * * *",
            Sweep::InvitationExpiry => "0 10 * * * *",
            Sweep::StalePayments => "30 */5 * * * *",
        }
    }
}

#[derive(Clone)]
pub struct Sweeper {
    subscriptions: SubscriptionService,
    invitations: InvitationService,
    payments: StalePayments,
}

impl Sweeper {
    pub fn new(
        subscriptions: SubscriptionService,
        invitations: InvitationService,
        payments: StalePayments,
    ) -> Self {
        Self {
            subscriptions,
            invitations,
            payments,
        }
    }

    /// Run one sweep as of `now`, returning how many rows changed
    pub async fn run(&self, sweep: Sweep, now: OffsetDateTime) -> anyhow::Result<u64> {
        let changed = match sweep {
            Sweep::PeriodEndCancellations => {
                self.subscriptions.finalize_period_end_cancellations(now).await?
            }
            Sweep::PastDue => self.subscriptions.flag_past_due(now).await?,
            Sweep::InvitationExpiry => self.invitations.expire_invitations(now).await?,
            Sweep::StalePayments => self.payments.fail_stale(now).await?,
        };
        Ok(changed)
    }

    pub async fn run_logged(&self, sweep: Sweep) {
        match self.run(sweep, utc_now()).await {
            Ok(0) => {}
            Ok(changed) => info!(sweep = sweep.name(), changed, "Sweep completed"),
            Err(e) => error!(sweep = sweep.name(), error = %e, "Sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_names_are_unique() {
        let mut names: Vec<_> = Sweep::ALL.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Sweep::ALL.len());
    }

    #[test]
    fn test_schedules_carry_a_seconds_field() {
        for sweep in Sweep::ALL {
            assert_eq!(sweep.schedule().split_whitespace().count(), 6, "{}", sweep.name());
        }
    }
}
