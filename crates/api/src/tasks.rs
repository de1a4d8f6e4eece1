//! Background maintenance

use time::Duration as TimeDuration;
use tokio::time::{interval, Duration};
use wizpix_billing::BillingService;

const TICK: Duration = Duration::from_secs(5 * 60);

/// Invariant checks run once every this many ticks
const INVARIANT_EVERY: u64 = 12;

/// Expire stale checkouts every tick and run invariant checks hourly
pub async fn maintenance_task(billing: BillingService, stale_after: TimeDuration) {
    let mut interval = interval(TICK);
    let mut ticks: u64 = 0;

    loop {
        interval.tick().await;
        expire_stale_checkouts(&billing, stale_after).await;

        if ticks % INVARIANT_EVERY == 0 {
            check_invariants(&billing).await;
        }
        ticks = ticks.wrapping_add(1);
    }
}

pub async fn expire_stale_checkouts(billing: &BillingService, stale_after: TimeDuration) -> u64 {
    match billing.sessions.expire_stale(stale_after).await {
        Ok(expired) => expired,
        Err(e) => {
            tracing::error!(error = %e, "Failed to expire stale checkout sessions");
            0
        }
    }
}

pub async fn check_invariants(billing: &BillingService) -> bool {
    match billing.invariants.run_all_checks().await {
        Ok(summary) => {
            for violation in &summary.violations {
                tracing::error!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    user_ids = ?violation.user_ids,
                    context = %violation.context,
                    "{}",
                    violation.description
                );
            }
            summary.healthy
        }
        Err(e) => {
            tracing::error!(error = %e, "Invariant checks could not run");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use wizpix_shared::models::CheckoutStatus;

    #[tokio::test]
    async fn test_expire_stale_checkouts() {
        let harness = test_support::harness().await;
        let billing = &harness.state.billing;
        billing
            .sessions
            .get_or_create("cs_old", "old@example.com", "hobby", wizpix_billing::Currency::Chf)
            .await
            .unwrap();
        billing
            .sessions
            .get_or_create("cs_new", "new@example.com", "hobby", wizpix_billing::Currency::Chf)
            .await
            .unwrap();
        harness.store.age_checkout("cs_old", TimeDuration::hours(25)).await;

        let expired = expire_stale_checkouts(billing, TimeDuration::hours(24)).await;
        assert_eq!(expired, 1);

        let old = billing.sessions.get("cs_old").await.unwrap().unwrap();
        assert_eq!(old.status, CheckoutStatus::Failed);
        assert_eq!(old.last_error.as_deref(), Some("expired"));
        let new = billing.sessions.get("cs_new").await.unwrap().unwrap();
        assert_eq!(new.status, CheckoutStatus::Pending);
    }

    #[tokio::test]
    async fn test_invariants_on_clean_state() {
        let harness = test_support::harness().await;
        assert!(check_invariants(&harness.state.billing).await);
    }
}
