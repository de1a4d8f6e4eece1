//! Credit ledger and rolling 24h quota
//!
//! Consumption is an append-only ledger; remaining credits are always an
//! aggregate computed at read time over the trailing 24 hours.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use wizpix_shared::models::{CreditUsage, GuardedAppend, NewCreditUsage};
use wizpix_shared::Store;

use crate::error::{BillingError, BillingResult};

/// Length of the rolling consumption window
pub const USAGE_WINDOW: Duration = Duration::hours(24);

/// How the check-then-append sequence is protected against concurrent consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuotaEnforcement {
    /// Check and append run serialized per subscription; the quota is a hard cap
    #[default]
    Strict,
    /// Check then append independently; concurrent callers may overshoot slightly
    BestEffort,
}

impl FromStr for QuotaEnforcement {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "best_effort" | "best-effort" => Ok(Self::BestEffort),
            other => Err(BillingError::Config(format!(
                "unknown quota enforcement mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageWindow {
    pub subscription_id: Uuid,
    pub daily_quota: i64,
    pub used_last_24h: i64,
    pub remaining_last_24h: i64,
}

impl UsageWindow {
    fn new(subscription_id: Uuid, daily_quota: i64, used_last_24h: i64) -> Self {
        Self {
            subscription_id,
            daily_quota,
            used_last_24h,
            remaining_last_24h: (daily_quota - used_last_24h).max(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed(UsageWindow),
    NoActiveSubscription,
    QuotaExhausted(UsageWindow),
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn Store>,
    enforcement: QuotaEnforcement,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn Store>, enforcement: QuotaEnforcement) -> Self {
        Self { store, enforcement }
    }

    pub fn enforcement(&self) -> QuotaEnforcement {
        self.enforcement
    }

    /// Append one ledger row. Does not check the quota.
    pub async fn record_usage(
        &self,
        subscription_id: Uuid,
        amount: i32,
        reason: &str,
    ) -> BillingResult<CreditUsage> {
        let usage = new_usage(subscription_id, amount, reason, None)?;
        Ok(self.store.append_usage(&usage).await?)
    }

    /// Quota figures for the user's current subscription, `None` without one
    pub async fn get_usage_window(&self, user_id: Uuid) -> BillingResult<Option<UsageWindow>> {
        let Some(subscription) = self.store.current_subscription(user_id).await? else {
            return Ok(None);
        };

        let plan = self
            .store
            .get_plan(subscription.plan_id)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(subscription.plan_id.to_string()))?;

        let used = self
            .store
            .sum_usage_since(subscription.id, window_start())
            .await?;

        Ok(Some(UsageWindow::new(
            subscription.id,
            i64::from(plan.daily_credit_quota),
            used,
        )))
    }

    /// Consume one credit for `reason` if the user has quota left
    ///
    /// A repeated `request_ref` for the same subscription is counted once.
    pub async fn consume(
        &self,
        user_id: Uuid,
        reason: &str,
        request_ref: Option<String>,
    ) -> BillingResult<ConsumeOutcome> {
        let Some(window) = self.get_usage_window(user_id).await? else {
            return Ok(ConsumeOutcome::NoActiveSubscription);
        };

        if window.remaining_last_24h <= 0 {
            return Ok(ConsumeOutcome::QuotaExhausted(window));
        }

        let usage = new_usage(window.subscription_id, 1, reason, request_ref)?;
        match self.enforcement {
            QuotaEnforcement::Strict => {
                let appended = self
                    .store
                    .append_usage_guarded(&usage, window.daily_quota, window_start())
                    .await?;
                if let GuardedAppend::Rejected { used } = appended {
                    tracing::info!(
                        user_id = %user_id,
                        subscription_id = %window.subscription_id,
                        used = used,
                        "Credit rejected by concurrent consumption"
                    );
                    return Ok(ConsumeOutcome::QuotaExhausted(UsageWindow::new(
                        window.subscription_id,
                        window.daily_quota,
                        used,
                    )));
                }
            }
            QuotaEnforcement::BestEffort => {
                self.store.append_usage(&usage).await?;
            }
        }

        // The marker may have moved between the two reads; report against the same subscription
        let used = self
            .store
            .sum_usage_since(window.subscription_id, window_start())
            .await?;
        let updated = UsageWindow::new(window.subscription_id, window.daily_quota, used);

        tracing::debug!(
            user_id = %user_id,
            subscription_id = %updated.subscription_id,
            reason = %reason,
            remaining = updated.remaining_last_24h,
            "Credit consumed"
        );
        Ok(ConsumeOutcome::Consumed(updated))
    }

    /// Ledger rows for a subscription, newest first
    pub async fn history(
        &self,
        subscription_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditUsage>> {
        Ok(self.store.list_usage(subscription_id, limit).await?)
    }
}

fn window_start() -> OffsetDateTime {
    OffsetDateTime::now_utc() - USAGE_WINDOW
}

fn new_usage(
    subscription_id: Uuid,
    amount: i32,
    reason: &str,
    request_ref: Option<String>,
) -> BillingResult<NewCreditUsage> {
    if amount <= 0 {
        return Err(BillingError::InvalidInput(format!(
            "usage amount must be positive, got {amount}"
        )));
    }
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(BillingError::InvalidInput("usage reason is required".into()));
    }
    Ok(NewCreditUsage {
        subscription_id,
        used: amount,
        reason: reason.to_string(),
        request_ref,
    })
}
