//! Billing Invariants Module
//!
//! Runnable consistency checks over subscription and checkout state. They
//! only read, and can be run after webhook replays or manual corrections.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use wizpix_shared::Store;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlement or money may be wrong
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Clone)]
pub struct InvariantChecker {
    store: Arc<dyn Store>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_completed_checkout_has_subscription().await?);
        violations.extend(self.check_active_plan_not_archived().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        if !violations.is_empty() {
            tracing::warn!(
                violations = violations.len(),
                checks_failed = checks_failed,
                "Billing invariant violations found"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// At most one subscription per user carries the current marker
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let conflicts = self.store.find_marker_conflicts().await?;

        Ok(conflicts
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} subscriptions marked active (expected at most 1)",
                    row.active_count
                ),
                context: serde_json::json!({
                    "active_count": row.active_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A completed checkout always references the subscription it created
    async fn check_completed_checkout_has_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let sessions = self.store.find_completed_checkouts_without_subscription().await?;

        Ok(sessions
            .into_iter()
            .map(|session_id| InvariantViolation {
                invariant: "completed_checkout_has_subscription".to_string(),
                user_ids: vec![],
                description: format!(
                    "Checkout session '{session_id}' is completed but has no subscription"
                ),
                context: serde_json::json!({
                    "session_id": session_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_active_plan_not_archived(&self) -> BillingResult<Vec<InvariantViolation>> {
        let subscription_ids = self.store.find_current_subscriptions_on_archived_plans().await?;

        let mut violations = Vec::with_capacity(subscription_ids.len());
        for subscription_id in subscription_ids {
            let subscription = self.store.get_subscription(subscription_id).await?;
            violations.push(InvariantViolation {
                invariant: "active_plan_not_archived".to_string(),
                user_ids: subscription.iter().map(|s| s.user_id).collect(),
                description: format!(
                    "Active subscription {subscription_id} is on an archived plan"
                ),
                context: serde_json::json!({
                    "subscription_id": subscription_id,
                    "plan_id": subscription.as_ref().map(|s| s.plan_id),
                }),
                severity: ViolationSeverity::Medium,
            });
        }
        Ok(violations)
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "completed_checkout_has_subscription" => {
                self.check_completed_checkout_has_subscription().await
            }
            "active_plan_not_archived" => self.check_active_plan_not_archived().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "completed_checkout_has_subscription",
            "active_plan_not_archived",
        ]
    }
}
