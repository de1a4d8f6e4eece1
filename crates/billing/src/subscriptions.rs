//! Subscription management
//!
//! Plan and subscription lookups plus the writes driven by checkout and
//! payment lifecycle events. The one-current-subscription-per-user rule is
//! enforced by the store when a subscription is created active.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;
use wizpix_shared::models::{
    NewSubscription, Plan, PlanSpec, Subscription, SubscriptionPatch, SubscriptionStatus,
};
use wizpix_shared::Store;

use crate::error::{BillingError, BillingResult};
use crate::plans::PlanCatalog;

#[derive(Clone)]
pub struct SubscriptionRepository {
    store: Arc<dyn Store>,
    catalog: Arc<PlanCatalog>,
}

impl SubscriptionRepository {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<PlanCatalog>) -> Self {
        Self { store, catalog }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub async fn get_plan_by_code(&self, code: &str) -> BillingResult<Option<Plan>> {
        Ok(self.store.get_plan_by_code(&code.trim().to_ascii_lowercase()).await?)
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self.store.get_plan(plan_id).await?)
    }

    /// Create or correct a plan row by its unique code
    pub async fn upsert_plan_by_code(&self, spec: &PlanSpec) -> BillingResult<Plan> {
        let plan = self.store.upsert_plan(spec).await?;
        tracing::info!(plan_code = %plan.code, plan_id = %plan.id, "Plan upserted");
        Ok(plan)
    }

    /// Resolve a plan, provisioning it from the catalog the first time it is billed
    pub async fn ensure_plan(&self, code: &str) -> BillingResult<Plan> {
        if let Some(plan) = self.get_plan_by_code(code).await? {
            return Ok(plan);
        }

        let definition = self
            .catalog
            .get(code)
            .ok_or_else(|| BillingError::PlanNotFound(code.to_string()))?;

        tracing::info!(plan_code = %definition.code, "Provisioning plan from catalog");
        self.upsert_plan_by_code(&definition.to_spec()).await
    }

    pub async fn create_subscription(&self, new: &NewSubscription) -> BillingResult<Subscription> {
        let subscription = self.store.create_subscription(new).await?;
        tracing::info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            plan_id = %subscription.plan_id,
            is_active = subscription.is_active,
            "Subscription created"
        );
        Ok(subscription)
    }

    pub async fn update_subscription(
        &self,
        subscription_id: Uuid,
        patch: &SubscriptionPatch,
    ) -> BillingResult<Option<Subscription>> {
        let updated = self.store.update_subscription(subscription_id, patch).await?;
        if let Some(sub) = &updated {
            tracing::debug!(
                subscription_id = %sub.id,
                status = %sub.status,
                is_active = sub.is_active,
                "Subscription updated"
            );
        }
        Ok(updated)
    }

    pub async fn get_current_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.store.current_subscription(user_id).await?)
    }

    pub async fn find_by_external_subscription(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .store
            .find_subscription_by_external_id(external_subscription_id)
            .await?)
    }

    pub async fn find_by_external_customer(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .store
            .find_subscription_by_external_customer(external_customer_id)
            .await?)
    }

    /// Cancel a subscription, clearing its current marker
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        canceled_at: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Option<Subscription>> {
        let now = OffsetDateTime::now_utc();
        self.update_subscription(
            subscription_id,
            &SubscriptionPatch {
                status: Some(SubscriptionStatus::Canceled),
                clear_active: true,
                canceled_at: Some(canceled_at.unwrap_or(now)),
                period_end: Some(period_end.unwrap_or(now)),
                ..Default::default()
            },
        )
        .await
    }
}
