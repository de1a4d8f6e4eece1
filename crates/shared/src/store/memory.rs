//! In-memory adapter for the persistence gateway
//!
//! All tables live behind one async mutex, so every trait method is atomic
//! with respect to every other. Used by unit and router tests.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Store, WEBHOOK_PROCESSING_TIMEOUT_MINUTES};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    normalize_email, BillingPeriod, CheckoutRefs, CheckoutSessionState, CheckoutSettlement,
    CheckoutStatus, CreditUsage, Customer, CustomerProfile, GuardedAppend, Invoice,
    InvoiceRecorded, InvoiceStatus, InvoiceUpsert, MarkerConflict, NewCheckoutSession,
    NewCreditUsage, NewRefreshToken, NewSubscription, Plan, PlanSpec, RefreshTokenRecord,
    RotationOutcome, SettlementOutcome, SignupVerification, Subscription, SubscriptionPatch,
    SubscriptionStatus, User, WebhookClaim, WebhookEventRecord, WebhookEventStatus,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    signups: HashMap<String, SignupVerification>,
    plans: HashMap<Uuid, Plan>,
    subscriptions: HashMap<Uuid, Subscription>,
    usage: Vec<CreditUsage>,
    refresh_tokens: HashMap<String, RefreshTokenRecord>,
    checkouts: HashMap<String, CheckoutSessionState>,
    customers: HashMap<Uuid, Customer>,
    invoices: HashMap<String, Invoice>,
    webhook_events: HashMap<String, (WebhookEventRecord, OffsetDateTime)>,
}

impl Tables {
    fn user_by_email(&self, email: &str) -> Option<&User> {
        let email = normalize_email(email);
        self.users.values().find(|u| u.email == email)
    }

    fn insert_subscription(&mut self, new: &NewSubscription) -> StoreResult<Subscription> {
        if !self.users.contains_key(&new.user_id) {
            return Err(StoreError::NotFound(format!("user {}", new.user_id)));
        }

        let now = OffsetDateTime::now_utc();
        let period = if new.is_active {
            Some(new.period.unwrap_or_else(|| BillingPeriod::starting_at(now)))
        } else {
            new.period
        };

        if new.is_active {
            for sub in self
                .subscriptions
                .values_mut()
                .filter(|s| s.user_id == new.user_id && s.is_active)
            {
                if !sub.status.is_terminal() {
                    sub.status = SubscriptionStatus::Canceled;
                }
                sub.is_active = false;
                sub.period_end = Some(now);
                sub.canceled_at.get_or_insert(now);
                sub.updated_at = now;
            }
        }

        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            plan_id: new.plan_id,
            status: new.status,
            is_active: new.is_active,
            period_start: period.map(|p| p.start),
            period_end: period.map(|p| p.end),
            external_subscription_id: new.external_subscription_id.clone(),
            external_customer_id: new.external_customer_id.clone(),
            credit_initial: new.credit_initial,
            credit_used: 0,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        };
        self.subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    fn upsert_customer(&mut self, user_id: Uuid, profile: &CustomerProfile) -> Customer {
        let now = OffsetDateTime::now_utc();
        let customer = self.customers.entry(user_id).or_insert_with(|| Customer {
            id: Uuid::new_v4(),
            user_id,
            external_customer_id: None,
            first_name: None,
            last_name: None,
            phone: None,
            address_line1: None,
            address_line2: None,
            postal_code: None,
            city: None,
            country: None,
            total_spent_cents: 0,
            created_at: now,
            updated_at: now,
        });

        fn merge(slot: &mut Option<String>, value: &Option<String>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        merge(&mut customer.external_customer_id, &profile.external_customer_id);
        merge(&mut customer.first_name, &profile.first_name);
        merge(&mut customer.last_name, &profile.last_name);
        merge(&mut customer.phone, &profile.phone);
        merge(&mut customer.address_line1, &profile.address_line1);
        merge(&mut customer.address_line2, &profile.address_line2);
        merge(&mut customer.postal_code, &profile.postal_code);
        merge(&mut customer.city, &profile.city);
        merge(&mut customer.country, &profile.country);
        customer.updated_at = now;
        customer.clone()
    }

    fn get_or_create_checkout(&mut self, new: &NewCheckoutSession) -> CheckoutSessionState {
        let now = OffsetDateTime::now_utc();
        self.checkouts
            .entry(new.session_id.clone())
            .or_insert_with(|| CheckoutSessionState {
                session_id: new.session_id.clone(),
                email: normalize_email(&new.email),
                plan_code: new.plan_code.clone(),
                currency: new.currency.clone(),
                status: CheckoutStatus::Pending,
                user_id: None,
                subscription_id: None,
                plan_id: None,
                last_error: None,
                consumed_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            })
            .clone()
    }

    fn existing_usage(&self, subscription_id: Uuid, request_ref: Option<&str>) -> Option<&CreditUsage> {
        let request_ref = request_ref?;
        self.usage.iter().find(|u| {
            u.subscription_id == subscription_id && u.request_ref.as_deref() == Some(request_ref)
        })
    }

    fn push_usage(&mut self, usage: &NewCreditUsage) -> CreditUsage {
        if let Some(existing) = self.existing_usage(usage.subscription_id, usage.request_ref.as_deref()) {
            return existing.clone();
        }
        let row = CreditUsage {
            id: Uuid::new_v4(),
            subscription_id: usage.subscription_id,
            used: usage.used,
            reason: usage.reason.clone(),
            request_ref: usage.request_ref.clone(),
            occurred_at: OffsetDateTime::now_utc(),
        };
        self.usage.push(row.clone());
        row
    }

    fn sum_usage(&self, subscription_id: Uuid, since: OffsetDateTime) -> i64 {
        self.usage
            .iter()
            .filter(|u| u.subscription_id == subscription_id && u.occurred_at > since)
            .map(|u| i64::from(u.used))
            .sum()
    }
}

/// Persistence gateway held entirely in process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Fixture helpers that write around the `Store` rules; test builds only
#[cfg(any(test, feature = "testing"))]
impl MemoryStore {
    /// Move the timestamp of every ledger row for a subscription back by `by`
    pub async fn age_usage(&self, subscription_id: Uuid, by: time::Duration) {
        let mut t = self.tables.lock().await;
        for row in t.usage.iter_mut().filter(|u| u.subscription_id == subscription_id) {
            row.occurred_at -= by;
        }
    }

    /// Move the creation time of a checkout session back by `by`
    pub async fn age_checkout(&self, session_id: &str, by: time::Duration) {
        let mut t = self.tables.lock().await;
        if let Some(session) = t.checkouts.get_mut(session_id) {
            session.created_at -= by;
        }
    }

    /// Archive a plan so it no longer accepts new checkouts
    pub async fn archive_plan(&self, plan_id: Uuid) {
        let mut t = self.tables.lock().await;
        if let Some(plan) = t.plans.get_mut(&plan_id) {
            plan.is_archived = true;
        }
    }

    /// Write a subscription row as-is, bypassing the one-current-per-user rule
    pub async fn force_subscription(&self, subscription: Subscription) {
        let mut t = self.tables.lock().await;
        t.subscriptions.insert(subscription.id, subscription);
    }

    /// Write a checkout session row as-is
    pub async fn force_checkout(&self, session: CheckoutSessionState) {
        let mut t = self.tables.lock().await;
        t.checkouts.insert(session.session_id.clone(), session);
    }

    /// Create an account directly, without a verified signup
    pub async fn insert_user(&self, email: &str, password_hash: &str) -> User {
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: normalize_email(email),
            password_hash: password_hash.to_string(),
            created_at: now,
            updated_at: now,
        };
        let mut t = self.tables.lock().await;
        t.users.insert(user.id, user.clone());
        user
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let t = self.tables.lock().await;
        Ok(t.user_by_email(email).cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let t = self.tables.lock().await;
        Ok(t.users.get(&id).cloned())
    }

    async fn save_verified_signup(&self, email: &str, password_hash: &str) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let email = normalize_email(email);
        let now = OffsetDateTime::now_utc();
        match t.signups.get_mut(&email) {
            Some(existing) if existing.account_created => {}
            Some(existing) => {
                existing.password_hash = password_hash.to_string();
                existing.verified_at = Some(now);
            }
            None => {
                t.signups.insert(
                    email.clone(),
                    SignupVerification {
                        email,
                        password_hash: password_hash.to_string(),
                        verified_at: Some(now),
                        account_created: false,
                    },
                );
            }
        }
        Ok(())
    }

    async fn find_verified_signup(&self, email: &str) -> StoreResult<Option<SignupVerification>> {
        let t = self.tables.lock().await;
        Ok(t.signups.get(&normalize_email(email)).cloned())
    }

    async fn discard_unverified_signup(&self, email: &str) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        let email = normalize_email(email);
        let removable = t.signups.get(&email).is_some_and(|s| !s.account_created);
        if removable {
            t.signups.remove(&email);
        }
        Ok(removable)
    }

    async fn get_plan_by_code(&self, code: &str) -> StoreResult<Option<Plan>> {
        let t = self.tables.lock().await;
        Ok(t.plans.values().find(|p| p.code == code).cloned())
    }

    async fn get_plan(&self, id: Uuid) -> StoreResult<Option<Plan>> {
        let t = self.tables.lock().await;
        Ok(t.plans.get(&id).cloned())
    }

    async fn upsert_plan(&self, spec: &PlanSpec) -> StoreResult<Plan> {
        let mut t = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(plan) = t.plans.values_mut().find(|p| p.code == spec.code) {
            plan.name.clone_from(&spec.name);
            plan.price_cents = spec.price_cents;
            plan.currency.clone_from(&spec.currency);
            plan.billing_interval.clone_from(&spec.billing_interval);
            plan.daily_credit_quota = spec.daily_credit_quota;
            if spec.external_price_id.is_some() {
                plan.external_price_id.clone_from(&spec.external_price_id);
            }
            plan.updated_at = now;
            return Ok(plan.clone());
        }

        let plan = Plan {
            id: Uuid::new_v4(),
            code: spec.code.clone(),
            name: spec.name.clone(),
            price_cents: spec.price_cents,
            currency: spec.currency.clone(),
            billing_interval: spec.billing_interval.clone(),
            daily_credit_quota: spec.daily_credit_quota,
            external_price_id: spec.external_price_id.clone(),
            is_archived: false,
            created_at: now,
            updated_at: now,
        };
        t.plans.insert(plan.id, plan.clone());
        Ok(plan)
    }

    async fn create_subscription(&self, new: &NewSubscription) -> StoreResult<Subscription> {
        let mut t = self.tables.lock().await;
        t.insert_subscription(new)
    }

    async fn update_subscription(
        &self,
        id: Uuid,
        patch: &SubscriptionPatch,
    ) -> StoreResult<Option<Subscription>> {
        let mut t = self.tables.lock().await;
        let Some(sub) = t.subscriptions.get_mut(&id) else {
            return Ok(None);
        };

        if let Some(status) = patch.status {
            sub.status = status;
        }
        if patch.clears_marker() {
            sub.is_active = false;
        }
        if patch.external_subscription_id.is_some() {
            sub.external_subscription_id
                .clone_from(&patch.external_subscription_id);
        }
        if patch.external_customer_id.is_some() {
            sub.external_customer_id.clone_from(&patch.external_customer_id);
        }
        if patch.period_start.is_some() {
            sub.period_start = patch.period_start;
        }
        if patch.period_end.is_some() {
            sub.period_end = patch.period_end;
        }
        if patch.canceled_at.is_some() {
            sub.canceled_at = patch.canceled_at;
        }
        sub.updated_at = OffsetDateTime::now_utc();
        Ok(Some(sub.clone()))
    }

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>> {
        let t = self.tables.lock().await;
        Ok(t.subscriptions.get(&id).cloned())
    }

    async fn current_subscription(&self, user_id: Uuid) -> StoreResult<Option<Subscription>> {
        let t = self.tables.lock().await;
        Ok(t
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.is_active)
            .cloned())
    }

    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        let t = self.tables.lock().await;
        Ok(t
            .subscriptions
            .values()
            .filter(|s| s.external_subscription_id.as_deref() == Some(external_subscription_id))
            .max_by_key(|s| (s.is_active, s.created_at))
            .cloned())
    }

    async fn find_subscription_by_external_customer(
        &self,
        external_customer_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        let t = self.tables.lock().await;
        Ok(t
            .subscriptions
            .values()
            .filter(|s| s.external_customer_id.as_deref() == Some(external_customer_id))
            .max_by_key(|s| (s.is_active, s.created_at))
            .cloned())
    }

    async fn append_usage(&self, usage: &NewCreditUsage) -> StoreResult<CreditUsage> {
        let mut t = self.tables.lock().await;
        if !t.subscriptions.contains_key(&usage.subscription_id) {
            return Err(StoreError::NotFound(format!(
                "subscription {}",
                usage.subscription_id
            )));
        }
        Ok(t.push_usage(usage))
    }

    async fn append_usage_guarded(
        &self,
        usage: &NewCreditUsage,
        quota: i64,
        since: OffsetDateTime,
    ) -> StoreResult<GuardedAppend> {
        let mut t = self.tables.lock().await;
        if !t.subscriptions.contains_key(&usage.subscription_id) {
            return Err(StoreError::NotFound(format!(
                "subscription {}",
                usage.subscription_id
            )));
        }

        if let Some(existing) = t.existing_usage(usage.subscription_id, usage.request_ref.as_deref()) {
            return Ok(GuardedAppend::Appended(existing.clone()));
        }

        let used = t.sum_usage(usage.subscription_id, since);
        if used + i64::from(usage.used) > quota {
            return Ok(GuardedAppend::Rejected { used });
        }
        Ok(GuardedAppend::Appended(t.push_usage(usage)))
    }

    async fn sum_usage_since(
        &self,
        subscription_id: Uuid,
        since: OffsetDateTime,
    ) -> StoreResult<i64> {
        let t = self.tables.lock().await;
        Ok(t.sum_usage(subscription_id, since))
    }

    async fn list_usage(&self, subscription_id: Uuid, limit: i64) -> StoreResult<Vec<CreditUsage>> {
        let t = self.tables.lock().await;
        let mut rows: Vec<CreditUsage> = t
            .usage
            .iter()
            .filter(|u| u.subscription_id == subscription_id)
            .cloned()
            .collect();
        // Insertion order breaks timestamp ties
        rows.reverse();
        rows.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        rows.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(rows)
    }

    async fn insert_refresh_token(
        &self,
        token: &NewRefreshToken,
    ) -> StoreResult<RefreshTokenRecord> {
        let mut t = self.tables.lock().await;
        if t.refresh_tokens.contains_key(&token.jti) {
            return Err(StoreError::Conflict(format!("refresh token {}", token.jti)));
        }
        let record = RefreshTokenRecord {
            jti: token.jti.clone(),
            user_id: token.user_id,
            issued_at: OffsetDateTime::now_utc(),
            expires_at: token.expires_at,
            ip_address: token.ip_address.clone(),
            user_agent: token.user_agent.clone(),
            parent_jti: None,
            replaced_by: None,
            revoked_at: None,
            revocation_reason: None,
        };
        t.refresh_tokens.insert(record.jti.clone(), record.clone());
        Ok(record)
    }

    async fn find_refresh_token(&self, jti: &str) -> StoreResult<Option<RefreshTokenRecord>> {
        let t = self.tables.lock().await;
        Ok(t.refresh_tokens.get(jti).cloned())
    }

    async fn rotate_refresh_token(
        &self,
        old_jti: &str,
        next: &NewRefreshToken,
    ) -> StoreResult<RotationOutcome> {
        let mut t = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();

        match t.refresh_tokens.get(old_jti) {
            None => return Ok(RotationOutcome::NotFound),
            Some(record) if record.is_revoked() => {
                return Ok(RotationOutcome::AlreadyRevoked(record.clone()))
            }
            Some(_) => {}
        }
        if t.refresh_tokens.contains_key(&next.jti) {
            return Err(StoreError::Conflict(format!("refresh token {}", next.jti)));
        }

        let child = RefreshTokenRecord {
            jti: next.jti.clone(),
            user_id: next.user_id,
            issued_at: now,
            expires_at: next.expires_at,
            ip_address: next.ip_address.clone(),
            user_agent: next.user_agent.clone(),
            parent_jti: Some(old_jti.to_string()),
            replaced_by: None,
            revoked_at: None,
            revocation_reason: None,
        };
        t.refresh_tokens.insert(child.jti.clone(), child.clone());

        if let Some(old) = t.refresh_tokens.get_mut(old_jti) {
            old.revoked_at = Some(now);
            old.revocation_reason = Some("rotated".to_string());
            old.replaced_by = Some(child.jti.clone());
        }
        Ok(RotationOutcome::Rotated(child))
    }

    async fn revoke_refresh_chain(&self, jti: &str, reason: &str) -> StoreResult<u64> {
        let mut t = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();

        let mut chain = vec![jti.to_string()];
        let mut cursor = 0;
        while cursor < chain.len() {
            let parent = chain[cursor].clone();
            chain.extend(
                t.refresh_tokens
                    .values()
                    .filter(|r| r.parent_jti.as_deref() == Some(parent.as_str()))
                    .map(|r| r.jti.clone()),
            );
            cursor += 1;
        }

        let mut revoked = 0;
        for id in chain {
            if let Some(record) = t.refresh_tokens.get_mut(&id) {
                if record.revoked_at.is_none() {
                    record.revoked_at = Some(now);
                    record.revocation_reason = Some(reason.to_string());
                    revoked += 1;
                }
            }
        }
        Ok(revoked)
    }

    async fn revoke_all_refresh_tokens(&self, user_id: Uuid, reason: &str) -> StoreResult<u64> {
        let mut t = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        let mut revoked = 0;
        for record in t
            .refresh_tokens
            .values_mut()
            .filter(|r| r.user_id == user_id && r.revoked_at.is_none())
        {
            record.revoked_at = Some(now);
            record.revocation_reason = Some(reason.to_string());
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn checkout_get_or_create(
        &self,
        new: &NewCheckoutSession,
    ) -> StoreResult<CheckoutSessionState> {
        let mut t = self.tables.lock().await;
        Ok(t.get_or_create_checkout(new))
    }

    async fn checkout_get(&self, session_id: &str) -> StoreResult<Option<CheckoutSessionState>> {
        let t = self.tables.lock().await;
        Ok(t.checkouts.get(session_id).cloned())
    }

    async fn checkout_complete(
        &self,
        session_id: &str,
        refs: &CheckoutRefs,
    ) -> StoreResult<Option<CheckoutSessionState>> {
        let mut t = self.tables.lock().await;
        let Some(session) = t.checkouts.get_mut(session_id) else {
            return Ok(None);
        };
        if session.status == CheckoutStatus::Pending {
            let now = OffsetDateTime::now_utc();
            session.status = CheckoutStatus::Completed;
            session.user_id = Some(refs.user_id);
            session.subscription_id = Some(refs.subscription_id);
            session.plan_id = Some(refs.plan_id);
            session.completed_at = Some(now);
            session.updated_at = now;
        }
        Ok(Some(session.clone()))
    }

    async fn checkout_fail(
        &self,
        session_id: &str,
        reason: &str,
    ) -> StoreResult<Option<CheckoutSessionState>> {
        let mut t = self.tables.lock().await;
        let Some(session) = t.checkouts.get_mut(session_id) else {
            return Ok(None);
        };
        if session.status == CheckoutStatus::Pending {
            session.status = CheckoutStatus::Failed;
            session.last_error = Some(reason.to_string());
            session.updated_at = OffsetDateTime::now_utc();
        }
        Ok(Some(session.clone()))
    }

    async fn checkout_mark_consumed(&self, session_id: &str) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        let Some(session) = t.checkouts.get_mut(session_id) else {
            return Ok(false);
        };
        if session.status != CheckoutStatus::Completed || session.consumed_at.is_some() {
            return Ok(false);
        }
        let now = OffsetDateTime::now_utc();
        session.consumed_at = Some(now);
        session.updated_at = now;
        Ok(true)
    }

    async fn checkout_delete_pending(
        &self,
        session_id: &str,
    ) -> StoreResult<Option<CheckoutSessionState>> {
        let mut t = self.tables.lock().await;
        let pending = t
            .checkouts
            .get(session_id)
            .is_some_and(|s| s.status == CheckoutStatus::Pending);
        Ok(if pending {
            t.checkouts.remove(session_id)
        } else {
            None
        })
    }

    async fn checkout_expire_stale(
        &self,
        older_than: OffsetDateTime,
        reason: &str,
    ) -> StoreResult<u64> {
        let mut t = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        let mut expired = 0;
        for session in t
            .checkouts
            .values_mut()
            .filter(|s| s.status == CheckoutStatus::Pending && s.created_at < older_than)
        {
            session.status = CheckoutStatus::Failed;
            session.last_error = Some(reason.to_string());
            session.updated_at = now;
            expired += 1;
        }
        Ok(expired)
    }

    async fn settle_checkout(
        &self,
        settlement: &CheckoutSettlement,
    ) -> StoreResult<SettlementOutcome> {
        let mut t = self.tables.lock().await;
        let state = t.get_or_create_checkout(&settlement.session);
        if state.status.is_terminal() {
            return Ok(SettlementOutcome::AlreadyTerminal(state));
        }

        let user = match t.user_by_email(&state.email).cloned() {
            Some(user) => user,
            None => {
                let Some(signup) = t
                    .signups
                    .get_mut(&state.email)
                    .filter(|s| s.verified_at.is_some())
                else {
                    return Ok(SettlementOutcome::NoVerifiedSignup);
                };
                signup.account_created = true;

                let now = OffsetDateTime::now_utc();
                let user = User {
                    id: Uuid::new_v4(),
                    email: state.email.clone(),
                    password_hash: signup.password_hash.clone(),
                    created_at: now,
                    updated_at: now,
                };
                t.users.insert(user.id, user.clone());
                user
            }
        };

        t.upsert_customer(user.id, &settlement.profile);
        let subscription = t.insert_subscription(&NewSubscription {
            user_id: user.id,
            plan_id: settlement.plan_id,
            is_active: true,
            status: SubscriptionStatus::Active,
            credit_initial: settlement.credit_initial,
            period: settlement.period,
            external_subscription_id: settlement.external_subscription_id.clone(),
            external_customer_id: settlement.external_customer_id.clone(),
        })?;

        let now = OffsetDateTime::now_utc();
        let session = t
            .checkouts
            .get_mut(&state.session_id)
            .ok_or_else(|| StoreError::NotFound(format!("checkout session {}", state.session_id)))?;
        session.status = CheckoutStatus::Completed;
        session.user_id = Some(user.id);
        session.subscription_id = Some(subscription.id);
        session.plan_id = Some(settlement.plan_id);
        session.completed_at = Some(now);
        session.updated_at = now;
        Ok(SettlementOutcome::Completed(session.clone()))
    }

    async fn upsert_customer(
        &self,
        user_id: Uuid,
        profile: &CustomerProfile,
    ) -> StoreResult<Customer> {
        let mut t = self.tables.lock().await;
        Ok(t.upsert_customer(user_id, profile))
    }

    async fn find_customer_by_user(&self, user_id: Uuid) -> StoreResult<Option<Customer>> {
        let t = self.tables.lock().await;
        Ok(t.customers.get(&user_id).cloned())
    }

    async fn find_customer_by_external_id(
        &self,
        external_customer_id: &str,
    ) -> StoreResult<Option<Customer>> {
        let t = self.tables.lock().await;
        Ok(t
            .customers
            .values()
            .filter(|c| c.external_customer_id.as_deref() == Some(external_customer_id))
            .max_by_key(|c| c.updated_at)
            .cloned())
    }

    async fn record_invoice(&self, upsert: &InvoiceUpsert) -> StoreResult<InvoiceRecorded> {
        let mut t = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();

        let invoice = match t.invoices.get_mut(&upsert.external_invoice_id) {
            Some(existing) => {
                if upsert.subscription_id.is_some() {
                    existing.subscription_id = upsert.subscription_id;
                }
                if upsert.plan_id.is_some() {
                    existing.plan_id = upsert.plan_id;
                }
                if upsert.external_payment_intent_id.is_some() {
                    existing
                        .external_payment_intent_id
                        .clone_from(&upsert.external_payment_intent_id);
                }
                existing.amount_due_cents = upsert.amount_due_cents;
                existing.amount_paid_cents =
                    existing.amount_paid_cents.max(upsert.amount_paid_cents);
                existing.currency.clone_from(&upsert.currency);
                if existing.status != InvoiceStatus::Paid {
                    existing.status = upsert.status;
                }
                if upsert.hosted_invoice_url.is_some() {
                    existing.hosted_invoice_url.clone_from(&upsert.hosted_invoice_url);
                }
                if upsert.invoice_pdf.is_some() {
                    existing.invoice_pdf.clone_from(&upsert.invoice_pdf);
                }
                if upsert.period_start.is_some() {
                    existing.period_start = upsert.period_start;
                }
                if upsert.period_end.is_some() {
                    existing.period_end = upsert.period_end;
                }
                if upsert.issued_at.is_some() {
                    existing.issued_at = upsert.issued_at;
                }
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let invoice = Invoice {
                    id: Uuid::new_v4(),
                    external_invoice_id: upsert.external_invoice_id.clone(),
                    user_id: upsert.user_id,
                    subscription_id: upsert.subscription_id,
                    plan_id: upsert.plan_id,
                    external_payment_intent_id: upsert.external_payment_intent_id.clone(),
                    amount_due_cents: upsert.amount_due_cents,
                    amount_paid_cents: upsert.amount_paid_cents,
                    currency: upsert.currency.clone(),
                    status: upsert.status,
                    hosted_invoice_url: upsert.hosted_invoice_url.clone(),
                    invoice_pdf: upsert.invoice_pdf.clone(),
                    period_start: upsert.period_start,
                    period_end: upsert.period_end,
                    issued_at: upsert.issued_at,
                    spend_recorded: false,
                    created_at: now,
                    updated_at: now,
                };
                t.invoices
                    .insert(invoice.external_invoice_id.clone(), invoice.clone());
                invoice
            }
        };

        if invoice.status != InvoiceStatus::Paid || invoice.spend_recorded {
            return Ok(InvoiceRecorded {
                invoice,
                spend_added: false,
            });
        }

        let customer = t.upsert_customer(invoice.user_id, &CustomerProfile::default());
        if let Some(c) = t.customers.get_mut(&customer.user_id) {
            c.total_spent_cents += invoice.amount_paid_cents;
        }
        let stored = t
            .invoices
            .get_mut(&invoice.external_invoice_id)
            .ok_or_else(|| StoreError::NotFound(format!("invoice {}", invoice.external_invoice_id)))?;
        stored.spend_recorded = true;

        Ok(InvoiceRecorded {
            invoice: stored.clone(),
            spend_added: true,
        })
    }

    async fn find_invoice(&self, external_invoice_id: &str) -> StoreResult<Option<Invoice>> {
        let t = self.tables.lock().await;
        Ok(t.invoices.get(external_invoice_id).cloned())
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<WebhookClaim> {
        let mut t = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        let stale_before = now - time::Duration::minutes(WEBHOOK_PROCESSING_TIMEOUT_MINUTES);

        match t.webhook_events.get_mut(event_id) {
            None => {
                let record = WebhookEventRecord {
                    event_id: event_id.to_string(),
                    event_type: event_type.to_string(),
                    payload: payload.clone(),
                    status: WebhookEventStatus::Processing,
                    error_message: None,
                    attempts: 1,
                    received_at: now,
                    processed_at: None,
                };
                t.webhook_events
                    .insert(event_id.to_string(), (record, now));
                Ok(WebhookClaim::Claimed)
            }
            Some((record, started_at)) => {
                let reclaimable = record.status == WebhookEventStatus::Failed
                    || (record.status == WebhookEventStatus::Processing
                        && *started_at < stale_before);
                if !reclaimable {
                    return Ok(WebhookClaim::Duplicate(record.status));
                }
                record.status = WebhookEventStatus::Processing;
                record.attempts += 1;
                record.error_message = None;
                *started_at = now;
                Ok(WebhookClaim::Claimed)
            }
        }
    }

    async fn finish_webhook_event(&self, event_id: &str, error: Option<&str>) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if let Some((record, _)) = t.webhook_events.get_mut(event_id) {
            record.status = if error.is_some() {
                WebhookEventStatus::Failed
            } else {
                WebhookEventStatus::Processed
            };
            record.error_message = error.map(str::to_string);
            record.processed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn get_webhook_event(&self, event_id: &str) -> StoreResult<Option<WebhookEventRecord>> {
        let t = self.tables.lock().await;
        Ok(t.webhook_events.get(event_id).map(|(r, _)| r.clone()))
    }

    async fn list_failed_webhook_events(
        &self,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEventRecord>> {
        let t = self.tables.lock().await;
        let mut failed: Vec<WebhookEventRecord> = t
            .webhook_events
            .values()
            .filter(|(r, _)| r.status == WebhookEventStatus::Failed)
            .map(|(r, _)| r.clone())
            .collect();
        failed.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        failed.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(failed)
    }

    async fn find_marker_conflicts(&self) -> StoreResult<Vec<MarkerConflict>> {
        let t = self.tables.lock().await;
        let mut counts: HashMap<Uuid, i64> = HashMap::new();
        for sub in t.subscriptions.values().filter(|s| s.is_active) {
            *counts.entry(sub.user_id).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(user_id, active_count)| MarkerConflict {
                user_id,
                active_count,
            })
            .collect())
    }

    async fn find_completed_checkouts_without_subscription(&self) -> StoreResult<Vec<String>> {
        let t = self.tables.lock().await;
        Ok(t
            .checkouts
            .values()
            .filter(|s| s.status == CheckoutStatus::Completed && s.subscription_id.is_none())
            .map(|s| s.session_id.clone())
            .collect())
    }

    async fn find_current_subscriptions_on_archived_plans(&self) -> StoreResult<Vec<Uuid>> {
        let t = self.tables.lock().await;
        Ok(t
            .subscriptions
            .values()
            .filter(|s| s.is_active)
            .filter(|s| t.plans.get(&s.plan_id).is_some_and(|p| p.is_archived))
            .map(|s| s.id)
            .collect())
    }
}
