//! Persistence gateway
//!
//! Every component receives an `Arc<dyn Store>` at construction. Compound
//! state transitions (subscription activation, checkout settlement, refresh
//! token rotation, invoice recording) are single methods so each adapter can
//! run them atomically: `PgStore` inside one database transaction, `MemoryStore`
//! under one lock.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{
    CheckoutRefs, CheckoutSessionState, CheckoutSettlement, CreditUsage, Customer,
    CustomerProfile, GuardedAppend, Invoice, InvoiceRecorded, InvoiceUpsert, MarkerConflict,
    NewCheckoutSession, NewCreditUsage, NewRefreshToken, NewSubscription, Plan, PlanSpec,
    RefreshTokenRecord, RotationOutcome, SettlementOutcome, SignupVerification, Subscription,
    SubscriptionPatch, User, WebhookClaim, WebhookEventRecord,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// A delivery stuck in `processing` longer than this may be claimed again
pub const WEBHOOK_PROCESSING_TIMEOUT_MINUTES: i64 = 30;

#[async_trait]
pub trait Store: Send + Sync {
    // ---------------------------------------------------------------- users

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;

    /// Record a signup whose email ownership has been verified
    async fn save_verified_signup(&self, email: &str, password_hash: &str) -> StoreResult<()>;

    async fn find_verified_signup(&self, email: &str) -> StoreResult<Option<SignupVerification>>;

    /// Remove a signup that never produced an account. Returns whether a row was removed.
    async fn discard_unverified_signup(&self, email: &str) -> StoreResult<bool>;

    // ---------------------------------------------------------------- plans

    async fn get_plan_by_code(&self, code: &str) -> StoreResult<Option<Plan>>;

    async fn get_plan(&self, id: Uuid) -> StoreResult<Option<Plan>>;

    /// Insert or correct a plan keyed by its unique code
    async fn upsert_plan(&self, spec: &PlanSpec) -> StoreResult<Plan>;

    // -------------------------------------------------------- subscriptions

    /// Insert a subscription. When `is_active`, the marker is moved off any
    /// previous current subscription of the user in the same atomic unit.
    async fn create_subscription(&self, new: &NewSubscription) -> StoreResult<Subscription>;

    async fn update_subscription(
        &self,
        id: Uuid,
        patch: &SubscriptionPatch,
    ) -> StoreResult<Option<Subscription>>;

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>>;

    async fn current_subscription(&self, user_id: Uuid) -> StoreResult<Option<Subscription>>;

    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>>;

    /// Current subscription for an external customer, else its most recent one
    async fn find_subscription_by_external_customer(
        &self,
        external_customer_id: &str,
    ) -> StoreResult<Option<Subscription>>;

    // --------------------------------------------------------------- ledger

    /// Append a ledger row. A repeated `request_ref` returns the existing row.
    async fn append_usage(&self, usage: &NewCreditUsage) -> StoreResult<CreditUsage>;

    /// Sum usage since `since` and append only if the result stays within
    /// `quota`, serialized per subscription.
    async fn append_usage_guarded(
        &self,
        usage: &NewCreditUsage,
        quota: i64,
        since: OffsetDateTime,
    ) -> StoreResult<GuardedAppend>;

    async fn sum_usage_since(&self, subscription_id: Uuid, since: OffsetDateTime)
        -> StoreResult<i64>;

    /// Ledger rows for a subscription, newest first
    async fn list_usage(&self, subscription_id: Uuid, limit: i64) -> StoreResult<Vec<CreditUsage>>;

    // ------------------------------------------------------- refresh tokens

    async fn insert_refresh_token(&self, token: &NewRefreshToken)
        -> StoreResult<RefreshTokenRecord>;

    async fn find_refresh_token(&self, jti: &str) -> StoreResult<Option<RefreshTokenRecord>>;

    /// Revoke `old_jti` and insert `next` as its child, only if `old_jti` is
    /// still unrevoked. Nothing is written otherwise.
    async fn rotate_refresh_token(
        &self,
        old_jti: &str,
        next: &NewRefreshToken,
    ) -> StoreResult<RotationOutcome>;

    /// Revoke every unrevoked token descending from `jti` through rotation links
    async fn revoke_refresh_chain(&self, jti: &str, reason: &str) -> StoreResult<u64>;

    async fn revoke_all_refresh_tokens(&self, user_id: Uuid, reason: &str) -> StoreResult<u64>;

    // ------------------------------------------------------------- checkout

    /// Register a session as pending the first time it is seen; later calls return it unchanged
    async fn checkout_get_or_create(
        &self,
        new: &NewCheckoutSession,
    ) -> StoreResult<CheckoutSessionState>;

    async fn checkout_get(&self, session_id: &str) -> StoreResult<Option<CheckoutSessionState>>;

    /// pending -> completed. Returns the row as it stands afterwards.
    async fn checkout_complete(
        &self,
        session_id: &str,
        refs: &CheckoutRefs,
    ) -> StoreResult<Option<CheckoutSessionState>>;

    /// pending -> failed. Returns the row as it stands afterwards.
    async fn checkout_fail(
        &self,
        session_id: &str,
        reason: &str,
    ) -> StoreResult<Option<CheckoutSessionState>>;

    /// Stamp `consumed_at` on a completed, unconsumed session; false when
    /// the session is not completed or another caller consumed it first
    async fn checkout_mark_consumed(&self, session_id: &str) -> StoreResult<bool>;

    /// Delete a session only while it is pending; returns the deleted row
    async fn checkout_delete_pending(
        &self,
        session_id: &str,
    ) -> StoreResult<Option<CheckoutSessionState>>;

    /// Fail every pending session created before `older_than`
    async fn checkout_expire_stale(&self, older_than: OffsetDateTime, reason: &str)
        -> StoreResult<u64>;

    /// Resolve or create the user, upsert the customer profile, create the
    /// subscription and complete the session as one atomic unit
    async fn settle_checkout(&self, settlement: &CheckoutSettlement)
        -> StoreResult<SettlementOutcome>;

    // -------------------------------------------------- customers, invoices

    async fn upsert_customer(&self, user_id: Uuid, profile: &CustomerProfile)
        -> StoreResult<Customer>;

    async fn find_customer_by_user(&self, user_id: Uuid) -> StoreResult<Option<Customer>>;

    async fn find_customer_by_external_id(
        &self,
        external_customer_id: &str,
    ) -> StoreResult<Option<Customer>>;

    /// Upsert by external invoice id. A paid invoice adds its amount to the
    /// customer's lifetime spend once, no matter how often it is recorded.
    async fn record_invoice(&self, invoice: &InvoiceUpsert) -> StoreResult<InvoiceRecorded>;

    async fn find_invoice(&self, external_invoice_id: &str) -> StoreResult<Option<Invoice>>;

    // ------------------------------------------------------ webhook journal

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<WebhookClaim>;

    /// Close a claimed delivery as processed (`error` is `None`) or failed
    async fn finish_webhook_event(&self, event_id: &str, error: Option<&str>) -> StoreResult<()>;

    async fn get_webhook_event(&self, event_id: &str) -> StoreResult<Option<WebhookEventRecord>>;

    async fn list_failed_webhook_events(&self, limit: i64)
        -> StoreResult<Vec<WebhookEventRecord>>;

    // ----------------------------------------------------------- invariants

    async fn find_marker_conflicts(&self) -> StoreResult<Vec<MarkerConflict>>;

    async fn find_completed_checkouts_without_subscription(&self) -> StoreResult<Vec<String>>;

    async fn find_current_subscriptions_on_archived_plans(&self) -> StoreResult<Vec<Uuid>>;
}
