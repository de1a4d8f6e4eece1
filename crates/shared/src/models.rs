//! Domain records persisted by the billing and entitlement engine

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::StoreError;

/// Length of a billing cycle when the payment processor does not supply one
pub const DEFAULT_CYCLE_DAYS: i64 = 30;

/// Normalize an email for lookups and uniqueness
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// =============================================================================
// Users
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A signup whose email was verified but has no account yet
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SignupVerification {
    pub email: String,
    pub password_hash: String,
    pub verified_at: Option<OffsetDateTime>,
    pub account_created: bool,
}

// =============================================================================
// Plans
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub billing_interval: String,
    pub daily_credit_quota: i32,
    pub external_price_id: Option<String>,
    pub is_archived: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Definition used to create or correct a plan row by code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSpec {
    pub code: String,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub billing_interval: String,
    pub daily_credit_quota: i32,
    pub external_price_id: Option<String>,
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Paused,
    Incomplete,
    IncompleteExpired,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Paused => "paused",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }

    /// Statuses after which a subscription can never be current again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::Expired | Self::IncompleteExpired
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "unpaid" => Ok(Self::Unpaid),
            "paused" => Ok(Self::Paused),
            "incomplete" => Ok(Self::Incomplete),
            "incomplete_expired" => Ok(Self::IncompleteExpired),
            "canceled" => Ok(Self::Canceled),
            "expired" => Ok(Self::Expired),
            other => Err(StoreError::Corrupt(format!(
                "unknown subscription status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    /// Current-subscription marker; at most one row per user carries it
    pub is_active: bool,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub credit_initial: i32,
    pub credit_used: i32,
    pub canceled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Billing cycle bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl BillingPeriod {
    /// A default-length cycle starting at `start`
    pub fn starting_at(start: OffsetDateTime) -> Self {
        Self {
            start,
            end: start + time::Duration::days(DEFAULT_CYCLE_DAYS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub is_active: bool,
    pub status: SubscriptionStatus,
    pub credit_initial: i32,
    /// Cycle to stamp when activating; a default cycle from now is used when absent
    pub period: Option<BillingPeriod>,
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
}

impl NewSubscription {
    pub fn active(user_id: Uuid, plan_id: Uuid) -> Self {
        Self {
            user_id,
            plan_id,
            is_active: true,
            status: SubscriptionStatus::Active,
            credit_initial: 0,
            period: None,
            external_subscription_id: None,
            external_customer_id: None,
        }
    }
}

/// Partial update applied to a subscription row; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPatch {
    pub status: Option<SubscriptionStatus>,
    pub clear_active: bool,
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
}

impl SubscriptionPatch {
    /// Whether the patch removes the current-subscription marker
    pub fn clears_marker(&self) -> bool {
        self.clear_active || self.status.is_some_and(|s| s.is_terminal())
    }
}

// =============================================================================
// Credit ledger
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CreditUsage {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub used: i32,
    pub reason: String,
    pub request_ref: Option<String>,
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCreditUsage {
    pub subscription_id: Uuid,
    pub used: i32,
    pub reason: String,
    pub request_ref: Option<String>,
}

/// Outcome of a serialized check-then-append
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardedAppend {
    Appended(CreditUsage),
    /// The append would exceed the quota; carries the amount already used
    Rejected { used: i64 },
}

// =============================================================================
// Refresh tokens
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RefreshTokenRecord {
    pub jti: String,
    pub user_id: Uuid,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub parent_jti: Option<String>,
    pub replaced_by: Option<String>,
    pub revoked_at: Option<OffsetDateTime>,
    pub revocation_reason: Option<String>,
}

impl RefreshTokenRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRefreshToken {
    pub jti: String,
    pub user_id: Uuid,
    pub expires_at: OffsetDateTime,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    Rotated(RefreshTokenRecord),
    AlreadyRevoked(RefreshTokenRecord),
    NotFound,
}

// =============================================================================
// Checkout sessions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    Pending,
    Completed,
    Failed,
}

impl CheckoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for CheckoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckoutStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Corrupt(format!(
                "unknown checkout status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutSessionState {
    pub session_id: String,
    pub email: String,
    pub plan_code: String,
    pub currency: String,
    pub status: CheckoutStatus,
    pub user_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub consumed_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCheckoutSession {
    pub session_id: String,
    pub email: String,
    pub plan_code: String,
    pub currency: String,
}

/// Identities stamped on a session when it completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutRefs {
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub plan_id: Uuid,
}

/// Everything needed to settle a completed checkout in one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSettlement {
    pub session: NewCheckoutSession,
    pub plan_id: Uuid,
    pub credit_initial: i32,
    pub period: Option<BillingPeriod>,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub profile: CustomerProfile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// The session moved to completed in this call
    Completed(CheckoutSessionState),
    /// The session was already terminal; nothing changed
    AlreadyTerminal(CheckoutSessionState),
    /// No account exists and no verified signup can back one
    NoVerifiedSignup,
}

// =============================================================================
// Customers & invoices
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerProfile {
    pub external_customer_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub external_customer_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub total_spent_cents: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Paid,
    Unpaid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Unpaid => "unpaid",
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paid" => Ok(Self::Paid),
            "unpaid" => Ok(Self::Unpaid),
            other => Err(StoreError::Corrupt(format!(
                "unknown invoice status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invoice {
    pub id: Uuid,
    pub external_invoice_id: String,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub external_payment_intent_id: Option<String>,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub issued_at: Option<OffsetDateTime>,
    pub spend_recorded: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceUpsert {
    pub external_invoice_id: String,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub external_payment_intent_id: Option<String>,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub issued_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRecorded {
    pub invoice: Invoice,
    /// True when this call added the paid amount to the customer's lifetime spend
    pub spend_added: bool,
}

// =============================================================================
// Webhook journal
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Processing,
    Processed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for WebhookEventStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Corrupt(format!(
                "unknown webhook event status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: WebhookEventStatus,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

/// Result of trying to take ownership of an incoming delivery
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookClaim {
    /// First delivery, or a retry of a failed one
    Claimed,
    /// Already processed, or another worker is on it
    Duplicate(WebhookEventStatus),
}

// =============================================================================
// Invariants
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerConflict {
    pub user_id: Uuid,
    pub active_count: i64,
}
