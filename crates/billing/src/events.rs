//! Payment lifecycle events
//!
//! Incoming webhook payloads are parsed into a closed set of variants. Only
//! the fields the engine acts on are read; everything else in the processor's
//! object is ignored.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;
use wizpix_shared::models::{normalize_email, CustomerProfile};

use crate::error::{BillingError, BillingResult};
use crate::plans::Currency;

/// A verified, parsed delivery
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub id: String,
    pub kind: String,
    pub created: Option<OffsetDateTime>,
    pub event: PaymentEvent,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    CheckoutCompleted(CheckoutCompleted),
    /// The hosted checkout expired or its delayed payment failed
    CheckoutFailed(CheckoutFailed),
    InvoicePaid(InvoiceNotice),
    InvoicePaymentFailed(InvoiceNotice),
    SubscriptionCanceled(SubscriptionCanceled),
    /// Accepted and ignored
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompleted {
    pub session_id: String,
    pub email: Option<String>,
    pub plan_code: Option<String>,
    pub currency: Currency,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub profile: CustomerProfile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutFailed {
    pub session_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceNotice {
    pub invoice_id: String,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub issued_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionCanceled {
    pub external_subscription_id: String,
    pub canceled_at: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    created: Option<i64>,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// A reference the processor sends either as a bare id or as an expanded object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object {
        id: String,
        #[serde(default)]
        email: Option<String>,
    },
}

impl Expandable {
    fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object { id, .. } => id,
        }
    }

    fn email(&self) -> Option<&str> {
        match self {
            Expandable::Id(_) => None,
            Expandable::Object { email, .. } => email.as_deref(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawAddress {
    line1: Option<String>,
    line2: Option<String>,
    postal_code: Option<String>,
    city: Option<String>,
    country: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCustomerDetails {
    email: Option<String>,
    name: Option<String>,
    phone: Option<String>,
    address: Option<RawAddress>,
}

#[derive(Debug, Deserialize)]
struct RawCheckoutSession {
    id: String,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    customer_details: Option<RawCustomerDetails>,
    #[serde(default)]
    customer: Option<Expandable>,
    #[serde(default)]
    subscription: Option<Expandable>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStatusTransitions {
    paid_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawInvoice {
    id: String,
    #[serde(default)]
    customer: Option<Expandable>,
    #[serde(default)]
    subscription: Option<Expandable>,
    #[serde(default)]
    payment_intent: Option<Expandable>,
    #[serde(default)]
    amount_due: Option<i64>,
    #[serde(default)]
    amount_paid: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    hosted_invoice_url: Option<String>,
    #[serde(default)]
    invoice_pdf: Option<String>,
    #[serde(default)]
    period_start: Option<i64>,
    #[serde(default)]
    period_end: Option<i64>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    status_transitions: Option<RawStatusTransitions>,
}

#[derive(Debug, Deserialize)]
struct RawSubscription {
    id: String,
    #[serde(default)]
    canceled_at: Option<i64>,
    #[serde(default)]
    ended_at: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
}

fn timestamp(value: Option<i64>) -> Option<OffsetDateTime> {
    value.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn object<T: serde::de::DeserializeOwned>(kind: &str, value: serde_json::Value) -> BillingResult<T> {
    serde_json::from_value(value)
        .map_err(|e| BillingError::InvalidPayload(format!("{kind} object: {e}")))
}

impl CheckoutCompleted {
    fn from_raw(raw: RawCheckoutSession) -> Self {
        let metadata = raw.metadata.unwrap_or_default();
        let details = raw.customer_details.unwrap_or_default();

        let email = non_empty(details.email.clone())
            .or_else(|| non_empty(raw.customer_email.clone()))
            .or_else(|| non_empty(raw.customer.as_ref().and_then(|c| c.email()).map(str::to_string)))
            .or_else(|| non_empty(metadata.get("email").cloned()))
            .map(|e| normalize_email(&e));

        let plan_code = non_empty(
            metadata
                .get("plan_code")
                .or_else(|| metadata.get("planCode"))
                .cloned(),
        )
        .map(|p| p.to_ascii_lowercase());

        let currency = Currency::parse_or_default(
            metadata
                .get("currency")
                .map(String::as_str)
                .or(raw.currency.as_deref()),
        );

        let external_customer_id = raw.customer.as_ref().map(|c| c.id().to_string());

        let (first_name, last_name) = match details.name.as_deref().map(str::trim) {
            Some(full) if !full.is_empty() => {
                let mut parts = full.split_whitespace();
                let first = parts.next().map(str::to_string);
                let rest = parts.collect::<Vec<_>>().join(" ");
                (first, Some(rest).filter(|r| !r.is_empty()))
            }
            _ => (None, None),
        };
        let address = details.address.unwrap_or_default();

        Self {
            session_id: raw.id,
            email,
            plan_code,
            currency,
            external_customer_id: external_customer_id.clone(),
            external_subscription_id: raw.subscription.as_ref().map(|s| s.id().to_string()),
            profile: CustomerProfile {
                external_customer_id,
                first_name,
                last_name,
                phone: non_empty(details.phone),
                address_line1: non_empty(address.line1),
                address_line2: non_empty(address.line2),
                postal_code: non_empty(address.postal_code),
                city: non_empty(address.city),
                country: non_empty(address.country),
            },
        }
    }
}

impl InvoiceNotice {
    fn from_raw(raw: RawInvoice) -> Self {
        let amount_paid = raw.amount_paid.unwrap_or(0);
        let paid_at = raw.status_transitions.and_then(|s| s.paid_at);
        Self {
            invoice_id: raw.id,
            external_customer_id: raw.customer.as_ref().map(|c| c.id().to_string()),
            external_subscription_id: raw.subscription.as_ref().map(|s| s.id().to_string()),
            payment_intent_id: raw.payment_intent.as_ref().map(|p| p.id().to_string()),
            amount_due_cents: raw.amount_due.unwrap_or(amount_paid),
            amount_paid_cents: amount_paid,
            currency: non_empty(raw.currency)
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or_else(|| Currency::Chf.as_str().to_string()),
            hosted_invoice_url: non_empty(raw.hosted_invoice_url),
            invoice_pdf: non_empty(raw.invoice_pdf),
            period_start: timestamp(raw.period_start),
            period_end: timestamp(raw.period_end),
            issued_at: timestamp(paid_at.or(raw.created)),
        }
    }
}

impl EventEnvelope {
    /// Parse a raw delivery body
    pub fn parse(payload: &str) -> BillingResult<Self> {
        let value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;
        Self::from_value(value)
    }

    /// Parse a delivery already decoded as JSON, e.g. a stored journal payload
    pub fn from_value(payload: serde_json::Value) -> BillingResult<Self> {
        let raw: RawEvent = serde_json::from_value(payload.clone())
            .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;

        if raw.id.trim().is_empty() {
            return Err(BillingError::InvalidPayload("event id is empty".into()));
        }

        let object_value = raw.data.object;
        let event = match raw.kind.as_str() {
            "checkout.session.completed" => PaymentEvent::CheckoutCompleted(
                CheckoutCompleted::from_raw(object(&raw.kind, object_value)?),
            ),
            "checkout.session.expired" | "checkout.session.async_payment_failed" => {
                let session: RawCheckoutSession = object(&raw.kind, object_value)?;
                PaymentEvent::CheckoutFailed(CheckoutFailed {
                    session_id: session.id,
                    reason: if raw.kind == "checkout.session.expired" {
                        "expired".to_string()
                    } else {
                        "payment_failed".to_string()
                    },
                })
            }
            "invoice.paid" => {
                PaymentEvent::InvoicePaid(InvoiceNotice::from_raw(object(&raw.kind, object_value)?))
            }
            "invoice.payment_failed" => PaymentEvent::InvoicePaymentFailed(
                InvoiceNotice::from_raw(object(&raw.kind, object_value)?),
            ),
            "customer.subscription.deleted" => {
                let sub: RawSubscription = object(&raw.kind, object_value)?;
                PaymentEvent::SubscriptionCanceled(SubscriptionCanceled {
                    external_subscription_id: sub.id,
                    canceled_at: timestamp(sub.canceled_at.or(sub.ended_at)),
                    period_end: timestamp(sub.current_period_end),
                })
            }
            _ => PaymentEvent::Unknown,
        };

        Ok(Self {
            id: raw.id,
            kind: raw.kind,
            created: timestamp(raw.created),
            event,
            payload,
        })
    }
}
