//! Stripe webhook handling
//!
//! Deliveries are verified, parsed into a [`PaymentEvent`] and journaled
//! before any state changes. The journal claim is atomic, so a redelivered
//! event that was already processed is skipped, while a failed one is
//! processed again.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;
use wizpix_shared::models::{
    CheckoutSettlement, InvoiceStatus, InvoiceUpsert, NewCheckoutSession, SettlementOutcome,
    Subscription, SubscriptionPatch, SubscriptionStatus, WebhookClaim, WebhookEventRecord,
    WebhookEventStatus,
};
use wizpix_shared::Store;

use crate::checkout::CheckoutStateMachine;
use crate::client::PaymentGateway;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutCompleted, CheckoutFailed, EventEnvelope, InvoiceNotice, PaymentEvent,
    SubscriptionCanceled,
};
use crate::subscriptions::SubscriptionRepository;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Already processed or being processed elsewhere
    Skipped(WebhookEventStatus),
    /// Journaled as failed; can be replayed
    Failed(String),
}

/// Compute the `v1` signature for a payload signed at `timestamp`
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".into()))?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a `t=...,v1=...` signature header against the raw payload
pub fn verify_signature(
    secret: &str,
    payload: &str,
    header: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => candidates.push(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in webhook signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in webhook signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook signature timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = sign_payload(secret, timestamp, payload)?;
    let matched = candidates
        .iter()
        .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())));
    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// Webhook handler for payment processor events
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn Store>,
    subscriptions: SubscriptionRepository,
    sessions: CheckoutStateMachine,
    gateway: Arc<dyn PaymentGateway>,
    webhook_secret: Option<String>,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn Store>,
        subscriptions: SubscriptionRepository,
        sessions: CheckoutStateMachine,
        gateway: Arc<dyn PaymentGateway>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            store,
            subscriptions,
            sessions,
            gateway,
            webhook_secret,
        }
    }

    /// Verify (when a secret is configured) and parse a raw delivery
    pub fn verify_event(
        &self,
        payload: &str,
        signature: Option<&str>,
    ) -> BillingResult<EventEnvelope> {
        if let Some(secret) = &self.webhook_secret {
            let header = signature.ok_or_else(|| {
                tracing::warn!("Webhook delivery without signature header");
                BillingError::WebhookSignatureInvalid
            })?;
            verify_signature(
                secret,
                payload,
                header,
                OffsetDateTime::now_utc().unix_timestamp(),
            )?;
        }

        let envelope = EventEnvelope::parse(payload)?;
        tracing::debug!(
            event_id = %envelope.id,
            event_type = %envelope.kind,
            "Webhook event parsed"
        );
        Ok(envelope)
    }

    /// Journal and process one delivery
    ///
    /// Returns an error only when the delivery could not be journaled.
    /// Processing failures are recorded and reported as [`WebhookOutcome::Failed`].
    pub async fn handle(&self, envelope: &EventEnvelope) -> BillingResult<WebhookOutcome> {
        let claim = self
            .store
            .claim_webhook_event(&envelope.id, &envelope.kind, &envelope.payload)
            .await
            .map_err(|e| {
                tracing::error!(
                    event_id = %envelope.id,
                    error = %e,
                    "Failed to claim webhook event for processing"
                );
                BillingError::from(e)
            })?;

        if let WebhookClaim::Duplicate(status) = claim {
            tracing::info!(
                event_id = %envelope.id,
                event_type = %envelope.kind,
                status = %status.as_str(),
                "Duplicate webhook event skipped"
            );
            return Ok(WebhookOutcome::Skipped(status));
        }

        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.kind,
            "Processing webhook event"
        );

        let result = self.process(&envelope.event).await;
        let error_message = result.as_ref().err().map(ToString::to_string);
        self.finish(&envelope.id, error_message.as_deref()).await;

        match result {
            Ok(()) => Ok(WebhookOutcome::Processed),
            Err(e) => {
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.kind,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Webhook event processing failed"
                );
                Ok(WebhookOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Failed deliveries, newest first
    pub async fn list_failed(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        Ok(self.store.list_failed_webhook_events(limit).await?)
    }

    /// Re-run a journaled event from its stored payload
    pub async fn replay(&self, event_id: &str) -> BillingResult<WebhookOutcome> {
        let record = self
            .store
            .get_webhook_event(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {event_id}")))?;

        if record.status == WebhookEventStatus::Processed {
            return Ok(WebhookOutcome::Skipped(record.status));
        }

        let envelope = EventEnvelope::from_value(record.payload)?;
        tracing::info!(event_id = %event_id, attempts = record.attempts, "Replaying webhook event");
        self.handle(&envelope).await
    }

    async fn finish(&self, event_id: &str, error: Option<&str>) {
        let Err(first) = self.store.finish_webhook_event(event_id, error).await else {
            return;
        };
        tracing::warn!(
            event_id = %event_id,
            error = %first,
            "First attempt to close webhook event failed, retrying"
        );
        if let Err(retry) = self.store.finish_webhook_event(event_id, error).await {
            tracing::error!(
                event_id = %event_id,
                first_error = %first,
                retry_error = %retry,
                "Failed to close webhook event after retry; it stays in processing until reclaimed"
            );
        }
    }

    async fn process(&self, event: &PaymentEvent) -> BillingResult<()> {
        match event {
            PaymentEvent::CheckoutCompleted(completed) => {
                self.handle_checkout_completed(completed).await
            }
            PaymentEvent::CheckoutFailed(failed) => self.handle_checkout_failed(failed).await,
            PaymentEvent::InvoicePaid(notice) => self.handle_invoice_paid(notice).await,
            PaymentEvent::InvoicePaymentFailed(notice) => {
                self.handle_invoice_payment_failed(notice).await
            }
            PaymentEvent::SubscriptionCanceled(canceled) => {
                self.handle_subscription_canceled(canceled).await
            }
            PaymentEvent::Unknown => {
                tracing::info!("Unhandled webhook event type accepted");
                Ok(())
            }
        }
    }

    async fn handle_checkout_completed(&self, event: &CheckoutCompleted) -> BillingResult<()> {
        let existing = self.sessions.get(&event.session_id).await?;
        if let Some(state) = existing.as_ref().filter(|s| s.status.is_terminal()) {
            tracing::info!(
                session_id = %state.session_id,
                status = %state.status,
                "Checkout session already terminal, skipping"
            );
            return Ok(());
        }

        let email = event
            .email
            .clone()
            .or_else(|| existing.as_ref().map(|s| s.email.clone()))
            .filter(|e| !e.is_empty());
        let plan_code = event
            .plan_code
            .clone()
            .or_else(|| existing.as_ref().map(|s| s.plan_code.clone()))
            .filter(|p| !p.is_empty());

        let (Some(email), Some(plan_code)) = (email, plan_code) else {
            if existing.is_some() {
                self.sessions
                    .fail(&event.session_id, "missing email or plan")
                    .await?;
            }
            return Err(BillingError::InvalidPayload(format!(
                "checkout session {} has no email or plan",
                event.session_id
            )));
        };

        let plan = match self.subscriptions.ensure_plan(&plan_code).await {
            Ok(plan) => plan,
            Err(BillingError::PlanNotFound(code)) => {
                self.sessions
                    .get_or_create(&event.session_id, &email, &code, event.currency)
                    .await?;
                self.sessions
                    .fail(&event.session_id, &format!("unknown plan '{code}'"))
                    .await?;
                return Err(BillingError::PlanNotFound(code));
            }
            Err(e) => return Err(e),
        };

        let period = match &event.external_subscription_id {
            Some(id) => match self.gateway.subscription_period(id).await {
                Ok(period) => period,
                Err(e) => {
                    tracing::warn!(
                        external_subscription_id = %id,
                        error = %e,
                        "Could not fetch subscription period, using default cycle"
                    );
                    None
                }
            },
            None => None,
        };

        let settlement = CheckoutSettlement {
            session: NewCheckoutSession {
                session_id: event.session_id.clone(),
                email: email.clone(),
                plan_code: plan.code.clone(),
                currency: event.currency.as_str().to_string(),
            },
            plan_id: plan.id,
            credit_initial: plan.daily_credit_quota,
            period,
            external_customer_id: event.external_customer_id.clone(),
            external_subscription_id: event.external_subscription_id.clone(),
            profile: event.profile.clone(),
        };

        match self.store.settle_checkout(&settlement).await? {
            SettlementOutcome::Completed(state) => {
                tracing::info!(
                    session_id = %state.session_id,
                    user_id = ?state.user_id,
                    subscription_id = ?state.subscription_id,
                    plan_code = %plan.code,
                    "Checkout completed, subscription activated"
                );
                Ok(())
            }
            SettlementOutcome::AlreadyTerminal(state) => {
                tracing::info!(
                    session_id = %state.session_id,
                    status = %state.status,
                    "Checkout settled concurrently, nothing to do"
                );
                Ok(())
            }
            SettlementOutcome::NoVerifiedSignup => {
                tracing::warn!(
                    session_id = %event.session_id,
                    "Checkout completed for an email without account or verified signup"
                );
                Err(BillingError::NoVerifiedSignup(email))
            }
        }
    }

    async fn handle_checkout_failed(&self, event: &CheckoutFailed) -> BillingResult<()> {
        match self.sessions.fail(&event.session_id, &event.reason).await {
            Ok(_) => Ok(()),
            Err(BillingError::NotFound(_)) => {
                tracing::info!(
                    session_id = %event.session_id,
                    "Failure event for unknown checkout session ignored"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Owning user and subscription of an invoice
    async fn resolve_invoice_owner(
        &self,
        notice: &InvoiceNotice,
    ) -> BillingResult<Option<(Uuid, Option<Subscription>)>> {
        let mut subscription = match &notice.external_subscription_id {
            Some(id) => self.subscriptions.find_by_external_subscription(id).await?,
            None => None,
        };

        let Some(customer_id) = &notice.external_customer_id else {
            return Ok(subscription.map(|s| (s.user_id, Some(s))));
        };

        if let Some(customer) = self.store.find_customer_by_external_id(customer_id).await? {
            return Ok(Some((customer.user_id, subscription)));
        }

        if subscription.is_none() {
            subscription = self.subscriptions.find_by_external_customer(customer_id).await?;
        }
        Ok(subscription.map(|s| (s.user_id, Some(s))))
    }

    fn invoice_upsert(
        notice: &InvoiceNotice,
        user_id: Uuid,
        subscription: Option<&Subscription>,
        status: InvoiceStatus,
    ) -> InvoiceUpsert {
        InvoiceUpsert {
            external_invoice_id: notice.invoice_id.clone(),
            user_id,
            subscription_id: subscription.map(|s| s.id),
            plan_id: subscription.map(|s| s.plan_id),
            external_payment_intent_id: notice.payment_intent_id.clone(),
            amount_due_cents: notice.amount_due_cents,
            amount_paid_cents: notice.amount_paid_cents,
            currency: notice.currency.clone(),
            status,
            hosted_invoice_url: notice.hosted_invoice_url.clone(),
            invoice_pdf: notice.invoice_pdf.clone(),
            period_start: notice.period_start,
            period_end: notice.period_end,
            issued_at: notice.issued_at,
        }
    }

    async fn handle_invoice_paid(&self, notice: &InvoiceNotice) -> BillingResult<()> {
        let Some((user_id, subscription)) = self.resolve_invoice_owner(notice).await? else {
            tracing::warn!(
                invoice_id = %notice.invoice_id,
                external_customer_id = ?notice.external_customer_id,
                "Paid invoice for a customer not known yet, left for redelivery"
            );
            return Err(BillingError::InvoiceOwnerUnknown(notice.invoice_id.clone()));
        };

        let recorded = self
            .store
            .record_invoice(&Self::invoice_upsert(
                notice,
                user_id,
                subscription.as_ref(),
                InvoiceStatus::Paid,
            ))
            .await?;

        tracing::info!(
            invoice_id = %notice.invoice_id,
            user_id = %user_id,
            amount_paid_cents = notice.amount_paid_cents,
            spend_added = recorded.spend_added,
            "Invoice paid"
        );

        if let Some(sub) = subscription {
            let recovering = matches!(
                sub.status,
                SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid
            );
            if recovering && sub.is_active {
                self.subscriptions
                    .update_subscription(
                        sub.id,
                        &SubscriptionPatch {
                            status: Some(SubscriptionStatus::Active),
                            period_start: notice.period_start,
                            period_end: notice.period_end,
                            ..Default::default()
                        },
                    )
                    .await?;
                tracing::info!(subscription_id = %sub.id, "Subscription recovered after payment");
            }
        }
        Ok(())
    }

    async fn handle_invoice_payment_failed(&self, notice: &InvoiceNotice) -> BillingResult<()> {
        let Some((user_id, subscription)) = self.resolve_invoice_owner(notice).await? else {
            tracing::warn!(
                invoice_id = %notice.invoice_id,
                external_customer_id = ?notice.external_customer_id,
                "Failed invoice for a customer not known yet, left for redelivery"
            );
            return Err(BillingError::InvoiceOwnerUnknown(notice.invoice_id.clone()));
        };

        self.store
            .record_invoice(&Self::invoice_upsert(
                notice,
                user_id,
                subscription.as_ref(),
                InvoiceStatus::Unpaid,
            ))
            .await?;

        if let Some(sub) = subscription.filter(|s| !s.status.is_terminal()) {
            self.subscriptions
                .update_subscription(
                    sub.id,
                    &SubscriptionPatch {
                        status: Some(SubscriptionStatus::PastDue),
                        ..Default::default()
                    },
                )
                .await?;
            tracing::warn!(
                subscription_id = %sub.id,
                invoice_id = %notice.invoice_id,
                "Invoice payment failed, subscription past due"
            );
        }
        Ok(())
    }

    async fn handle_subscription_canceled(&self, event: &SubscriptionCanceled) -> BillingResult<()> {
        let Some(sub) = self
            .subscriptions
            .find_by_external_subscription(&event.external_subscription_id)
            .await?
        else {
            tracing::info!(
                external_subscription_id = %event.external_subscription_id,
                "Cancellation for unknown subscription ignored"
            );
            return Ok(());
        };

        if sub.status == SubscriptionStatus::Canceled && !sub.is_active {
            return Ok(());
        }

        self.subscriptions
            .cancel(sub.id, event.canceled_at, event.period_end)
            .await?;
        tracing::info!(
            subscription_id = %sub.id,
            user_id = %sub.user_id,
            "Subscription canceled"
        );
        Ok(())
    }
}
