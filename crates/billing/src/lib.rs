// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Wizpix Billing Module
//!
//! Keeps subscription state, payment events and rolling credit consumption
//! consistent under concurrent and replayed payment processor deliveries.
//!
//! ## Features
//!
//! - **Plan Catalog**: Static plan definitions, lazily provisioned in the store
//! - **Subscriptions**: One current subscription per user, lifecycle transitions
//! - **Credit Ledger**: Append-only usage with a rolling 24h quota
//! - **Checkout**: Hosted checkout creation and an idempotent session state machine
//! - **Webhooks**: Verified, journaled and replayable payment events
//! - **Invariants**: Read-only consistency checks

pub mod checkout;
pub mod client;
pub mod credits;
pub mod error;
pub mod events;
pub mod invariants;
pub mod plans;
pub mod subscriptions;
pub mod webhooks;


use std::sync::Arc;

use wizpix_shared::Store;

// Checkout
pub use checkout::{CheckoutService, CheckoutStarted, CheckoutStateMachine};

// Client
pub use client::{
    CheckoutRequest, CreatedCheckout, DisabledGateway, PaymentGateway, StripeConfig,
    StripeGateway,
};

// Credits
pub use credits::{ConsumeOutcome, CreditLedger, QuotaEnforcement, UsageWindow, USAGE_WINDOW};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventEnvelope, PaymentEvent};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Plans
pub use plans::{Currency, PlanCatalog, PlanDefinition, PlanPrices};

// Subscriptions
pub use subscriptions::SubscriptionRepository;

// Webhooks
pub use webhooks::{sign_payload, verify_signature, WebhookHandler, WebhookOutcome};

/// Settings that are not owned by the payment processor client
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub quota_enforcement: QuotaEnforcement,
    /// Base URL checkout redirects return to
    pub frontend_url: String,
    pub webhook_secret: Option<String>,
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub catalog: Arc<PlanCatalog>,
    pub subscriptions: SubscriptionRepository,
    pub credits: CreditLedger,
    pub sessions: CheckoutStateMachine,
    pub checkout: CheckoutService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a billing service from environment variables
    ///
    /// With `enabled` unset no payment processor calls are made; webhooks are
    /// still accepted so a deployment can drain in-flight deliveries.
    pub fn from_env(
        store: Arc<dyn Store>,
        enabled: bool,
        quota_enforcement: QuotaEnforcement,
        frontend_url: &str,
    ) -> BillingResult<Self> {
        let catalog = PlanCatalog::from_env();

        let (gateway, webhook_secret): (Arc<dyn PaymentGateway>, Option<String>) = if enabled {
            let stripe = StripeConfig::from_env()?;
            let secret = stripe.webhook_secret.clone();
            (Arc::new(StripeGateway::new(stripe)), secret)
        } else {
            tracing::warn!("Billing disabled, payment processor calls will be rejected");
            let secret = std::env::var("STRIPE_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty());
            (Arc::new(DisabledGateway), secret)
        };

        if webhook_secret.is_none() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set, webhook signatures are not verified");
        }

        Ok(Self::new(
            store,
            gateway,
            catalog,
            BillingConfig {
                quota_enforcement,
                frontend_url: frontend_url.to_string(),
                webhook_secret,
            },
        ))
    }

    /// Create a billing service with an explicit gateway and catalog
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: PlanCatalog,
        config: BillingConfig,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let subscriptions = SubscriptionRepository::new(store.clone(), catalog.clone());
        let sessions = CheckoutStateMachine::new(store.clone());

        Self {
            credits: CreditLedger::new(store.clone(), config.quota_enforcement),
            checkout: CheckoutService::new(
                gateway.clone(),
                catalog.clone(),
                sessions.clone(),
                config.frontend_url,
            ),
            webhooks: WebhookHandler::new(
                store.clone(),
                subscriptions.clone(),
                sessions.clone(),
                gateway,
                config.webhook_secret,
            ),
            invariants: InvariantChecker::new(store),
            catalog,
            subscriptions,
            sessions,
        }
    }
}
