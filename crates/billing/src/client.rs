//! Payment processor client
//!
//! Every outbound call carries a timeout and is retried with jittered
//! exponential backoff a bounded number of times.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    CheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, RequestStrategy, StripeError, SubscriptionId,
};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use wizpix_shared::models::BillingPeriod;

use crate::error::{BillingError, BillingResult};

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// When absent, webhook payloads are accepted without signature verification
    pub webhook_secret: Option<String>,
    pub api_timeout: Duration,
    pub max_retries: usize,
}

impl StripeConfig {
    /// Load from `STRIPE_*` environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".into()))?;

        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let api_timeout = std::env::var("STRIPE_API_TIMEOUT_SECS")
            .ok()
            .map(|v| {
                v.parse::<u64>().map_err(|_| {
                    BillingError::Config(format!("STRIPE_API_TIMEOUT_SECS is not a number: {v}"))
                })
            })
            .transpose()?
            .unwrap_or(10);

        let max_retries = std::env::var("STRIPE_MAX_RETRIES")
            .ok()
            .map(|v| {
                v.parse::<usize>().map_err(|_| {
                    BillingError::Config(format!("STRIPE_MAX_RETRIES is not a number: {v}"))
                })
            })
            .transpose()?
            .unwrap_or(3);

        Ok(Self {
            secret_key,
            webhook_secret,
            api_timeout: Duration::from_secs(api_timeout),
            max_retries,
        })
    }
}

/// Parameters of a hosted subscription checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub email: String,
    pub price_id: String,
    pub metadata: HashMap<String, String>,
    pub success_url: String,
    pub cancel_url: String,
    /// Sent as the processor's idempotency key; fixed across retries of one request
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedCheckout {
    pub session_id: String,
    pub url: String,
}

/// Outbound operations against the payment processor
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CreatedCheckout>;

    /// Current billing cycle of an external subscription, if the processor reports one
    async fn subscription_period(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<BillingPeriod>>;
}

/// Stripe-backed payment gateway
pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.config.max_retries)
    }

    async fn create_once(&self, request: &CheckoutRequest) -> BillingResult<CreatedCheckout> {
        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.customer_email = Some(&request.email);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.metadata = Some(request.metadata.clone());
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);

        let client = self
            .client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(request.idempotency_key.clone()));
        let session = tokio::time::timeout(
            self.config.api_timeout,
            CheckoutSession::create(&client, params),
        )
        .await
        .map_err(|_| BillingError::ExternalService("checkout session creation timed out".into()))?
        .map_err(classify_stripe_error)?;

        let url = session
            .url
            .ok_or_else(|| BillingError::StripeApi("checkout session has no redirect url".into()))?;

        Ok(CreatedCheckout {
            session_id: session.id.to_string(),
            url,
        })
    }

    async fn period_once(&self, id: &SubscriptionId) -> BillingResult<Option<BillingPeriod>> {
        let subscription = tokio::time::timeout(
            self.config.api_timeout,
            stripe::Subscription::retrieve(&self.client, id, &[]),
        )
        .await
        .map_err(|_| BillingError::ExternalService("subscription lookup timed out".into()))?
        .map_err(classify_stripe_error)?;

        let start = OffsetDateTime::from_unix_timestamp(subscription.current_period_start).ok();
        let end = OffsetDateTime::from_unix_timestamp(subscription.current_period_end).ok();
        Ok(match (start, end) {
            (Some(start), Some(end)) if end > start => Some(BillingPeriod { start, end }),
            _ => None,
        })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CreatedCheckout> {
        let created = RetryIf::spawn(
            self.retry_strategy(),
            || self.create_once(request),
            |e: &BillingError| e.is_retryable(),
        )
        .await?;

        tracing::info!(session_id = %created.session_id, "Checkout session created");
        Ok(created)
    }

    async fn subscription_period(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<BillingPeriod>> {
        let id: SubscriptionId = external_subscription_id.parse().map_err(|_| {
            BillingError::InvalidInput(format!(
                "invalid subscription id '{external_subscription_id}'"
            ))
        })?;

        RetryIf::spawn(
            self.retry_strategy(),
            || self.period_once(&id),
            |e: &BillingError| e.is_retryable(),
        )
        .await
    }
}

/// Gateway used when billing is disabled; it never reaches the network
pub struct DisabledGateway;

#[async_trait]
impl PaymentGateway for DisabledGateway {
    async fn create_checkout_session(
        &self,
        _request: &CheckoutRequest,
    ) -> BillingResult<CreatedCheckout> {
        Err(BillingError::Config("billing is disabled".into()))
    }

    async fn subscription_period(
        &self,
        _external_subscription_id: &str,
    ) -> BillingResult<Option<BillingPeriod>> {
        Ok(None)
    }
}

/// 4xx answers other than rate limiting are permanent
fn classify_stripe_error(e: StripeError) -> BillingError {
    match &e {
        StripeError::Stripe(request) if (400..500).contains(&request.http_status)
            && request.http_status != 429 =>
        {
            BillingError::StripeApi(e.to_string())
        }
        _ => BillingError::ExternalService(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_defaults() {
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        std::env::remove_var("STRIPE_WEBHOOK_SECRET");
        std::env::remove_var("STRIPE_API_TIMEOUT_SECS");
        std::env::remove_var("STRIPE_MAX_RETRIES");

        let config = StripeConfig::from_env().unwrap();
        std::env::remove_var("STRIPE_SECRET_KEY");

        assert_eq!(config.webhook_secret, None);
        assert_eq!(config.api_timeout, Duration::from_secs(10));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    #[serial]
    fn test_config_rejects_bad_timeout() {
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        std::env::set_var("STRIPE_API_TIMEOUT_SECS", "soon");

        let result = StripeConfig::from_env();
        std::env::remove_var("STRIPE_SECRET_KEY");
        std::env::remove_var("STRIPE_API_TIMEOUT_SECS");

        assert!(matches!(result, Err(BillingError::Config(_))));
    }

    #[test]
    fn test_retry_strategy_is_bounded() {
        let gateway = StripeGateway::new(StripeConfig {
            secret_key: "sk_test_123".into(),
            webhook_secret: None,
            api_timeout: Duration::from_secs(1),
            max_retries: 3,
        });
        let delays: Vec<Duration> = gateway.retry_strategy().collect();
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(2)));
    }
}
