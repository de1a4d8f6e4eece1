//! Checkout sessions
//!
//! A session is keyed by the payment processor's session id and moves
//! `pending -> completed` or `pending -> failed`. Terminal states are sticky:
//! later transition attempts return the stored row unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use wizpix_shared::models::{
    normalize_email, CheckoutRefs, CheckoutSessionState, CheckoutStatus, NewCheckoutSession,
};
use wizpix_shared::Store;

use crate::client::{CheckoutRequest, PaymentGateway};
use crate::error::{BillingError, BillingResult};
use crate::plans::{Currency, PlanCatalog};

/// Placeholder the processor substitutes with the real session id on redirect
const SESSION_ID_PLACEHOLDER: &str = "{CHECKOUT_SESSION_ID}";

/// One key per `start` call: `checkout:<plan>:<currency>:<email digest>:<nonce>`
fn checkout_idempotency_key(email: &str, plan_code: &str, currency: Currency) -> String {
    let digest = hex::encode(Sha256::digest(email.as_bytes()));
    format!(
        "checkout:{plan_code}:{currency}:{}:{}",
        &digest[..16],
        Uuid::new_v4().simple()
    )
}

#[derive(Clone)]
pub struct CheckoutStateMachine {
    store: Arc<dyn Store>,
}

impl CheckoutStateMachine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Register a session the first time it is seen
    pub async fn get_or_create(
        &self,
        session_id: &str,
        email: &str,
        plan_code: &str,
        currency: Currency,
    ) -> BillingResult<CheckoutSessionState> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(BillingError::InvalidInput("session id is required".into()));
        }

        let state = self
            .store
            .checkout_get_or_create(&NewCheckoutSession {
                session_id: session_id.to_string(),
                email: normalize_email(email),
                plan_code: plan_code.trim().to_ascii_lowercase(),
                currency: currency.as_str().to_string(),
            })
            .await?;
        Ok(state)
    }

    pub async fn get(&self, session_id: &str) -> BillingResult<Option<CheckoutSessionState>> {
        Ok(self.store.checkout_get(session_id.trim()).await?)
    }

    /// `pending -> completed`. A repeated completion returns the stored row.
    pub async fn complete(
        &self,
        session_id: &str,
        refs: CheckoutRefs,
    ) -> BillingResult<CheckoutSessionState> {
        let state = self
            .store
            .checkout_complete(session_id, &refs)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("checkout session {session_id}")))?;

        if state.status == CheckoutStatus::Completed
            && (state.user_id != Some(refs.user_id)
                || state.subscription_id != Some(refs.subscription_id))
        {
            tracing::warn!(
                session_id = %session_id,
                stored_user_id = ?state.user_id,
                stored_subscription_id = ?state.subscription_id,
                "Completion for an already completed session carried different identities"
            );
        }
        Ok(state)
    }

    /// `pending -> failed`. No-op once terminal.
    pub async fn fail(&self, session_id: &str, reason: &str) -> BillingResult<CheckoutSessionState> {
        let state = self
            .store
            .checkout_fail(session_id, reason)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("checkout session {session_id}")))?;

        tracing::info!(
            session_id = %session_id,
            status = %state.status,
            reason = %reason,
            "Checkout session fail requested"
        );
        Ok(state)
    }

    /// Claim a completed session for its one finalize; false if already claimed
    pub async fn mark_consumed(&self, session_id: &str) -> BillingResult<bool> {
        Ok(self.store.checkout_mark_consumed(session_id).await?)
    }

    /// Drop an abandoned pending session and the signup that never became an account
    ///
    /// Terminal sessions are kept. Returns whether a session was removed.
    pub async fn discard_pending(&self, session_id: &str) -> BillingResult<bool> {
        let Some(deleted) = self.store.checkout_delete_pending(session_id.trim()).await? else {
            return Ok(false);
        };

        let signup_removed = self.store.discard_unverified_signup(&deleted.email).await?;
        tracing::info!(
            session_id = %deleted.session_id,
            signup_removed = signup_removed,
            "Pending checkout session discarded"
        );
        Ok(true)
    }

    /// Fail every session still pending after `max_age`
    pub async fn expire_stale(&self, max_age: Duration) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - max_age;
        let expired = self.store.checkout_expire_stale(cutoff, "expired").await?;
        if expired > 0 {
            tracing::info!(expired = expired, "Expired stale checkout sessions");
        }
        Ok(expired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutStarted {
    pub session_id: String,
    pub redirect_url: String,
}

/// Starts hosted checkouts and registers them as pending
#[derive(Clone)]
pub struct CheckoutService {
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PlanCatalog>,
    sessions: CheckoutStateMachine,
    frontend_url: String,
}

impl CheckoutService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
        sessions: CheckoutStateMachine,
        frontend_url: impl Into<String>,
    ) -> Self {
        let frontend_url = frontend_url.into().trim_end_matches('/').to_string();
        Self {
            gateway,
            catalog,
            sessions,
            frontend_url,
        }
    }

    pub async fn start(
        &self,
        email: &str,
        plan_code: &str,
        currency: Option<&str>,
    ) -> BillingResult<CheckoutStarted> {
        let email = normalize_email(email);
        if !is_plausible_email(&email) {
            return Err(BillingError::InvalidInput("a valid email is required".into()));
        }

        let plan = self
            .catalog
            .get(plan_code)
            .ok_or_else(|| BillingError::PlanNotFound(plan_code.trim().to_string()))?;
        if !plan.is_paid() {
            return Err(BillingError::InvalidInput(format!(
                "plan '{}' does not require checkout",
                plan.code
            )));
        }

        let currency = Currency::parse_or_default(currency);
        let price_id = plan.price_id(currency).ok_or_else(|| {
            BillingError::Config(format!(
                "no price configured for plan '{}' in {currency}",
                plan.code
            ))
        })?;

        let metadata = HashMap::from([
            ("email".to_string(), email.clone()),
            ("plan_code".to_string(), plan.code.clone()),
            ("currency".to_string(), currency.as_str().to_string()),
        ]);

        let created = self
            .gateway
            .create_checkout_session(&CheckoutRequest {
                email: email.clone(),
                price_id: price_id.to_string(),
                metadata,
                success_url: format!(
                    "{}?checkout=success&currency={currency}&session_id={SESSION_ID_PLACEHOLDER}",
                    self.frontend_url
                ),
                cancel_url: format!(
                    "{}?checkout=canceled&session_id={SESSION_ID_PLACEHOLDER}&plan={}&currency={currency}",
                    self.frontend_url, plan.code
                ),
                idempotency_key: checkout_idempotency_key(&email, &plan.code, currency),
            })
            .await?;

        self.sessions
            .get_or_create(&created.session_id, &email, &plan.code, currency)
            .await?;

        tracing::info!(
            session_id = %created.session_id,
            plan_code = %plan.code,
            currency = %currency,
            "Checkout started"
        );

        Ok(CheckoutStarted {
            session_id: created.session_id,
            redirect_url: created.url,
        })
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CreatedCheckout;
    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use uuid::Uuid;
    use wizpix_shared::models::BillingPeriod;
    use wizpix_shared::MemoryStore;

    #[derive(Default)]
    struct RecordingGateway {
        requests: Mutex<Vec<CheckoutRequest>>,
    }

    #[async_trait]
    impl PaymentGateway for RecordingGateway {
        async fn create_checkout_session(
            &self,
            request: &CheckoutRequest,
        ) -> BillingResult<CreatedCheckout> {
            let mut requests = self.requests.lock().await;
            requests.push(request.clone());
            Ok(CreatedCheckout {
                session_id: format!("cs_test_{}", requests.len()),
                url: "https://checkout.example.com/pay".into(),
            })
        }

        async fn subscription_period(&self, _id: &str) -> BillingResult<Option<BillingPeriod>> {
            Ok(None)
        }
    }

    fn machine() -> (Arc<MemoryStore>, CheckoutStateMachine) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), CheckoutStateMachine::new(store))
    }

    fn refs() -> CheckoutRefs {
        CheckoutRefs {
            user_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (_store, sessions) = machine();
        let first = sessions
            .get_or_create("cs_1", "A@Example.com", "Hobby", Currency::Eur)
            .await
            .unwrap();
        let second = sessions
            .get_or_create("cs_1", "other@example.com", "pro", Currency::Usd)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(second.email, "a@example.com");
        assert_eq!(second.plan_code, "hobby");
        assert_eq!(second.status, CheckoutStatus::Pending);
    }

    #[tokio::test]
    async fn test_terminal_states_are_sticky() {
        let (_store, sessions) = machine();
        sessions
            .get_or_create("cs_2", "b@example.com", "pro", Currency::Chf)
            .await
            .unwrap();

        let refs = refs();
        let completed = sessions.complete("cs_2", refs).await.unwrap();
        assert_eq!(completed.status, CheckoutStatus::Completed);

        let again = sessions.complete("cs_2", refs).await.unwrap();
        assert_eq!(again, completed);

        let failed = sessions.fail("cs_2", "too late").await.unwrap();
        assert_eq!(failed.status, CheckoutStatus::Completed);
        assert_eq!(failed.last_error, None);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let (_store, sessions) = machine();
        assert!(matches!(
            sessions.complete("cs_missing", refs()).await,
            Err(BillingError::NotFound(_))
        ));
        assert!(sessions.get("cs_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_discard_only_removes_pending() {
        let (store, sessions) = machine();
        store.save_verified_signup("c@example.com", "hash").await.unwrap();
        sessions
            .get_or_create("cs_3", "c@example.com", "hobby", Currency::Chf)
            .await
            .unwrap();
        sessions
            .get_or_create("cs_4", "d@example.com", "hobby", Currency::Chf)
            .await
            .unwrap();
        sessions.fail("cs_4", "payment_failed").await.unwrap();

        assert!(sessions.discard_pending("cs_3").await.unwrap());
        assert!(sessions.get("cs_3").await.unwrap().is_none());
        assert!(store.find_verified_signup("c@example.com").await.unwrap().is_none());

        assert!(!sessions.discard_pending("cs_4").await.unwrap());
        assert!(sessions.get("cs_4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expire_stale_leaves_fresh_sessions() {
        let (store, sessions) = machine();
        sessions
            .get_or_create("cs_old", "e@example.com", "hobby", Currency::Chf)
            .await
            .unwrap();
        sessions
            .get_or_create("cs_new", "f@example.com", "hobby", Currency::Chf)
            .await
            .unwrap();
        store.age_checkout("cs_old", Duration::hours(48)).await;

        assert_eq!(sessions.expire_stale(Duration::hours(24)).await.unwrap(), 1);

        let old = sessions.get("cs_old").await.unwrap().unwrap();
        assert_eq!(old.status, CheckoutStatus::Failed);
        assert_eq!(old.last_error.as_deref(), Some("expired"));
        let new = sessions.get("cs_new").await.unwrap().unwrap();
        assert_eq!(new.status, CheckoutStatus::Pending);
    }

    #[tokio::test]
    async fn test_start_registers_pending_session() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let mut catalog = PlanCatalog::default();
        catalog
            .get_mut("hobby")
            .unwrap()
            .set_price_id(Currency::Eur, "price_hobby_eur");

        let service = CheckoutService::new(
            gateway.clone(),
            Arc::new(catalog),
            CheckoutStateMachine::new(store.clone()),
            "https://app.example.com/",
        );

        let started = service
            .start(" Buyer@Example.com ", "hobby", Some("eur"))
            .await
            .unwrap();
        assert_eq!(started.session_id, "cs_test_1");

        let requests = gateway.requests.lock().await;
        let request = &requests[0];
        assert_eq!(request.price_id, "price_hobby_eur");
        assert_eq!(request.email, "buyer@example.com");
        assert_eq!(request.metadata.get("plan_code").map(String::as_str), Some("hobby"));
        assert!(request
            .success_url
            .starts_with("https://app.example.com?checkout=success&currency=EUR"));
        assert!(request.success_url.ends_with("session_id={CHECKOUT_SESSION_ID}"));

        let state = store.checkout_get("cs_test_1").await.unwrap().unwrap();
        assert_eq!(state.status, CheckoutStatus::Pending);
        assert_eq!(state.currency, "EUR");
    }

    #[tokio::test]
    async fn test_each_start_carries_its_own_idempotency_key() {
        let gateway = Arc::new(RecordingGateway::default());
        let mut catalog = PlanCatalog::default();
        catalog
            .get_mut("hobby")
            .unwrap()
            .set_price_id(Currency::Chf, "price_hobby_chf");
        let service = CheckoutService::new(
            gateway.clone(),
            Arc::new(catalog),
            CheckoutStateMachine::new(Arc::new(MemoryStore::new())),
            "https://app.example.com",
        );

        service.start("buyer@example.com", "hobby", Some("chf")).await.unwrap();
        service.start("buyer@example.com", "hobby", Some("chf")).await.unwrap();

        let requests = gateway.requests.lock().await;
        let first = &requests[0].idempotency_key;
        let second = &requests[1].idempotency_key;
        assert!(first.starts_with("checkout:hobby:CHF:"));
        assert!(second.starts_with("checkout:hobby:CHF:"));
        assert_ne!(first, second);
        assert!(!first.contains("buyer@example.com"));
        assert!(first.len() <= 255);
    }

    #[tokio::test]
    async fn test_start_rejects_free_plan_and_missing_price() {
        let service = CheckoutService::new(
            Arc::new(RecordingGateway::default()),
            Arc::new(PlanCatalog::default()),
            CheckoutStateMachine::new(Arc::new(MemoryStore::new())),
            "http://localhost:5173",
        );

        assert!(matches!(
            service.start("a@example.com", "free", None).await,
            Err(BillingError::InvalidInput(_))
        ));
        assert!(matches!(
            service.start("a@example.com", "pro", None).await,
            Err(BillingError::Config(_))
        ));
        assert!(matches!(
            service.start("a@example.com", "platinum", None).await,
            Err(BillingError::PlanNotFound(_))
        ));
        assert!(matches!(
            service.start("not-an-email", "pro", None).await,
            Err(BillingError::InvalidInput(_))
        ));
    }
}
