//! Application state wired to in-memory adapters

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use wizpix_billing::{
    BillingConfig, BillingResult, BillingService, CheckoutRequest, CreatedCheckout, Currency,
    PaymentGateway, PlanCatalog, QuotaEnforcement,
};
use wizpix_shared::models::{BillingPeriod, NewSubscription, User};
use wizpix_shared::{MemoryStore, Store};

use crate::auth::{hash_password, keys::test_keys, StaticKeyProvider};
use crate::config::{AppEnv, Config};
use crate::state::AppState;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const PASSWORD: &str = "correct horse battery";

/// Hands out sequential session ids and records what was requested
#[derive(Default)]
pub struct FakeGateway {
    created: AtomicUsize,
    pub requests: tokio::sync::Mutex<Vec<CheckoutRequest>>,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CreatedCheckout> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().await.push(request.clone());
        Ok(CreatedCheckout {
            session_id: format!("cs_test_{n}"),
            url: format!("https://checkout.example.com/pay/cs_test_{n}"),
        })
    }

    async fn subscription_period(
        &self,
        _external_subscription_id: &str,
    ) -> BillingResult<Option<BillingPeriod>> {
        Ok(None)
    }
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
}

pub fn config() -> Config {
    Config {
        database_url: "postgres://unused".into(),
        bind_address: "127.0.0.1:0".into(),
        app_env: AppEnv::Development,
        jwt_private_key_path: "testdata/private.pem".into(),
        jwt_public_key_path: "testdata/public.pem".into(),
        access_token_minutes: 15,
        refresh_token_minutes: 60,
        cookie_domain: None,
        allowed_origins: vec!["http://localhost:3000".into()],
        run_migrations: false,
        quota_enforcement: QuotaEnforcement::Strict,
        checkout_stale_after_minutes: 1440,
        frontend_url: "https://wizpix.test/".into(),
        enable_billing: true,
    }
}

pub async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(FakeGateway::default());
    let config = config();

    let mut catalog = PlanCatalog::default();
    for code in ["hobby", "pro"] {
        if let Some(plan) = catalog.get_mut(code) {
            for currency in Currency::ALL {
                plan.set_price_id(currency, format!("price_{code}_{currency}"));
            }
        }
    }

    let billing = BillingService::new(
        store.clone(),
        gateway.clone(),
        catalog,
        BillingConfig {
            quota_enforcement: config.quota_enforcement,
            frontend_url: config.frontend_url.clone(),
            webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        },
    );
    let keys = StaticKeyProvider::from_pem(test_keys::PRIVATE_PEM, test_keys::PUBLIC_PEM).unwrap();

    let state = AppState::new(store.clone(), config, Arc::new(keys), billing);
    Harness {
        state,
        store,
        gateway,
    }
}

impl Harness {
    /// An account with `PASSWORD` and an active subscription on `plan_code`
    pub async fn subscriber(&self, email: &str, plan_code: &str) -> User {
        let user = self
            .store
            .insert_user(email, &hash_password(PASSWORD).unwrap())
            .await;
        let plan = self
            .state
            .billing
            .subscriptions
            .ensure_plan(plan_code)
            .await
            .unwrap();
        self.store
            .create_subscription(&NewSubscription::active(user.id, plan.id))
            .await
            .unwrap();
        user
    }
}
