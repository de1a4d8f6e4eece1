//! Application state

use std::sync::Arc;

use time::Duration;
use wizpix_billing::BillingService;
use wizpix_shared::Store;

use crate::{
    auth::{AuthState, CookiePolicy, KeyProvider, TokenService},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Config,
    pub tokens: TokenService,
    pub cookies: CookiePolicy,
    pub billing: BillingService,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        config: Config,
        keys: Arc<dyn KeyProvider>,
        billing: BillingService,
    ) -> Self {
        let refresh_ttl = Duration::minutes(config.refresh_token_minutes);
        let tokens = TokenService::new(
            store.clone(),
            keys,
            Duration::minutes(config.access_token_minutes),
            refresh_ttl,
        );
        let cookies = CookiePolicy::for_env(
            config.app_env,
            config.cookie_domain.clone(),
            refresh_ttl.whole_seconds(),
        );

        Self {
            store,
            config,
            tokens,
            cookies,
            billing,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            tokens: self.tokens.clone(),
        }
    }
}
