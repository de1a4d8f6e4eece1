//! HTTP routes

pub mod auth;
pub mod checkout;
pub mod plans;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod router_tests;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::{auth::require_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/usage", get(usage::window))
        .route("/api/usage/consume", post(usage::consume))
        .route("/api/usage/history", get(usage::history))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .route("/api/plans", get(plans::list_plans))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/refresh", post(auth::refresh))
        .route("/api/stripe/checkout", post(checkout::create))
        .route("/api/stripe/finalize", post(checkout::finalize))
        .route("/api/stripe/cleanup", post(checkout::cleanup))
        .route("/api/stripe/webhook", post(webhooks::handle_webhook));

    public.merge(protected).with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
