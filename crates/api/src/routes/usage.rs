//! Credit consumption routes

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use wizpix_billing::{ConsumeOutcome, UsageWindow};
use wizpix_shared::models::CreditUsage;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Operations that cost one credit
const USAGE_REASONS: &[&str] = &["download"];

const MAX_HISTORY: i64 = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    #[serde(default)]
    pub reason: String,
    /// Client-generated id; a retried request with the same id is counted once
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Credits {
    pub used_last_24h: i64,
    pub remaining_last_24h: i64,
}

impl From<UsageWindow> for Credits {
    fn from(window: UsageWindow) -> Self {
        Self {
            used_last_24h: window.used_last_24h,
            remaining_last_24h: window.remaining_last_24h,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConsumeResponse {
    pub status: &'static str,
    pub credits: Credits,
}

#[derive(Debug, Serialize)]
pub struct WindowResponse {
    pub status: &'static str,
    pub credits: Option<UsageWindow>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub status: &'static str,
    pub usage: Vec<CreditUsage>,
}

pub async fn consume(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ConsumeRequest>,
) -> ApiResult<Json<ConsumeResponse>> {
    let reason = req.reason.trim().to_ascii_lowercase();
    if !USAGE_REASONS.contains(&reason.as_str()) {
        return Err(ApiError::Validation(format!(
            "reason must be one of: {}",
            USAGE_REASONS.join(", ")
        )));
    }

    let request_ref = req
        .request_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    match state
        .billing
        .credits
        .consume(auth_user.user_id, &reason, request_ref)
        .await?
    {
        ConsumeOutcome::Consumed(window) => Ok(Json(ConsumeResponse {
            status: "success",
            credits: window.into(),
        })),
        ConsumeOutcome::NoActiveSubscription => Err(ApiError::NoActiveSubscription),
        ConsumeOutcome::QuotaExhausted(window) => {
            tracing::info!(
                user_id = %auth_user.user_id,
                used = window.used_last_24h,
                "Daily credit quota exhausted"
            );
            Err(ApiError::NoCreditLeft(window))
        }
    }
}

pub async fn window(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<WindowResponse>> {
    let credits = state
        .billing
        .credits
        .get_usage_window(auth_user.user_id)
        .await?;
    Ok(Json(WindowResponse {
        status: "success",
        credits,
    }))
}

/// Ledger rows of the current subscription, newest first
pub async fn history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_HISTORY);

    let usage = match state
        .billing
        .subscriptions
        .get_current_subscription(auth_user.user_id)
        .await?
    {
        Some(subscription) => state.billing.credits.history(subscription.id, limit).await?,
        None => Vec::new(),
    };

    Ok(Json(HistoryResponse {
        status: "success",
        usage,
    }))
}
