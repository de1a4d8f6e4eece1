//! Hosted checkout routes: start, finalize and cleanup

use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use wizpix_billing::Currency;
use wizpix_shared::models::{CheckoutSessionState, CheckoutStatus};

use crate::{
    error::{ApiError, ApiResult},
    routes::auth::start_session,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub plan: String,
    pub currency: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutResponse {
    pub status: &'static str,
    pub redirect: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub session_id: Option<String>,
}

impl SessionRequest {
    fn session_id(&self) -> ApiResult<&str> {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::Validation("Missing sessionId".into()))
    }
}

#[derive(Debug, Serialize)]
pub struct FinalizedUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Serialize)]
pub struct FinalizedPlan {
    pub code: String,
    pub name: String,
    pub price_cents: i64,
    pub currency: Currency,
    pub daily_credit_quota: i32,
}

#[derive(Debug, Serialize)]
pub struct FinalizedCredits {
    pub used_last_24h: i64,
    pub remaining_last_24h: i64,
}

#[derive(Debug, Serialize)]
pub struct FinalizeCompleted {
    pub status: &'static str,
    pub token: String,
    pub user: FinalizedUser,
    pub plan: FinalizedPlan,
    pub credits: FinalizedCredits,
    pub subscription_id: Option<Uuid>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateCheckoutRequest>,
) -> ApiResult<Json<CreateCheckoutResponse>> {
    if !state.config.enable_billing {
        return Err(ApiError::Unavailable("billing is disabled".into()));
    }

    let started = state
        .billing
        .checkout
        .start(&req.email, &req.plan, req.currency.as_deref())
        .await?;

    Ok(Json(CreateCheckoutResponse {
        status: "success",
        redirect: started.redirect_url,
        session_id: started.session_id,
    }))
}

/// Report the outcome of a checkout and, once it completed, sign the user in
///
/// Unknown session ids answer `pending` like sessions still waiting for their
/// webhook, so the endpoint cannot be used to probe for sessions.
pub async fn finalize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SessionRequest>,
) -> ApiResult<Response> {
    let session_id = req.session_id()?;

    let Some(session) = state.billing.sessions.get(session_id).await? else {
        return Ok(pending());
    };

    match session.status {
        CheckoutStatus::Pending => Ok(pending()),
        CheckoutStatus::Failed => Ok(Json(json!({
            "status": "failed",
            "reason": session.last_error.as_deref().unwrap_or("payment_failed"),
        }))
        .into_response()),
        CheckoutStatus::Completed => complete(&state, &headers, session).await,
    }
}

async fn complete(
    state: &AppState,
    headers: &HeaderMap,
    session: CheckoutSessionState,
) -> ApiResult<Response> {
    if session.consumed_at.is_some() {
        return Err(already_finalized(&session.session_id));
    }

    let user_id = session.user_id.ok_or_else(|| {
        ApiError::Internal(format!(
            "completed checkout {} has no user",
            session.session_id
        ))
    })?;
    let user = state
        .store
        .find_user_by_id(user_id)
        .await?
        .ok_or_else(|| ApiError::Internal(format!("user {user_id} missing")))?;

    // Single use: only the caller that wins the claim gets credentials
    if !state.billing.sessions.mark_consumed(&session.session_id).await? {
        return Err(already_finalized(&session.session_id));
    }
    let (token, cookie) = start_session(state, &user, headers).await?;

    let currency = Currency::parse_or_default(Some(&session.currency));
    let definition = state.billing.catalog.get(&session.plan_code);
    let plan_row = match session.plan_id {
        Some(plan_id) => state.billing.subscriptions.get_plan(plan_id).await?,
        None => None,
    };

    let daily_credit_quota = plan_row
        .as_ref()
        .map(|p| p.daily_credit_quota)
        .or(definition.map(|d| d.daily_credit_quota))
        .unwrap_or(0);
    let plan = FinalizedPlan {
        code: session.plan_code.clone(),
        name: plan_row
            .as_ref()
            .map(|p| p.name.clone())
            .or(definition.map(|d| d.name.clone()))
            .unwrap_or_else(|| session.plan_code.clone()),
        price_cents: definition
            .map(|d| d.prices.get(currency))
            .or(plan_row.as_ref().map(|p| p.price_cents))
            .unwrap_or(0),
        currency,
        daily_credit_quota,
    };

    let credits = match state.billing.credits.get_usage_window(user.id).await? {
        Some(window) => FinalizedCredits {
            used_last_24h: window.used_last_24h,
            remaining_last_24h: window.remaining_last_24h,
        },
        None => FinalizedCredits {
            used_last_24h: 0,
            remaining_last_24h: i64::from(daily_credit_quota),
        },
    };

    let customer = state.store.find_customer_by_user(user.id).await?;
    let (first_name, last_name) = customer
        .map(|c| (c.first_name.unwrap_or_default(), c.last_name.unwrap_or_default()))
        .unwrap_or_default();

    tracing::info!(
        session_id = %session.session_id,
        user_id = %user.id,
        plan_code = %plan.code,
        "Checkout finalized"
    );

    Ok((
        [(SET_COOKIE, cookie)],
        Json(FinalizeCompleted {
            status: "completed",
            token,
            user: FinalizedUser {
                email: user.email,
                first_name,
                last_name,
            },
            plan,
            credits,
            subscription_id: session.subscription_id,
        }),
    )
        .into_response())
}

/// Drop a checkout the user abandoned before paying
pub async fn cleanup(
    State(state): State<AppState>,
    Json(req): Json<SessionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session_id = req.session_id()?;
    let removed = state.billing.sessions.discard_pending(session_id).await?;

    Ok(Json(json!({
        "status": "success",
        "message": if removed { "session_cleaned" } else { "nothing_to_clean" },
    })))
}

fn already_finalized(session_id: &str) -> ApiError {
    tracing::warn!(session_id = %session_id, "Finalize called for a consumed checkout");
    ApiError::Unauthorized("Checkout already finalized, please log in".into())
}

fn pending() -> Response {
    Json(json!({ "status": "pending" })).into_response()
}
