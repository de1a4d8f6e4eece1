//! Login, identity, refresh and logout routes

use axum::{
    extract::{Extension, State},
    http::{header::SET_COOKIE, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wizpix_billing::UsageWindow;
use wizpix_shared::models::{normalize_email, User};

use crate::{
    auth::{client_meta, extract_refresh_cookie, verify_password, AuthUser},
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionUser {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub status: &'static str,
    pub token: String,
    pub user: SessionUser,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub status: &'static str,
    pub user: AuthUser,
    /// Absent without an active subscription
    pub credits: Option<UsageWindow>,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub status: &'static str,
    pub token: String,
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Response> {
    let email = normalize_email(&req.email);
    if email.is_empty() || req.password.is_empty() {
        return Err(ApiError::Validation(
            "Please provide email and password".into(),
        ));
    }

    // Same answer for an unknown email and a wrong password
    let user = match state.store.find_user_by_email(&email).await? {
        Some(user) if verify_password(&req.password, &user.password_hash) => user,
        _ => {
            tracing::info!("Login rejected");
            return Err(ApiError::Unauthorized("Incorrect email or password".into()));
        }
    };

    let (token, cookie) = start_session(&state, &user, &headers).await?;
    tracing::info!(user_id = %user.id, "User logged in");

    Ok((
        [(SET_COOKIE, cookie)],
        Json(LoginResponse {
            status: "success",
            token,
            user: SessionUser {
                id: user.id,
                email: user.email,
            },
        }),
    )
        .into_response())
}

pub async fn me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<MeResponse>> {
    let credits = state
        .billing
        .credits
        .get_usage_window(auth_user.user_id)
        .await?;

    Ok(Json(MeResponse {
        status: "success",
        user: auth_user,
        credits,
    }))
}

/// Rotate the refresh cookie and hand out a fresh access token
pub async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    let token = extract_refresh_cookie(&headers)
        .ok_or_else(|| ApiError::Unauthorized("Missing refresh token".into()))?;

    let claims = state.tokens.verify_refresh_token(&token).await?;
    let user = state
        .store
        .find_user_by_id(claims.user_id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("User not found".into()))?;

    let rotated = state
        .tokens
        .rotate_refresh_token(&claims, &client_meta(&headers))
        .await?;
    let access = state.tokens.issue_access_token(&user)?;
    let cookie = refresh_cookie(&state, &rotated.token)?;

    Ok((
        [(SET_COOKIE, cookie)],
        Json(RefreshResponse {
            status: "success",
            token: access,
        }),
    )
        .into_response())
}

/// Revocation is best effort; the cookie is cleared regardless
pub async fn logout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Response> {
    if let Err(e) = state.tokens.revoke_all_for_user(auth_user.user_id).await {
        tracing::warn!(
            user_id = %auth_user.user_id,
            error = %e,
            "Refresh token revocation failed during logout"
        );
    }

    let cleared = state
        .cookies
        .clear_refresh_cookie()
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        [(SET_COOKIE, cleared)],
        Json(serde_json::json!({ "status": "success" })),
    )
        .into_response())
}

/// Issue an access token and a new refresh cookie for `user`
pub(crate) async fn start_session(
    state: &AppState,
    user: &User,
    headers: &HeaderMap,
) -> ApiResult<(String, HeaderValue)> {
    let access = state.tokens.issue_access_token(user)?;
    let refresh = state
        .tokens
        .issue_refresh_token(user, &client_meta(headers))
        .await?;
    let cookie = refresh_cookie(state, &refresh.token)?;
    Ok((access, cookie))
}

fn refresh_cookie(state: &AppState, token: &str) -> ApiResult<HeaderValue> {
    state
        .cookies
        .refresh_cookie(token)
        .map_err(|e| ApiError::Internal(e.to_string()))
}
