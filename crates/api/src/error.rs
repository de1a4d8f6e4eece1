//! API error type and its JSON response mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use wizpix_billing::{BillingError, UsageWindow};
use wizpix_shared::StoreError;

use crate::auth::TokenError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("No active subscription")]
    NoActiveSubscription,

    #[error("No more credits available for today")]
    NoCreditLeft(UsageWindow),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NoActiveSubscription => StatusCode::FORBIDDEN,
            ApiError::NoCreditLeft(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Validation(_) => "validation_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::NoActiveSubscription => "no_active_subscription",
            ApiError::NoCreditLeft(_) => "no_credit_left",
            ApiError::Unavailable(_) => "service_unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error");
                "Internal server error".to_string()
            }
            ApiError::Unavailable(detail) => {
                tracing::warn!(error = %detail, "Dependency unavailable");
                "Service temporarily unavailable, please retry".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error": self.error_code(),
            "message": message,
            "code": status.as_u16(),
        });
        if let ApiError::NoCreditLeft(window) = &self {
            body["credits"] = json!({
                "used_last_24h": window.used_last_24h,
                "remaining_last_24h": window.remaining_last_24h,
            });
        }

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidInput(msg) | BillingError::InvalidPayload(msg) => {
                ApiError::Validation(msg)
            }
            BillingError::WebhookSignatureInvalid => {
                ApiError::Validation("Invalid webhook signature".into())
            }
            BillingError::PlanNotFound(code) => ApiError::NotFound(format!("Unknown plan '{code}'")),
            BillingError::NotFound(what) => ApiError::NotFound(what),
            BillingError::ExternalService(msg) => ApiError::Unavailable(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::TokenExpired => ApiError::Unauthorized("Token expired".into()),
            TokenError::TokenMalformed => ApiError::Unauthorized("Invalid token".into()),
            TokenError::TokenRevoked => ApiError::Unauthorized("Token revoked".into()),
            TokenError::SigningKeyUnavailable(msg) => ApiError::Internal(msg),
            TokenError::Persistence(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use uuid::Uuid;

    async fn body_of(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_internal_errors_do_not_leak() {
        let (status, body) = body_of(ApiError::Internal("connection refused".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "internal_error");
        assert_eq!(body["message"], "Internal server error");
        assert_eq!(body["code"], 500);
    }

    #[tokio::test]
    async fn test_no_credit_left_carries_window() {
        let window = UsageWindow {
            subscription_id: Uuid::new_v4(),
            daily_quota: 5,
            used_last_24h: 5,
            remaining_last_24h: 0,
        };
        let (status, body) = body_of(ApiError::NoCreditLeft(window)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "no_credit_left");
        assert_eq!(body["credits"]["remaining_last_24h"], 0);
    }

    #[test]
    fn test_billing_error_mapping() {
        assert!(matches!(
            ApiError::from(BillingError::PlanNotFound("gold".into())),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::ExternalService("timeout".into())),
            ApiError::Unavailable(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::Config("no price".into())),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_token_errors_are_unauthorized() {
        for err in [
            TokenError::TokenExpired,
            TokenError::TokenMalformed,
            TokenError::TokenRevoked,
        ] {
            assert!(matches!(ApiError::from(err), ApiError::Unauthorized(_)));
        }
    }
}
