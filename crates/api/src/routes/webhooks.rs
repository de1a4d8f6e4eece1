//! Payment processor webhook endpoint

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use wizpix_billing::{BillingError, WebhookOutcome};

use crate::{error::ApiError, state::AppState};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Verify, journal and process one delivery
///
/// Once an event is journaled the processor always gets a 2xx, even when
/// processing failed; failed events stay in the journal for replay. Only a
/// journaling failure answers 5xx so the processor redelivers.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(payload) = std::str::from_utf8(&body) else {
        return ApiError::Validation("Payload is not valid UTF-8".into()).into_response();
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());

    let envelope = match state.billing.webhooks.verify_event(payload, signature) {
        Ok(envelope) => envelope,
        Err(e) => {
            if matches!(e, BillingError::WebhookSignatureInvalid) {
                tracing::warn!("Webhook rejected: invalid signature");
            } else {
                tracing::warn!(error = %e, "Webhook rejected: unreadable payload");
            }
            return ApiError::from(e).into_response();
        }
    };

    match state.billing.webhooks.handle(&envelope).await {
        Ok(outcome) => {
            let result = match outcome {
                WebhookOutcome::Processed => "processed",
                WebhookOutcome::Skipped(_) => "duplicate",
                WebhookOutcome::Failed(_) => "failed",
            };
            (
                StatusCode::OK,
                Json(json!({ "received": true, "result": result })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(
                event_id = %envelope.id,
                error = %e,
                "Webhook could not be journaled"
            );
            ApiError::Internal(e.to_string()).into_response()
        }
    }
}
