//! Billing error types

use thiserror::Error;
use wizpix_shared::StoreError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Payment processor unreachable, timed out or answered 5xx/429
    #[error("Payment processor error: {0}")]
    ExternalService(String),

    /// Payment processor rejected the request itself
    #[error("Payment processor rejected request: {0}")]
    StripeApi(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown plan: {0}")]
    PlanNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// No account and no verified signup can back one yet
    #[error("No verified signup for {0}")]
    NoVerifiedSignup(String),

    /// Invoice arrived before the checkout that creates its customer
    #[error("No local owner yet for invoice {0}")]
    InvoiceOwnerUnknown(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Persistence(e) => !matches!(e, StoreError::Corrupt(_)),
            BillingError::ExternalService(_)
            | BillingError::NoVerifiedSignup(_)
            | BillingError::InvoiceOwnerUnknown(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BillingError::ExternalService("timeout".into()).is_retryable());
        assert!(BillingError::NoVerifiedSignup("a@b.c".into()).is_retryable());
        assert!(BillingError::InvoiceOwnerUnknown("in_1".into()).is_retryable());
        assert!(BillingError::Persistence(StoreError::Conflict("x".into())).is_retryable());
        assert!(!BillingError::Persistence(StoreError::Corrupt("x".into())).is_retryable());
        assert!(!BillingError::PlanNotFound("gold".into()).is_retryable());
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
    }
}
