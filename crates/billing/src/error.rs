//! Billing and credit store errors

use revisume_shared::{CreditType, UserId};

/// Errors raised by a [`crate::store::CreditStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Balance underflow for user {user_id} ({credit_type}): {amount} + {delta} < 0")]
    Underflow {
        user_id: UserId,
        credit_type: CreditType,
        amount: i32,
        delta: i32,
    },

    #[error("Balance for user {user_id} ({credit_type}) would exceed ceiling {ceiling}")]
    CeilingExceeded {
        user_id: UserId,
        credit_type: CreditType,
        ceiling: i32,
    },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return StoreError::DuplicateKey(
                    db.constraint().unwrap_or("unique constraint").to_string(),
                );
            }
        }
        StoreError::Database(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Billing error type
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("User not found: {0}")]
    UnknownUser(String),

    #[error("Price does not map to a product: {0}")]
    UnknownPrice(String),

    #[error("Billing identifier conflict: {0}")]
    IdentifierConflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Billing not configured: {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the caller (usually the payment provider) should retry.
    ///
    /// Only transient storage failures qualify; everything else will fail the
    /// same way on every delivery.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Store(StoreError::Database(_)) | BillingError::Internal(_)
        )
    }

    /// HTTP status for surfacing this error to an API caller.
    pub fn status_code(&self) -> u16 {
        match self {
            BillingError::WebhookSignatureInvalid
            | BillingError::InvalidPayload(_)
            | BillingError::InvalidInput(_)
            | BillingError::UnknownPrice(_) => 400,
            BillingError::UnknownUser(_) | BillingError::Store(StoreError::NotFound(_)) => 404,
            BillingError::IdentifierConflict(_)
            | BillingError::Store(StoreError::DuplicateKey(_))
            | BillingError::Store(StoreError::Underflow { .. })
            | BillingError::Store(StoreError::CeilingExceeded { .. }) => 409,
            BillingError::StripeApi(_) => 502,
            BillingError::NotConfigured(_) => 503,
            BillingError::Store(StoreError::Database(_)) | BillingError::Internal(_) => 500,
        }
    }

    /// Whether the error was caused by the request itself (bad signature or body).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BillingError::WebhookSignatureInvalid
                | BillingError::InvalidPayload(_)
                | BillingError::InvalidInput(_)
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_database_failures_are_retryable() {
        assert!(BillingError::Store(StoreError::Database("timeout".into())).is_retryable());
        assert!(!BillingError::Store(StoreError::DuplicateKey("uq".into())).is_retryable());
        assert!(!BillingError::UnknownPrice("price_x".into()).is_retryable());
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
    }

    #[test]
    fn test_client_errors() {
        assert!(BillingError::InvalidPayload("bad json".into()).is_client_error());
        assert!(!BillingError::NotConfigured("stripe".into()).is_client_error());
    }
}
