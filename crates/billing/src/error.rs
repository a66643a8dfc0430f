//! Billing error types

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A collaborator was never configured (as opposed to failing at runtime)
    #[error("{0} is not configured")]
    NotConfigured(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    /// A saga step failed and its compensating action failed as well
    #[error("Compensation failed: {0}")]
    CompensationFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the caller may retry the same operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::StripeApi(_) | BillingError::Database(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", e))
    }
}
