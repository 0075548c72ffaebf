//! Billing error types

/// Errors surfaced by the recurring billing core.
///
/// Database and transport failures propagate to the caller (batch runner or
/// event dispatcher). Malformed events and misconfigured schedule rows are
/// handled locally as no-ops and never become a `BillingError`.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("payment gateway error: {0}")]
    Gateway(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type BillingResult<T> = Result<T, BillingError>;
