//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors surfaced by the billing crate.
///
/// Business outcomes (duplicate event, unknown product, missing metadata) are
/// NOT errors; they are modeled as enum variants on the operation results so
/// callers never inspect error messages to pick an HTTP status.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Subscription store or event ledger failure (connectivity, constraint
    /// other than the idempotency key, etc). Maps to 500 so the provider
    /// retries.
    #[error("database error: {0}")]
    Database(String),

    /// Entitlement cache failure. Callers treat the cache as best-effort and
    /// generally log-and-swallow this.
    #[error("cache error: {0}")]
    Cache(String),

    /// Server-side misconfiguration (e.g. no webhook secret for the active
    /// environment). Fails closed.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        BillingError::Cache(err.to_string())
    }
}
