//! Event ledger (idempotency)
//!
//! Creem retries deliveries on non-2xx responses; without deduplication keyed
//! on the provider's event id, a retried upgrade or downgrade would be applied
//! twice. The ledger claims an event id with a single atomic insert before any
//! handler runs, and releases the claim if processing fails so the provider's
//! retry gets a fresh attempt: process at least once, apply at most once on
//! success.
//!
//! The unique constraint on the event id is the only synchronization primitive
//! in the system; concurrent duplicate deliveries race on the insert, and
//! exactly one wins. Never implement the claim as read-then-write.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Result of attempting to claim an event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// First time this event id has been seen; the caller now owns processing.
    Claimed,
    /// The id already exists in the ledger. Respond 200 without reprocessing.
    Duplicate,
}

/// Append-only record of processed webhook event ids.
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Atomically insert a claim for `event_id`.
    ///
    /// A unique-constraint violation maps to `Ok(Duplicate)`; any other
    /// failure is an `Err`, because duplicates get a 200 while infrastructure
    /// errors get a 500 so the provider retries.
    async fn try_claim(&self, event_id: &str, event_type: &str) -> BillingResult<ClaimOutcome>;

    /// Delete a claim so a provider retry of the same event id can be
    /// reprocessed. Called when downstream processing fails after a claim.
    async fn release(&self, event_id: &str) -> BillingResult<()>;
}

/// Postgres-backed ledger over the `webhook_events` table.
pub struct PgEventLedger {
    pool: PgPool,
}

impl PgEventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLedger for PgEventLedger {
    async fn try_claim(&self, event_id: &str, event_type: &str) -> BillingResult<ClaimOutcome> {
        let result = sqlx::query(
            "INSERT INTO webhook_events (id, event_type, created_at) VALUES ($1, $2, $3)",
        )
        .bind(event_id)
        .bind(event_type)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tracing::info!(event_id, event_type, "duplicate webhook event, deduped");
                Ok(ClaimOutcome::Duplicate)
            }
            Err(e) => {
                tracing::error!(event_id, error = %e, "failed to claim webhook event");
                Err(BillingError::Database(e.to_string()))
            }
        }
    }

    async fn release(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM webhook_events WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(event_id, error = %e, "failed to release webhook claim");
                BillingError::Database(e.to_string())
            })?;
        Ok(())
    }
}

/// In-memory ledger for tests and local development. Single process only.
#[derive(Default)]
pub struct MemoryEventLedger {
    seen: Mutex<HashSet<String>>,
}

impl MemoryEventLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLedger for MemoryEventLedger {
    async fn try_claim(&self, event_id: &str, _event_type: &str) -> BillingResult<ClaimOutcome> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| BillingError::Database("ledger lock poisoned".to_string()))?;
        if seen.insert(event_id.to_string()) {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::Duplicate)
        }
    }

    async fn release(&self, event_id: &str) -> BillingResult<()> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| BillingError::Database("ledger lock poisoned".to_string()))?;
        seen.remove(event_id);
        Ok(())
    }
}
