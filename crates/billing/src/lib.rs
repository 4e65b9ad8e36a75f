// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PromptOS Billing Module
//!
//! Handles Creem integration for subscriptions and entitlements.
//!
//! ## Features
//!
//! - **Webhooks**: verified, idempotent processing of Creem billing events
//! - **Subscription Store**: one row per user, mutated only by webhook handlers
//! - **Event Ledger**: atomic claim/release deduplication of event ids
//! - **Entitlement Cache**: short-TTL Redis cache of access decisions
//! - **Plan Resolution**: product id -> plan via a static configured table

pub mod config;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod ledger;
pub mod router;
pub mod signature;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Config
pub use config::{CreemConfig, CreemMode};

// Entitlement
pub use entitlement::{
    EntitlementCache, EntitlementCode, EntitlementEntry, EntitlementService,
    MemoryEntitlementCache, RedisEntitlementCache,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{normalize_period_end, ParseError, WebhookEvent};

// Ledger
pub use ledger::{ClaimOutcome, EventLedger, MemoryEventLedger, PgEventLedger};

// Router
pub use router::{classify, EventCategory};

// Signature
pub use signature::verify_signature;

// Subscriptions
pub use subscriptions::{
    MemorySubscriptionStore, PgSubscriptionStore, SubscriptionRecord, SubscriptionStore,
};

// Webhooks
pub use webhooks::{SkipReason, WebhookDisposition, WebhookHandler};

use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

/// Main billing service wiring the webhook pipeline and the read path.
///
/// Constructed once at process startup and shared via `Arc`; the storage
/// clients are injected here, never reached through lazy globals.
pub struct BillingService {
    pub webhooks: WebhookHandler,
    pub entitlements: EntitlementService,
    pub subscriptions: Arc<dyn SubscriptionStore>,
}

impl BillingService {
    /// Create a billing service over Postgres and Redis with config from the
    /// environment.
    pub fn from_env(pool: PgPool, redis: ConnectionManager) -> BillingResult<Self> {
        Ok(Self::new(
            CreemConfig::from_env()?,
            Arc::new(PgEventLedger::new(pool.clone())),
            Arc::new(PgSubscriptionStore::new(pool)),
            Arc::new(RedisEntitlementCache::new(redis)),
        ))
    }

    /// Create a billing service with explicit collaborators.
    pub fn new(
        config: CreemConfig,
        ledger: Arc<dyn EventLedger>,
        subscriptions: Arc<dyn SubscriptionStore>,
        cache: Arc<dyn EntitlementCache>,
    ) -> Self {
        Self {
            webhooks: WebhookHandler::new(
                config,
                ledger,
                subscriptions.clone(),
                cache.clone(),
            ),
            entitlements: EntitlementService::new(
                subscriptions.clone(),
                cache,
                EntitlementService::DEFAULT_TTL,
            ),
            subscriptions,
        }
    }
}
