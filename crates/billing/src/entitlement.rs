//! Entitlement cache and access decisions
//!
//! Entitlement is derived from the subscription row (status, trial window).
//! A short-TTL Redis cache fronts the derivation; cache absence means
//! "unknown", never "denied", and every read path must fall back to the
//! subscription store on a miss.
//!
//! The cache is a performance optimization with TTL self-heal: writes to it
//! (set and bust alike) are best-effort and never fail a request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use promptos_shared::SubscriptionStatus;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionStore;

/// Reason a user is not entitled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitlementCode {
    /// No subscription row, or one that never granted access.
    SubscriptionRequired,
    /// A subscription or trial that has lapsed.
    SubscriptionExpired,
}

/// A cached access decision for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementEntry {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<EntitlementCode>,
}

impl EntitlementEntry {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            code: None,
        }
    }

    pub fn denied(code: EntitlementCode) -> Self {
        Self {
            allowed: false,
            code: Some(code),
        }
    }
}

/// TTL-bound cache of entitlement decisions, keyed by user id.
#[async_trait]
pub trait EntitlementCache: Send + Sync {
    async fn get(&self, user_id: &str) -> BillingResult<Option<EntitlementEntry>>;
    async fn set(
        &self,
        user_id: &str,
        entry: &EntitlementEntry,
        ttl: Duration,
    ) -> BillingResult<()>;
    async fn delete(&self, user_id: &str) -> BillingResult<()>;
}

fn cache_key(user_id: &str) -> String {
    format!("entitlement:{user_id}")
}

/// Redis-backed entitlement cache (Upstash-compatible).
pub struct RedisEntitlementCache {
    conn: ConnectionManager,
}

impl RedisEntitlementCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl EntitlementCache for RedisEntitlementCache {
    async fn get(&self, user_id: &str) -> BillingResult<Option<EntitlementEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(cache_key(user_id)).await?;
        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(entry) => Ok(Some(entry)),
                // A corrupt entry behaves like a miss; the TTL will clear it.
                Err(e) => {
                    tracing::warn!(user_id, error = %e, "unreadable entitlement cache entry");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        user_id: &str,
        entry: &EntitlementEntry,
        ttl: Duration,
    ) -> BillingResult<()> {
        let json =
            serde_json::to_string(entry).map_err(|e| BillingError::Cache(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(cache_key(user_id), json, ttl.as_secs()).await?;
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> BillingResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(cache_key(user_id)).await?;
        Ok(())
    }
}

/// In-memory entitlement cache for tests and local development.
///
/// TTLs are honored on read; expired entries behave like misses.
#[derive(Default)]
pub struct MemoryEntitlementCache {
    entries: Mutex<HashMap<String, (EntitlementEntry, std::time::Instant)>>,
}

impl MemoryEntitlementCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntitlementCache for MemoryEntitlementCache {
    async fn get(&self, user_id: &str) -> BillingResult<Option<EntitlementEntry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| BillingError::Cache("cache lock poisoned".to_string()))?;
        Ok(entries.get(user_id).and_then(|(entry, expires_at)| {
            if std::time::Instant::now() < *expires_at {
                Some(entry.clone())
            } else {
                None
            }
        }))
    }

    async fn set(
        &self,
        user_id: &str,
        entry: &EntitlementEntry,
        ttl: Duration,
    ) -> BillingResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BillingError::Cache("cache lock poisoned".to_string()))?;
        entries.insert(
            user_id.to_string(),
            (entry.clone(), std::time::Instant::now() + ttl),
        );
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> BillingResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BillingError::Cache("cache lock poisoned".to_string()))?;
        entries.remove(user_id);
        Ok(())
    }
}

/// Read path: cache-first entitlement decisions with store fallback.
pub struct EntitlementService {
    subscriptions: Arc<dyn SubscriptionStore>,
    cache: Arc<dyn EntitlementCache>,
    ttl: Duration,
}

impl EntitlementService {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        cache: Arc<dyn EntitlementCache>,
        ttl: Duration,
    ) -> Self {
        Self {
            subscriptions,
            cache,
            ttl,
        }
    }

    /// Decide whether `user_id` currently has paid access.
    ///
    /// Cache hit returns the cached decision. A miss derives the decision
    /// from the subscription store and repopulates the cache best-effort.
    pub async fn check(&self, user_id: &str) -> BillingResult<EntitlementEntry> {
        match self.cache.get(user_id).await {
            Ok(Some(entry)) => return Ok(entry),
            Ok(None) => {}
            Err(e) => {
                // Cache trouble must not block the access decision.
                tracing::warn!(user_id, error = %e, "entitlement cache read failed");
            }
        }

        let entry = self.derive(user_id).await?;

        if let Err(e) = self.cache.set(user_id, &entry, self.ttl).await {
            tracing::warn!(user_id, error = %e, "entitlement cache write failed");
        }

        Ok(entry)
    }

    async fn derive(&self, user_id: &str) -> BillingResult<EntitlementEntry> {
        let now = OffsetDateTime::now_utc();
        let Some(row) = self.subscriptions.find_by_user_id(user_id).await? else {
            return Ok(EntitlementEntry::denied(EntitlementCode::SubscriptionRequired));
        };

        if row.entitled(now) {
            return Ok(EntitlementEntry::allowed());
        }

        let code = match row.status {
            // A trial that existed but lapsed, or a canceled subscription.
            SubscriptionStatus::Trialing | SubscriptionStatus::Canceled => {
                EntitlementCode::SubscriptionExpired
            }
            _ => EntitlementCode::SubscriptionRequired,
        };
        Ok(EntitlementEntry::denied(code))
    }
}
