//! Subscription store
//!
//! One row per user, upserted on `user_id`. Rows are created as trials on
//! first authenticated use and afterwards mutated only by webhook handlers.
//! They are never deleted.
//!
//! There is no cross-field transactional consistency between concurrent
//! handlers for the same user; each typed mutation is a single atomic
//! statement and the last write wins, which is an accepted limitation of the
//! webhook ordering model.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use promptos_shared::{Plan, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};

/// A user's subscription row.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRecord {
    pub user_id: String,
    pub status: SubscriptionStatus,
    pub plan: Plan,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Whether this row grants paid access right now.
    pub fn entitled(&self, now: OffsetDateTime) -> bool {
        match self.status {
            SubscriptionStatus::Active => true,
            SubscriptionStatus::Trialing => {
                self.trial_end.map(|end| end > now).unwrap_or(false)
            }
            SubscriptionStatus::Canceled | SubscriptionStatus::Inactive => false,
        }
    }
}

/// Typed mutations over the subscriptions table.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>>;

    /// Upsert the row to an active paid subscription.
    ///
    /// When `customer_id` is `None` the previously stored customer id is
    /// preserved, never overwritten with null; checkout payloads sometimes
    /// omit the customer reference that an earlier event already supplied.
    async fn apply_upgrade(
        &self,
        user_id: &str,
        plan: Plan,
        customer_id: Option<&str>,
        subscription_id: &str,
    ) -> BillingResult<()>;

    /// Revoke paid access: status=canceled, plan=free.
    async fn apply_downgrade(&self, user_id: &str) -> BillingResult<()>;

    /// Record a cancellation scheduled for period end. Touches only
    /// `cancel_at_period_end` and `current_period_end`; status and plan stay
    /// exactly as they were because the user keeps access through the period.
    async fn schedule_cancel(
        &self,
        user_id: &str,
        period_end: OffsetDateTime,
    ) -> BillingResult<()>;

    /// Create a trial row on first authenticated use; a no-op when the row
    /// already exists. Returns the current row either way.
    async fn create_trial_if_absent(
        &self,
        user_id: &str,
        trial_days: i64,
    ) -> BillingResult<SubscriptionRecord>;
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    user_id: String,
    status: String,
    plan: String,
    billing_customer_id: Option<String>,
    billing_subscription_id: Option<String>,
    cancel_at_period_end: bool,
    current_period_end: Option<OffsetDateTime>,
    trial_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(SubscriptionRecord {
            status: SubscriptionStatus::from_str(&row.status)
                .map_err(|e| BillingError::Database(e.to_string()))?,
            plan: Plan::from_str(&row.plan)
                .map_err(|e| BillingError::Database(e.to_string()))?,
            user_id: row.user_id,
            billing_customer_id: row.billing_customer_id,
            billing_subscription_id: row.billing_subscription_id,
            cancel_at_period_end: row.cancel_at_period_end,
            current_period_end: row.current_period_end,
            trial_start: row.trial_start,
            trial_end: row.trial_end,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = "user_id, status, plan, billing_customer_id, \
     billing_subscription_id, cancel_at_period_end, current_period_end, \
     trial_start, trial_end, updated_at";

/// Postgres-backed subscription store.
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscriptions WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        self.fetch(user_id).await
    }

    async fn apply_upgrade(
        &self,
        user_id: &str,
        plan: Plan,
        customer_id: Option<&str>,
        subscription_id: &str,
    ) -> BillingResult<()> {
        // COALESCE keeps the stored customer id when the payload had none.
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (user_id, status, plan, billing_customer_id, billing_subscription_id, updated_at)
            VALUES ($1, 'active', $2, $3, $4, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                status = 'active',
                plan = EXCLUDED.plan,
                billing_customer_id =
                    COALESCE(EXCLUDED.billing_customer_id, subscriptions.billing_customer_id),
                billing_subscription_id = EXCLUDED.billing_subscription_id,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(plan.as_str())
        .bind(customer_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_downgrade(&self, user_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (user_id, status, plan, updated_at)
            VALUES ($1, 'canceled', 'free', NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                status = 'canceled',
                plan = 'free',
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn schedule_cancel(
        &self,
        user_id: &str,
        period_end: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = TRUE,
                current_period_end = $2,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(period_end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_trial_if_absent(
        &self,
        user_id: &str,
        trial_days: i64,
    ) -> BillingResult<SubscriptionRecord> {
        let now = OffsetDateTime::now_utc();
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (user_id, status, plan, trial_start, trial_end, updated_at)
            VALUES ($1, 'trialing', 'free', $2, $3, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(now + Duration::days(trial_days))
        .execute(&self.pool)
        .await?;

        self.fetch(user_id).await?.ok_or_else(|| {
            BillingError::Database(format!(
                "subscription row missing after trial upsert: {user_id}"
            ))
        })
    }
}

/// In-memory subscription store for tests and local development.
#[derive(Default)]
pub struct MemorySubscriptionStore {
    rows: Mutex<HashMap<String, SubscriptionRecord>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_rows<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, SubscriptionRecord>) -> T,
    ) -> BillingResult<T> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| BillingError::Database("subscription lock poisoned".to_string()))?;
        Ok(f(&mut rows))
    }
}

fn blank_row(user_id: &str, now: OffsetDateTime) -> SubscriptionRecord {
    SubscriptionRecord {
        user_id: user_id.to_string(),
        status: SubscriptionStatus::Inactive,
        plan: Plan::Free,
        billing_customer_id: None,
        billing_subscription_id: None,
        cancel_at_period_end: false,
        current_period_end: None,
        trial_start: None,
        trial_end: None,
        updated_at: now,
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        self.with_rows(|rows| rows.get(user_id).cloned())
    }

    async fn apply_upgrade(
        &self,
        user_id: &str,
        plan: Plan,
        customer_id: Option<&str>,
        subscription_id: &str,
    ) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        self.with_rows(|rows| {
            let entry = rows
                .entry(user_id.to_string())
                .or_insert_with(|| blank_row(user_id, now));
            entry.status = SubscriptionStatus::Active;
            entry.plan = plan;
            if let Some(customer) = customer_id {
                entry.billing_customer_id = Some(customer.to_string());
            }
            entry.billing_subscription_id = Some(subscription_id.to_string());
            entry.updated_at = now;
        })
    }

    async fn apply_downgrade(&self, user_id: &str) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        self.with_rows(|rows| {
            let entry = rows
                .entry(user_id.to_string())
                .or_insert_with(|| blank_row(user_id, now));
            entry.status = SubscriptionStatus::Canceled;
            entry.plan = Plan::Free;
            entry.updated_at = now;
        })
    }

    async fn schedule_cancel(
        &self,
        user_id: &str,
        period_end: OffsetDateTime,
    ) -> BillingResult<()> {
        self.with_rows(|rows| {
            if let Some(entry) = rows.get_mut(user_id) {
                entry.cancel_at_period_end = true;
                entry.current_period_end = Some(period_end);
                entry.updated_at = OffsetDateTime::now_utc();
            }
        })
    }

    async fn create_trial_if_absent(
        &self,
        user_id: &str,
        trial_days: i64,
    ) -> BillingResult<SubscriptionRecord> {
        let now = OffsetDateTime::now_utc();
        self.with_rows(|rows| {
            rows.entry(user_id.to_string())
                .or_insert_with(|| SubscriptionRecord {
                    user_id: user_id.to_string(),
                    status: SubscriptionStatus::Trialing,
                    plan: Plan::Free,
                    billing_customer_id: None,
                    billing_subscription_id: None,
                    cancel_at_period_end: false,
                    current_period_end: None,
                    trial_start: Some(now),
                    trial_end: Some(now + Duration::days(trial_days)),
                    updated_at: now,
                })
                .clone()
        })
    }
}
