// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge case tests for the webhook pipeline
//!
//! Runs the full orchestration (verify -> parse -> claim -> dispatch -> ack)
//! against the in-memory collaborators, covering idempotency, claim release
//! on failure, scheduled-cancel isolation, plan resolution, and the
//! signature/parse rejection paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use time::OffsetDateTime;

use promptos_shared::{Plan, SubscriptionStatus};

use crate::config::{CreemConfig, CreemMode};
use crate::entitlement::{EntitlementCache, EntitlementEntry, MemoryEntitlementCache};
use crate::error::{BillingError, BillingResult};
use crate::signature::sign;
use crate::subscriptions::{
    MemorySubscriptionStore, SubscriptionRecord, SubscriptionStore,
};
use crate::webhooks::{SkipReason, WebhookDisposition, WebhookHandler};
use crate::{MemoryEventLedger, BillingService};

const SECRET: &str = "whsec_edge_case_tests";

fn test_config() -> CreemConfig {
    let mut products = HashMap::new();
    products.insert("prod_starter".to_string(), Plan::Starter);
    products.insert("prod_pro".to_string(), Plan::Pro);
    CreemConfig::new(CreemMode::Test, None, Some(SECRET.to_string()), products)
}

/// Subscription store that can be switched into a failing mode, for
/// exercising the release-claim-on-failure path.
struct FlakySubscriptionStore {
    inner: MemorySubscriptionStore,
    failing: AtomicBool,
}

impl FlakySubscriptionStore {
    fn new() -> Self {
        Self {
            inner: MemorySubscriptionStore::new(),
            failing: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> BillingResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(BillingError::Database("connection reset".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SubscriptionStore for FlakySubscriptionStore {
    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        self.inner.find_by_user_id(user_id).await
    }

    async fn apply_upgrade(
        &self,
        user_id: &str,
        plan: Plan,
        customer_id: Option<&str>,
        subscription_id: &str,
    ) -> BillingResult<()> {
        self.check()?;
        self.inner
            .apply_upgrade(user_id, plan, customer_id, subscription_id)
            .await
    }

    async fn apply_downgrade(&self, user_id: &str) -> BillingResult<()> {
        self.check()?;
        self.inner.apply_downgrade(user_id).await
    }

    async fn schedule_cancel(
        &self,
        user_id: &str,
        period_end: OffsetDateTime,
    ) -> BillingResult<()> {
        self.check()?;
        self.inner.schedule_cancel(user_id, period_end).await
    }

    async fn create_trial_if_absent(
        &self,
        user_id: &str,
        trial_days: i64,
    ) -> BillingResult<SubscriptionRecord> {
        self.check()?;
        self.inner.create_trial_if_absent(user_id, trial_days).await
    }
}

struct Harness {
    handler: WebhookHandler,
    store: Arc<FlakySubscriptionStore>,
    cache: Arc<MemoryEntitlementCache>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(FlakySubscriptionStore::new());
        let cache = Arc::new(MemoryEntitlementCache::new());
        let handler = WebhookHandler::new(
            test_config(),
            Arc::new(MemoryEventLedger::new()),
            store.clone(),
            cache.clone(),
        );
        Self {
            handler,
            store,
            cache,
        }
    }

    /// Deliver a payload signed with the test secret.
    async fn deliver(&self, payload: &Value) -> WebhookDisposition {
        let body = serde_json::to_vec(payload).unwrap();
        let signature = sign(&body, SECRET);
        self.handler.process(&body, Some(&signature)).await
    }

    async fn row(&self, user_id: &str) -> Option<SubscriptionRecord> {
        self.store.find_by_user_id(user_id).await.unwrap()
    }
}

fn checkout_completed(event_id: &str, user_id: &str, plan: &str) -> Value {
    json!({
        "id": event_id,
        "eventType": "checkout.completed",
        "object": {
            "id": "ch_1",
            "metadata": {"user_id": user_id, "plan": plan},
            "customer": "cus_1",
        },
    })
}

mod idempotency {
    use super::*;

    #[tokio::test]
    async fn same_event_id_applies_once_and_dedupes_after() {
        let harness = Harness::new();
        let payload = checkout_completed("evt_1", "u1", "pro");

        assert!(matches!(
            harness.deliver(&payload).await,
            WebhookDisposition::Processed { .. }
        ));
        let after_first = harness.row("u1").await.unwrap();

        for _ in 0..2 {
            match harness.deliver(&payload).await {
                WebhookDisposition::Deduped { event_id } => assert_eq!(event_id, "evt_1"),
                other => panic!("expected dedupe, got {other:?}"),
            }
        }

        let after_third = harness.row("u1").await.unwrap();
        assert_eq!(after_first.updated_at, after_third.updated_at, "no second write");
        assert_eq!(after_third.plan, Plan::Pro);
    }

    #[tokio::test]
    async fn failed_write_releases_claim_for_fresh_retry() {
        let harness = Harness::new();
        let payload = checkout_completed("evt_1", "u1", "pro");

        harness.store.set_failing(true);
        assert!(matches!(
            harness.deliver(&payload).await,
            WebhookDisposition::Storage { .. }
        ));
        assert!(harness.row("u1").await.is_none());

        // The provider retries the same event id; it must be a fresh claim,
        // not a duplicate.
        harness.store.set_failing(false);
        assert!(matches!(
            harness.deliver(&payload).await,
            WebhookDisposition::Processed { .. }
        ));
        assert_eq!(harness.row("u1").await.unwrap().status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn failed_downgrade_releases_claim_too() {
        let harness = Harness::new();
        harness
            .store
            .apply_upgrade("u1", Plan::Pro, Some("cus_1"), "sub_1")
            .await
            .unwrap();

        let payload = json!({
            "id": "evt_down",
            "eventType": "subscription.canceled",
            "object": {"metadata": {"user_id": "u1"}},
        });

        harness.store.set_failing(true);
        assert!(matches!(
            harness.deliver(&payload).await,
            WebhookDisposition::Storage { .. }
        ));
        // Still on the paid plan; the downgrade was not half-applied.
        assert_eq!(harness.row("u1").await.unwrap().status, SubscriptionStatus::Active);

        harness.store.set_failing(false);
        assert!(matches!(
            harness.deliver(&payload).await,
            WebhookDisposition::Processed { .. }
        ));
        assert_eq!(
            harness.row("u1").await.unwrap().status,
            SubscriptionStatus::Canceled
        );
    }
}

mod upgrades {
    use super::*;

    #[tokio::test]
    async fn checkout_completed_end_to_end() {
        let harness = Harness::new();

        // A stale cache entry exists from an earlier read.
        harness
            .cache
            .set("u1", &EntitlementEntry::denied(
                crate::EntitlementCode::SubscriptionRequired,
            ), Duration::from_secs(300))
            .await
            .unwrap();

        match harness.deliver(&checkout_completed("evt_1", "u1", "pro")).await {
            WebhookDisposition::Processed { event_id, event_type } => {
                assert_eq!(event_id, "evt_1");
                assert_eq!(event_type, "checkout.completed");
            }
            other => panic!("expected processed, got {other:?}"),
        }

        let row = harness.row("u1").await.unwrap();
        assert_eq!(row.status, SubscriptionStatus::Active);
        assert_eq!(row.plan, Plan::Pro);
        assert_eq!(row.billing_customer_id.as_deref(), Some("cus_1"));

        // The mutation busted the cached decision.
        assert_eq!(harness.cache.get("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_product_never_upgrades() {
        let harness = Harness::new();
        let payload = json!({
            "id": "evt_1",
            "eventType": "subscription.active",
            "object": {
                "metadata": {"user_id": "u1"},
                "product": {"id": "prod_mystery"},
            },
        });

        match harness.deliver(&payload).await {
            WebhookDisposition::Skipped { reason, .. } => {
                assert_eq!(reason, SkipReason::UnknownPlan);
            }
            other => panic!("expected skip, got {other:?}"),
        }
        assert!(harness.row("u1").await.is_none(), "no row mutation");
    }

    #[tokio::test]
    async fn product_table_resolves_plan_without_hint() {
        let harness = Harness::new();
        let payload = json!({
            "id": "evt_1",
            "eventType": "subscription.active",
            "object": {
                "id": "sub_9",
                "metadata": {"user_id": "u1"},
                "product": {"id": "prod_starter"},
            },
        });

        assert!(matches!(
            harness.deliver(&payload).await,
            WebhookDisposition::Processed { .. }
        ));
        let row = harness.row("u1").await.unwrap();
        assert_eq!(row.plan, Plan::Starter);
        assert_eq!(row.billing_subscription_id.as_deref(), Some("sub_9"));
    }

    #[tokio::test]
    async fn missing_user_id_is_acked_skip() {
        let harness = Harness::new();
        let payload = json!({
            "id": "evt_1",
            "eventType": "checkout.completed",
            "object": {"metadata": {"plan": "pro"}},
        });

        match harness.deliver(&payload).await {
            WebhookDisposition::Skipped { reason, .. } => {
                assert_eq!(reason, SkipReason::MissingUserId);
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn event_id_stands_in_for_missing_subscription_id() {
        let harness = Harness::new();
        let payload = json!({
            "id": "evt_checkout_77",
            "eventType": "checkout.completed",
            "object": {"metadata": {"user_id": "u1", "plan": "starter"}},
        });

        assert!(matches!(
            harness.deliver(&payload).await,
            WebhookDisposition::Processed { .. }
        ));
        assert_eq!(
            harness.row("u1").await.unwrap().billing_subscription_id.as_deref(),
            Some("evt_checkout_77")
        );
    }

    #[tokio::test]
    async fn later_event_preserves_customer_id() {
        let harness = Harness::new();
        harness
            .deliver(&checkout_completed("evt_1", "u1", "starter"))
            .await;

        // Renewal payload without a customer reference.
        let renewal = json!({
            "id": "evt_2",
            "eventType": "subscription.paid",
            "object": {
                "id": "sub_2",
                "metadata": {"user_id": "u1", "plan": "pro"},
            },
        });
        assert!(matches!(
            harness.deliver(&renewal).await,
            WebhookDisposition::Processed { .. }
        ));

        let row = harness.row("u1").await.unwrap();
        assert_eq!(row.billing_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(row.plan, Plan::Pro);
    }
}

mod scheduled_cancel {
    use super::*;

    fn cancel_payload(period_end: Value) -> Value {
        json!({
            "id": "evt_cancel",
            "eventType": "subscription.cancel_scheduled",
            "object": {
                "metadata": {"user_id": "u1"},
                "current_period_end": period_end,
            },
        })
    }

    #[tokio::test]
    async fn touches_only_cancel_fields() {
        let harness = Harness::new();
        harness
            .deliver(&checkout_completed("evt_up", "u1", "pro"))
            .await;
        let before = harness.row("u1").await.unwrap();

        assert!(matches!(
            harness.deliver(&cancel_payload(json!("2025-01-01T00:00:00Z"))).await,
            WebhookDisposition::Processed { .. }
        ));

        let after = harness.row("u1").await.unwrap();
        assert_eq!(after.status, before.status, "status untouched");
        assert_eq!(after.plan, before.plan, "plan untouched");
        assert!(after.cancel_at_period_end);
        assert_eq!(
            after.current_period_end,
            Some(OffsetDateTime::from_unix_timestamp(1_735_689_600).unwrap())
        );
        // Access is unchanged, so the user stays entitled until period end.
        assert!(after.entitled(OffsetDateTime::now_utc()));
    }

    #[tokio::test]
    async fn seconds_and_millis_store_the_same_instant() {
        for (event_id, period_end) in [
            ("evt_s", json!(1_735_689_600i64)),
            ("evt_ms", json!(1_735_689_600_000i64)),
        ] {
            let harness = Harness::new();
            harness
                .deliver(&checkout_completed("evt_up", "u1", "pro"))
                .await;

            let mut payload = cancel_payload(period_end);
            payload["id"] = json!(event_id);
            assert!(matches!(
                harness.deliver(&payload).await,
                WebhookDisposition::Processed { .. }
            ));

            assert_eq!(
                harness.row("u1").await.unwrap().current_period_end,
                Some(OffsetDateTime::from_unix_timestamp(1_735_689_600).unwrap())
            );
        }
    }

    #[tokio::test]
    async fn unparseable_period_end_is_a_skip() {
        let harness = Harness::new();
        harness
            .deliver(&checkout_completed("evt_up", "u1", "pro"))
            .await;

        match harness.deliver(&cancel_payload(json!("whenever"))).await {
            WebhookDisposition::Skipped { reason, .. } => {
                assert_eq!(reason, SkipReason::MissingPeriodEnd);
            }
            other => panic!("expected skip, got {other:?}"),
        }
        assert!(!harness.row("u1").await.unwrap().cancel_at_period_end);
    }
}

mod rejections {
    use super::*;

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let harness = Harness::new();
        let body = serde_json::to_vec(&checkout_completed("evt_1", "u1", "pro")).unwrap();
        let wrong = sign(&body, "some_other_secret");

        assert_eq!(
            harness.handler.process(&body, Some(&wrong)).await,
            WebhookDisposition::SignatureInvalid
        );
        assert_eq!(
            harness.handler.process(&body, None).await,
            WebhookDisposition::SignatureInvalid
        );
        assert!(harness.row("u1").await.is_none());
    }

    #[tokio::test]
    async fn no_configured_secret_fails_closed() {
        let config = CreemConfig::new(CreemMode::Live, None, None, HashMap::new());
        let handler = WebhookHandler::new(
            config,
            Arc::new(MemoryEventLedger::new()),
            Arc::new(MemorySubscriptionStore::new()),
            Arc::new(MemoryEntitlementCache::new()),
        );

        let body = serde_json::to_vec(&checkout_completed("evt_1", "u1", "pro")).unwrap();
        let signature = sign(&body, SECRET);
        // Even a well-formed signed delivery is refused when no secret is
        // configured: there is nothing trustworthy to verify against.
        assert_eq!(
            handler.process(&body, Some(&signature)).await,
            WebhookDisposition::SecretMissing
        );
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let harness = Harness::new();
        let body = b"{not json";
        let signature = sign(body, SECRET);
        assert!(matches!(
            harness.handler.process(body, Some(&signature)).await,
            WebhookDisposition::Malformed { .. }
        ));
    }

    #[tokio::test]
    async fn missing_event_id_is_rejected() {
        let harness = Harness::new();
        let body = serde_json::to_vec(&json!({
            "eventType": "checkout.completed",
            "object": {"metadata": {"user_id": "u1", "plan": "pro"}},
        }))
        .unwrap();
        let signature = sign(&body, SECRET);
        assert_eq!(
            harness.handler.process(&body, Some(&signature)).await,
            WebhookDisposition::MissingEventId
        );
        assert!(harness.row("u1").await.is_none());
    }

    #[tokio::test]
    async fn unknown_event_type_is_acknowledged_ignored() {
        let harness = Harness::new();
        let payload = json!({
            "id": "evt_1",
            "eventType": "customer.updated",
            "object": {"metadata": {"user_id": "u1"}},
        });
        match harness.deliver(&payload).await {
            WebhookDisposition::Ignored { event_type, .. } => {
                assert_eq!(event_type, "customer.updated");
            }
            other => panic!("expected ignored, got {other:?}"),
        }
        assert!(harness.row("u1").await.is_none());
    }
}

mod service_wiring {
    use super::*;

    #[tokio::test]
    async fn billing_service_shares_one_store_across_paths() {
        let store: Arc<dyn SubscriptionStore> = Arc::new(MemorySubscriptionStore::new());
        let service = BillingService::new(
            test_config(),
            Arc::new(MemoryEventLedger::new()),
            store,
            Arc::new(MemoryEntitlementCache::new()),
        );

        let body =
            serde_json::to_vec(&checkout_completed("evt_1", "u1", "pro")).unwrap();
        let signature = sign(&body, SECRET);
        assert!(matches!(
            service.webhooks.process(&body, Some(&signature)).await,
            WebhookDisposition::Processed { .. }
        ));

        // The read path sees the webhook's mutation.
        let entry = service.entitlements.check("u1").await.unwrap();
        assert!(entry.allowed);
    }
}
