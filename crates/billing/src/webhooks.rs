//! Creem webhook handling
//!
//! The orchestration state machine for inbound billing events:
//! verify signature -> parse -> identify -> claim -> dispatch -> acknowledge.
//!
//! Per event id the lifecycle is: unclaimed -> claimed -> committed, or
//! unclaimed -> claimed -> released-for-retry. A claim is never left held
//! after a handler failure, and never double-committed; uniqueness is
//! enforced by the ledger's storage layer so concurrent duplicate deliveries
//! are safe.

use std::sync::Arc;

use promptos_shared::Plan;

use crate::config::CreemConfig;
use crate::entitlement::EntitlementCache;
use crate::events::{ParseError, WebhookEvent};
use crate::ledger::{ClaimOutcome, EventLedger};
use crate::router::{classify, EventCategory};
use crate::signature::verify_signature;
use crate::subscriptions::SubscriptionStore;

/// Business reasons an event is acknowledged without mutating anything.
///
/// These are acked with 200 on purpose: the provider re-sends the same
/// payload on retry, so no retry count fixes missing metadata or an
/// unconfigured product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No user id under any known metadata path.
    MissingUserId,
    /// Neither the metadata plan hint nor the product table resolved a plan.
    /// An unresolvable plan must never silently grant an upgrade.
    UnknownPlan,
    /// Scheduled-cancel event without a usable period end value.
    MissingPeriodEnd,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingUserId => "missing_user_id",
            SkipReason::UnknownPlan => "unknown_plan",
            SkipReason::MissingPeriodEnd => "missing_period_end",
        }
    }
}

/// Result of one category handler. Failures are data, not panics, so the
/// orchestrator alone decides between ack and release-for-retry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HandlerOutcome {
    Applied,
    Skipped(SkipReason),
    Failed(String),
}

/// Terminal outcome of processing one delivery. The HTTP layer maps this to
/// a status code and response body; the billing crate stays framework-free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// Handler mutated the subscription store; ack 200.
    Processed { event_id: String, event_type: String },
    /// Event id already in the ledger; ack 200 without reprocessing.
    Deduped { event_id: String },
    /// Business skip; ack 200 with the reason.
    Skipped {
        event_id: String,
        event_type: String,
        reason: SkipReason,
    },
    /// Event type outside every membership set; ack 200.
    Ignored { event_id: String, event_type: String },
    /// Bad or missing signature; 401.
    SignatureInvalid,
    /// No webhook secret configured for the active environment; fail closed
    /// with 500 rather than accept unsigned events.
    SecretMissing,
    /// Body is not JSON; 400, retries cannot help.
    Malformed { detail: String },
    /// No event id; 400, cannot dedupe so the event is rejected unprocessed.
    MissingEventId,
    /// Ledger or store failure; claim released where one was held; 500 so
    /// the provider retries.
    Storage {
        event_id: Option<String>,
        detail: String,
    },
}

/// Webhook orchestrator for Creem billing events.
pub struct WebhookHandler {
    config: CreemConfig,
    ledger: Arc<dyn EventLedger>,
    subscriptions: Arc<dyn SubscriptionStore>,
    cache: Arc<dyn EntitlementCache>,
}

impl WebhookHandler {
    pub fn new(
        config: CreemConfig,
        ledger: Arc<dyn EventLedger>,
        subscriptions: Arc<dyn SubscriptionStore>,
        cache: Arc<dyn EntitlementCache>,
    ) -> Self {
        Self {
            config,
            ledger,
            subscriptions,
            cache,
        }
    }

    /// Process one raw delivery: the exact body bytes and the signature
    /// header value, if any header variant was present.
    pub async fn process(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> WebhookDisposition {
        // 1. Verify against the environment-selected secret.
        let Some(secret) = self.config.active_secret() else {
            tracing::error!("no webhook secret configured for active Creem environment");
            return WebhookDisposition::SecretMissing;
        };
        let Some(signature) = signature_header else {
            tracing::warn!("webhook delivery without signature header");
            return WebhookDisposition::SignatureInvalid;
        };
        if !verify_signature(raw_body, signature, secret) {
            tracing::warn!("webhook signature verification failed");
            return WebhookDisposition::SignatureInvalid;
        }

        // 2-3. Parse and identify.
        let event = match WebhookEvent::from_slice(raw_body) {
            Ok(event) => event,
            Err(ParseError::MalformedJson(detail)) => {
                tracing::warn!(%detail, "webhook body is not valid JSON");
                return WebhookDisposition::Malformed { detail };
            }
            Err(ParseError::MissingEventId) => {
                tracing::warn!("webhook payload carries no event id");
                return WebhookDisposition::MissingEventId;
            }
        };

        // 4. Claim the event id before any handler runs.
        match self.ledger.try_claim(&event.id, &event.event_type).await {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::Duplicate) => {
                return WebhookDisposition::Deduped {
                    event_id: event.id,
                };
            }
            Err(e) => {
                return WebhookDisposition::Storage {
                    event_id: Some(event.id),
                    detail: e.to_string(),
                };
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "processing webhook event"
        );

        // 5. Dispatch.
        let outcome = match classify(&event.event_type) {
            EventCategory::Upgrade => self.handle_upgrade(&event).await,
            EventCategory::Downgrade => self.handle_downgrade(&event).await,
            EventCategory::ScheduledCancel => self.handle_scheduled_cancel(&event).await,
            EventCategory::Ignored => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "unhandled event type, acknowledged without processing"
                );
                return WebhookDisposition::Ignored {
                    event_id: event.id,
                    event_type: event.event_type,
                };
            }
        };

        // 6. Acknowledge, releasing the claim on failure so the provider's
        // retry starts from a clean state.
        match outcome {
            HandlerOutcome::Applied => WebhookDisposition::Processed {
                event_id: event.id,
                event_type: event.event_type,
            },
            HandlerOutcome::Skipped(reason) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    reason = reason.as_str(),
                    "webhook event skipped"
                );
                WebhookDisposition::Skipped {
                    event_id: event.id,
                    event_type: event.event_type,
                    reason,
                }
            }
            HandlerOutcome::Failed(detail) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    %detail,
                    "webhook handler failed, releasing claim for retry"
                );
                if let Err(release_err) = self.ledger.release(&event.id).await {
                    // The claim is now stuck; a provider retry will be deduped
                    // even though the mutation never landed.
                    tracing::error!(
                        event_id = %event.id,
                        error = %release_err,
                        "failed to release webhook claim after handler failure"
                    );
                }
                WebhookDisposition::Storage {
                    event_id: Some(event.id),
                    detail,
                }
            }
        }
    }

    async fn handle_upgrade(&self, event: &WebhookEvent) -> HandlerOutcome {
        let Some(user_id) = event.user_id() else {
            return HandlerOutcome::Skipped(SkipReason::MissingUserId);
        };

        let Some(plan) = self.resolve_plan(event) else {
            return HandlerOutcome::Skipped(SkipReason::UnknownPlan);
        };

        let customer_id = event.customer_id();

        // Checkout-completed events precede subscription creation, so they
        // may carry no subscription id; the event's own id stands in until a
        // later subscription event overwrites it.
        let subscription_id = event.subscription_id().unwrap_or_else(|| {
            tracing::debug!(
                event_id = %event.id,
                "no subscription id in payload, using event id as placeholder"
            );
            event.id.clone()
        });

        if let Err(e) = self
            .subscriptions
            .apply_upgrade(&user_id, plan, customer_id.as_deref(), &subscription_id)
            .await
        {
            return HandlerOutcome::Failed(e.to_string());
        }

        self.bust_cache(&user_id).await;

        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            event_id = %event.id,
            "subscription upgraded"
        );
        HandlerOutcome::Applied
    }

    async fn handle_downgrade(&self, event: &WebhookEvent) -> HandlerOutcome {
        let Some(user_id) = event.user_id() else {
            return HandlerOutcome::Skipped(SkipReason::MissingUserId);
        };

        // A lost downgrade would leave a refunded user with paid access, so
        // write failures are escalated for retry, never swallowed.
        if let Err(e) = self.subscriptions.apply_downgrade(&user_id).await {
            return HandlerOutcome::Failed(e.to_string());
        }

        self.bust_cache(&user_id).await;

        tracing::info!(
            user_id = %user_id,
            event_id = %event.id,
            "subscription downgraded to free"
        );
        HandlerOutcome::Applied
    }

    async fn handle_scheduled_cancel(&self, event: &WebhookEvent) -> HandlerOutcome {
        let Some(user_id) = event.user_id() else {
            return HandlerOutcome::Skipped(SkipReason::MissingUserId);
        };

        let Some(period_end) = event.period_end() else {
            return HandlerOutcome::Skipped(SkipReason::MissingPeriodEnd);
        };

        // Status and plan stay untouched: the user paid through the period.
        if let Err(e) = self
            .subscriptions
            .schedule_cancel(&user_id, period_end)
            .await
        {
            return HandlerOutcome::Failed(e.to_string());
        }

        // Access is unchanged, but busting keeps the cached row fresh for UI
        // display of the pending cancellation date.
        self.bust_cache(&user_id).await;

        tracing::info!(
            user_id = %user_id,
            period_end = %period_end,
            event_id = %event.id,
            "cancellation scheduled for period end"
        );
        HandlerOutcome::Applied
    }

    /// Explicit metadata plan hint first, then the configured product table.
    /// An unknown hint falls through to the table; total failure is a skip,
    /// never a guessed paid plan.
    fn resolve_plan(&self, event: &WebhookEvent) -> Option<Plan> {
        if let Some(hint) = event.plan_hint() {
            if let Ok(plan) = hint.parse::<Plan>() {
                return Some(plan);
            }
            tracing::warn!(event_id = %event.id, hint = %hint, "unrecognized plan hint");
        }
        event
            .product_id()
            .and_then(|product_id| self.config.resolve_plan(&product_id))
    }

    /// Best-effort cache invalidation: failures are logged and swallowed
    /// because the TTL self-heals and a stale entry must not fail the event.
    async fn bust_cache(&self, user_id: &str) {
        if let Err(e) = self.cache.delete(user_id).await {
            tracing::warn!(user_id, error = %e, "failed to bust entitlement cache");
        }
    }
}
