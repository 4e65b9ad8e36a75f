//! Event routing
//!
//! Classifies Creem event types into the handler categories via static
//! membership sets. Membership is exact string match, never a pattern, so a
//! new provider event can never silently land in a mutating category.

/// Handler category for an inbound event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    /// Subscription starts or renews; user gains/keeps paid access.
    Upgrade,
    /// Subscription ends or money comes back; user loses paid access.
    Downgrade,
    /// Cancellation requested, effective at period end. Access unchanged
    /// until then; only the flag and the period end date are recorded.
    ScheduledCancel,
    /// Everything else: logged and acknowledged so the provider stops
    /// retrying, but no state changes.
    Ignored,
}

const UPGRADE_EVENTS: &[&str] = &[
    "checkout.completed",
    "subscription.created",
    "subscription.active",
    "subscription.paid",
    "subscription.updated",
];

const DOWNGRADE_EVENTS: &[&str] = &[
    "subscription.canceled",
    "subscription.expired",
    "refund.created",
    "charge.refunded",
    "dispute.created",
];

// A cancellation request and a cancellation taking effect are different
// events. Conflating them would revoke access the user already paid for
// through the current billing period.
const SCHEDULED_CANCEL_EVENTS: &[&str] = &[
    "subscription.cancel_scheduled",
    "subscription.pending_cancellation",
];

/// Classify an event type string into its handler category.
pub fn classify(event_type: &str) -> EventCategory {
    if UPGRADE_EVENTS.contains(&event_type) {
        EventCategory::Upgrade
    } else if DOWNGRADE_EVENTS.contains(&event_type) {
        EventCategory::Downgrade
    } else if SCHEDULED_CANCEL_EVENTS.contains(&event_type) {
        EventCategory::ScheduledCancel
    } else {
        EventCategory::Ignored
    }
}
