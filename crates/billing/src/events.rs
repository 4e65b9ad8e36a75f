//! Webhook event payloads
//!
//! Creem payloads are inconsistently nested across event types: the same
//! logical field (user id, product id, customer id) can live in several
//! places depending on whether the event wraps a checkout session, a
//! subscription, or a charge. Instead of re-deriving lookup paths in each
//! handler, every logical field has exactly one declared extraction order
//! here, tried first to last.

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Extraction order for the event id. Providers have shipped all three
/// spellings at one point or another.
const EVENT_ID_PATHS: &[&str] = &["/id", "/event_id", "/eventId"];

/// Extraction order for the event type.
const EVENT_TYPE_PATHS: &[&str] = &["/eventType", "/event_type", "/type"];

/// Extraction order for the owning user id (Supabase user uuid carried in
/// checkout metadata).
const USER_ID_PATHS: &[&str] = &[
    "/object/metadata/user_id",
    "/object/metadata/userId",
    "/object/subscription/metadata/user_id",
    "/object/order/metadata/user_id",
    "/metadata/user_id",
    "/metadata/userId",
];

/// Extraction order for the product id.
const PRODUCT_ID_PATHS: &[&str] = &[
    "/object/product/id",
    "/object/product_id",
    "/object/order/product",
    "/object/subscription/product/id",
    "/product_id",
];

/// Extraction order for the billing customer id.
const CUSTOMER_ID_PATHS: &[&str] = &[
    "/object/customer/id",
    "/object/customer_id",
    "/object/customer",
    "/customer_id",
];

/// Extraction order for the provider subscription id.
const SUBSCRIPTION_ID_PATHS: &[&str] = &[
    "/object/subscription/id",
    "/object/subscription_id",
    "/object/subscription",
    "/object/id",
];

/// Extraction order for an explicit plan hint in metadata.
const PLAN_HINT_PATHS: &[&str] = &[
    "/object/metadata/plan",
    "/object/subscription/metadata/plan",
    "/metadata/plan",
];

/// Extraction order for the current period end on scheduled-cancel events.
const PERIOD_END_PATHS: &[&str] = &[
    "/object/current_period_end_date",
    "/object/current_period_end",
    "/object/currentPeriodEnd",
    "/object/subscription/current_period_end_date",
    "/object/subscription/current_period_end",
];

/// Why a raw body could not be turned into a routable event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The body is not JSON. Retrying will never parse it differently.
    MalformedJson(String),
    /// Valid JSON, but no event id under any known spelling. Without an id the
    /// event cannot be deduplicated, so it is rejected rather than processed
    /// unguarded.
    MissingEventId,
}

/// A parsed webhook event: identity plus the raw payload for field extraction.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    payload: Value,
}

impl WebhookEvent {
    /// Parse the exact bytes received. Signature verification must already
    /// have happened on the same bytes.
    pub fn from_slice(raw: &[u8]) -> Result<Self, ParseError> {
        let payload: Value =
            serde_json::from_slice(raw).map_err(|e| ParseError::MalformedJson(e.to_string()))?;

        let id = first_string(&payload, EVENT_ID_PATHS).ok_or(ParseError::MissingEventId)?;
        let event_type = first_string(&payload, EVENT_TYPE_PATHS).unwrap_or_default();

        Ok(Self {
            id,
            event_type,
            payload,
        })
    }

    #[cfg(test)]
    pub fn from_value(payload: Value) -> Result<Self, ParseError> {
        let raw = serde_json::to_vec(&payload).map_err(|e| ParseError::MalformedJson(e.to_string()))?;
        Self::from_slice(&raw)
    }

    pub fn user_id(&self) -> Option<String> {
        first_string(&self.payload, USER_ID_PATHS)
    }

    pub fn product_id(&self) -> Option<String> {
        first_string(&self.payload, PRODUCT_ID_PATHS)
    }

    pub fn customer_id(&self) -> Option<String> {
        first_string(&self.payload, CUSTOMER_ID_PATHS)
    }

    /// Provider subscription id. Note `/object/id` last: on subscription
    /// events the wrapped object IS the subscription, so its own id applies
    /// when no nested reference exists.
    pub fn subscription_id(&self) -> Option<String> {
        first_string(&self.payload, SUBSCRIPTION_ID_PATHS)
    }

    /// Explicit plan name in metadata, if the checkout carried one.
    pub fn plan_hint(&self) -> Option<String> {
        first_string(&self.payload, PLAN_HINT_PATHS)
    }

    /// Normalized end of the current billing period, if present.
    pub fn period_end(&self) -> Option<OffsetDateTime> {
        PERIOD_END_PATHS
            .iter()
            .filter_map(|path| self.payload.pointer(path))
            .find_map(normalize_period_end)
    }
}

/// Walk the declared paths and return the first non-empty string value.
/// Numeric ids are stringified so `"customer": 42` still resolves.
fn first_string(payload: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| match payload.pointer(path) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Unix timestamps below this are seconds, at or above it milliseconds.
/// 10^12 seconds is the year 33658, far past any plausible period end.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Normalize a provider period-end value into a canonical timestamp.
///
/// Accepts ISO-8601 strings, Unix seconds, and Unix milliseconds; numeric
/// strings get the same magnitude treatment as numbers.
pub fn normalize_period_end(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::Number(n) => from_unix_magnitude(n.as_i64()?),
        Value::String(s) => {
            if let Ok(parsed) = OffsetDateTime::parse(s, &Rfc3339) {
                return Some(parsed);
            }
            from_unix_magnitude(s.trim().parse::<i64>().ok()?)
        }
        _ => None,
    }
}

fn from_unix_magnitude(raw: i64) -> Option<OffsetDateTime> {
    if raw <= 0 {
        return None;
    }
    if raw < MILLIS_THRESHOLD {
        OffsetDateTime::from_unix_timestamp(raw).ok()
    } else {
        OffsetDateTime::from_unix_timestamp(raw / 1000).ok()
    }
}
