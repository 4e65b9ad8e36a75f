//! Subscription and entitlement read endpoints

use axum::extract::State;
use axum::Json;
use promptos_billing::{EntitlementEntry, SubscriptionRecord, SubscriptionStore};
use promptos_shared::{Plan, SubscriptionStatus};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub status: SubscriptionStatus,
    pub plan: Plan,
    #[serde(rename = "cancelAtPeriodEnd")]
    pub cancel_at_period_end: bool,
    #[serde(rename = "currentPeriodEnd", skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<String>,
    #[serde(rename = "trialEnd", skip_serializing_if = "Option::is_none")]
    pub trial_end: Option<String>,
}

impl From<SubscriptionRecord> for SubscriptionResponse {
    fn from(record: SubscriptionRecord) -> Self {
        Self {
            status: record.status,
            plan: record.plan,
            cancel_at_period_end: record.cancel_at_period_end,
            current_period_end: rfc3339(record.current_period_end),
            trial_end: rfc3339(record.trial_end),
        }
    }
}

fn rfc3339(value: Option<OffsetDateTime>) -> Option<String> {
    value.and_then(|t| t.format(&Rfc3339).ok())
}

/// GET /subscription
///
/// Returns the caller's subscription row, creating a trial on first use.
pub async fn get_subscription(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<SubscriptionResponse>> {
    let record = state
        .billing
        .subscriptions
        .create_trial_if_absent(&user.user_id, state.config.trial_days)
        .await?;
    Ok(Json(record.into()))
}

/// GET /entitlement
///
/// Returns the caller's current access decision (cached, short TTL).
pub async fn get_entitlement(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<EntitlementEntry>> {
    let entry = state.billing.entitlements.check(&user.user_id).await?;
    Ok(Json(entry))
}
