//! Creem webhook endpoint
//!
//! The handler extracts the exact raw body bytes and the signature header,
//! hands them to the billing pipeline, and maps the resulting disposition to
//! an HTTP response. The status code controls whether Creem retries: 2xx
//! acknowledges, 4xx rejects permanently, 5xx asks for a retry.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use promptos_billing::WebhookDisposition;
use serde::Serialize;
use serde_json::{json, Value};

use crate::state::AppState;

/// Header names Creem has used for the webhook signature, checked in order.
const SIGNATURE_HEADERS: &[&str] = &["creem-signature", "x-signature", "webhook-signature"];

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "eventId", skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(rename = "eventType", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookResponse {
    fn ack(message: Option<&str>, event_id: Option<String>, event_type: Option<String>) -> Self {
        Self {
            ok: true,
            message: message.map(str::to_string),
            event_id,
            event_type,
            error: None,
        }
    }

    fn rejection(error: &str) -> Self {
        Self {
            ok: false,
            message: None,
            event_id: None,
            event_type: None,
            error: Some(error.to_string()),
        }
    }
}

fn signature_from(headers: &HeaderMap) -> Option<&str> {
    SIGNATURE_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())
}

/// POST /webhook
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    let disposition = state
        .billing
        .webhooks
        .process(&body, signature_from(&headers))
        .await;

    match disposition {
        WebhookDisposition::Processed {
            event_id,
            event_type,
        } => (
            StatusCode::OK,
            Json(WebhookResponse::ack(None, Some(event_id), Some(event_type))),
        ),
        WebhookDisposition::Deduped { event_id } => (
            StatusCode::OK,
            Json(WebhookResponse::ack(Some("deduped"), Some(event_id), None)),
        ),
        WebhookDisposition::Skipped {
            event_id,
            event_type,
            reason,
        } => (
            StatusCode::OK,
            Json(WebhookResponse::ack(
                Some(reason.as_str()),
                Some(event_id),
                Some(event_type),
            )),
        ),
        WebhookDisposition::Ignored {
            event_id,
            event_type,
        } => (
            StatusCode::OK,
            Json(WebhookResponse::ack(
                Some("ignored"),
                Some(event_id),
                Some(event_type),
            )),
        ),
        WebhookDisposition::SignatureInvalid => (
            StatusCode::UNAUTHORIZED,
            Json(WebhookResponse::rejection("invalid signature")),
        ),
        WebhookDisposition::SecretMissing => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(WebhookResponse::rejection("webhook secret not configured")),
        ),
        WebhookDisposition::Malformed { .. } => (
            StatusCode::BAD_REQUEST,
            Json(WebhookResponse::rejection("malformed payload")),
        ),
        WebhookDisposition::MissingEventId => (
            StatusCode::BAD_REQUEST,
            Json(WebhookResponse::rejection("missing event id")),
        ),
        WebhookDisposition::Storage { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(WebhookResponse::rejection("storage failure")),
        ),
    }
}

/// GET /webhook
///
/// Liveness probe for the webhook URL; Creem's dashboard pings it when the
/// endpoint is registered.
pub async fn liveness() -> Json<Value> {
    Json(json!({ "ok": true }))
}
