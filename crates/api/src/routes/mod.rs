//! HTTP routes

pub mod subscription;
pub mod webhook;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(webhook::liveness).post(webhook::receive))
        .route("/subscription", get(subscription::get_subscription))
        .route("/entitlement", get(subscription::get_entitlement))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
