//! HTTP surface, split by domain. All `/api` routes resolve the caller
//! principal; `/` and `/health` stay open for probes.

pub mod chat;
pub mod connections;
mod errors;

use crate::state::AppState;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(core_router())
        .merge(chat::router())
        .merge(connections::router())
        .with_state(state)
}

fn core_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(|| async { "dbchat API" }))
        .route(
            "/health",
            get(|| async { Json(json!({ "status": "ok" })) }),
        )
}
