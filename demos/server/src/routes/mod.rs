use axum::{extract::State, routing::get, Json, Router};
use rescheduler::backend::Backend;
use serde_json::{json, Value};

use crate::state::AppState;

pub mod jobs;
pub mod trigger;

pub fn router<B: Backend>(state: AppState<B>) -> Router {
    Router::new()
        .route("/health", get(health::<B>))
        .merge(jobs::routes())
        .nest("/trigger", trigger::routes())
        .with_state(state)
}

async fn health<B: Backend>(State(state): State<AppState<B>>) -> Json<Value> {
    let timestamp = state
        .scheduler()
        .map(|scheduler| scheduler.now())
        .unwrap_or_else(|_| chrono::Utc::now());
    Json(json!({ "status": "ok", "timestamp": timestamp }))
}
