use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/ping", get(ping))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn ping(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "time": Utc::now().timestamp_millis(),
        "provider": state.chat.provider(),
    }))
}
