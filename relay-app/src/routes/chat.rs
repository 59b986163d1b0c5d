use crate::client_ip::client_id;
use crate::server::AppState;
use axum::http::{Extensions, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use bytes::Bytes;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/chat", post(post_chat))
}

// Raw body: the rate limit is checked before the payload is validated.
#[tracing::instrument(level = "info", skip_all)]
async fn post_chat(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Response {
    let client = client_id(&headers, &extensions);
    match state.chat.handle(&client, &body).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => e.into_response(),
    }
}
