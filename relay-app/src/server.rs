//! relaychat server.
//!
//! Builds the process-wide chat state and mounts the API plus the static
//! frontend.

use crate::chat::{ChatError, ChatService};
use crate::config::RelayConfig;
use crate::conversation::ConversationStore;
use crate::rate_limit::RateLimiter;
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::Router;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use relay_llm::{GeminiClient, UpstreamClient};
use std::any::Any;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Created once at startup, dropped at shutdown, never persisted.
pub struct AppState {
    pub chat: ChatService,
}

impl AppState {
    pub fn new(chat: ChatService) -> Self {
        Self { chat }
    }

    pub fn from_config(cfg: &RelayConfig) -> Self {
        let store = ConversationStore::new(cfg.max_turns(), cfg.conversation.max_message_chars);
        let limiter = RateLimiter::new(
            Duration::from_secs(cfg.rate_limit.window_seconds),
            cfg.rate_limit.max_per_window,
        );
        Self::new(ChatService::new(store, limiter, build_upstream(cfg)))
    }
}

fn build_upstream(cfg: &RelayConfig) -> Option<UpstreamClient> {
    let api_key = cfg.api_key()?;
    let gemini = GeminiClient::new(api_key, &cfg.upstream.model)
        .with_base_url(&cfg.upstream.base_url)
        .with_timeout(cfg.upstream_timeout());
    Some(UpstreamClient::gemini(gemini, cfg.retry_policy()))
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let static_dir = PathBuf::from(&cfg.server.static_dir);
    tracing::info!(
        bind_addr = %cfg.bind_addr(),
        provider = if cfg.api_key().is_some() { "gemini" } else { "fallback" },
        model = %cfg.upstream.model,
        upstream_base_url = %cfg.upstream.base_url,
        upstream_timeout_ms = cfg.upstream.timeout_ms,
        upstream_max_attempts = cfg.upstream.max_attempts,
        upstream_worst_case_ms = cfg.retry_policy().worst_case(cfg.upstream_timeout()).as_millis() as u64,
        request_timeout_seconds = cfg.server.request_timeout_seconds,
        static_dir = %static_dir.display(),
        static_dir_exists = static_dir.is_dir(),
        "config ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let addr = cfg.bind_addr();
    tracing::info!(
        bind_addr = %addr,
        gemini_key_detected = cfg.api_key().is_some(),
        model = %cfg.upstream.model,
        upstream_timeout_ms = cfg.upstream.timeout_ms,
        upstream_max_attempts = cfg.upstream.max_attempts,
        upstream_base_delay_ms = cfg.upstream.base_delay_ms,
        conversation_max_history = cfg.conversation.max_history,
        conversation_max_message_chars = cfg.conversation.max_message_chars,
        rate_limit_window_seconds = cfg.rate_limit.window_seconds,
        rate_limit_max_per_window = cfg.rate_limit.max_per_window,
        rate_limit_sweep_interval_seconds = cfg.rate_limit.sweep_interval_seconds,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let state = Arc::new(AppState::from_config(&cfg));
    let shutdown = CancellationToken::new();
    let sweeper = spawn_rate_limit_sweeper(
        state.clone(),
        cfg.rate_limit.sweep_interval_seconds,
        shutdown.child_token(),
    );

    let static_dir = PathBuf::from(&cfg.server.static_dir);
    let static_dir = if static_dir.is_dir() {
        tracing::info!(static_dir = %static_dir.display(), "serving static frontend");
        Some(static_dir)
    } else {
        tracing::warn!(static_dir = %static_dir.display(), "static dir not found; frontend disabled");
        None
    };

    let app = build_router(
        state,
        static_dir,
        Duration::from_secs(cfg.server.request_timeout_seconds),
    );

    tracing::info!(%addr, "relaychat serving");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    if let Some(sweeper) = sweeper {
        if let Err(e) = sweeper.await {
            tracing::error!(error = %e, "rate limit sweeper join failed during shutdown");
        }
    }
    Ok(())
}

pub fn build_router(
    state: Arc<AppState>,
    static_dir: Option<PathBuf>,
    request_timeout: Duration,
) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let mut app = routes::router().layer(Extension(state));
    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(CatchPanicLayer::custom(panic_response))
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

fn spawn_rate_limit_sweeper(
    state: Arc<AppState>,
    interval_seconds: u64,
    shutdown: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval_seconds == 0 {
        tracing::info!("rate limit sweep disabled; records are kept for the process lifetime");
        return None;
    }
    let period = Duration::from_secs(interval_seconds);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let limiter = state.chat.limiter();
                    let removed = limiter.sweep_expired(tokio::time::Instant::now());
                    tracing::debug!(
                        removed,
                        tracked = limiter.tracked_clients(),
                        "rate limit records swept"
                    );
                }
            }
        }
    }))
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic_payload_to_string(payload.as_ref());
    tracing::error!(panic_payload = %message, "request handler panicked");
    ChatError::Internal(message).into_response()
}

pub(crate) fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "Server error".to_string()
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::tests::service;
    use axum::body::{Body, to_bytes};
    use axum::routing::get;
    use serde_json::{Value, json};
    use tower::util::ServiceExt;

    async fn response_json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        serde_json::from_slice(&body).expect("response json")
    }

    #[tokio::test]
    async fn panicking_handler_becomes_500_with_error_body() {
        async fn boom() -> &'static str {
            panic!("kaboom")
        }
        let app = Router::new()
            .route("/boom", get(boom))
            .layer(CatchPanicLayer::custom(panic_response));
        let response = app
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response_json(response).await, json!({ "error": "kaboom" }));
    }

    #[tokio::test]
    async fn responses_carry_a_request_id() {
        let app = build_router(
            Arc::new(AppState::new(service(None, 10))),
            None,
            Duration::from_secs(30),
        );
        let response = app
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[test]
    fn state_from_default_config_is_fallback_only() {
        let state = AppState::from_config(&RelayConfig::default());
        assert_eq!(state.chat.provider(), "fallback");
    }

    #[test]
    fn state_with_api_key_uses_gemini() {
        let mut cfg = RelayConfig::default();
        cfg.upstream.api_key = Some("key".to_string());
        let state = AppState::from_config(&cfg);
        assert_eq!(state.chat.provider(), "gemini");
    }

    #[tokio::test]
    async fn static_files_are_served_for_unmatched_paths() {
        let dir = std::env::temp_dir().join(format!(
            "relaychat-static-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).expect("create static dir");
        std::fs::write(dir.join("index.html"), "<h1>chat</h1>").expect("write index");

        let app = build_router(
            Arc::new(AppState::new(service(None, 10))),
            Some(dir.clone()),
            Duration::from_secs(30),
        );
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&body[..], b"<h1>chat</h1>");

        let _ = std::fs::remove_dir_all(dir);
    }
}
