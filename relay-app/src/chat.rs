//! Chat request pipeline: admission, history merge, dispatch, fallback.
//!
//! Only validation and rate-limit failures reach the caller as errors. Every
//! upstream failure degrades to a fallback reply carrying the last upstream
//! error as a diagnostic.

use crate::conversation::ConversationStore;
use crate::fallback;
use crate::history;
use crate::rate_limit::RateLimiter;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_llm::{Turn, UpstreamClient, UpstreamError};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const FALLBACK_PROVIDER: &str = "fallback";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Missing or invalid 'message' in request body.")]
    Validation,

    #[error("Rate limit exceeded. Try later.")]
    RateLimited,

    #[error("{0}")]
    Internal(String),
}

impl ChatError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status_code(), Json(body)).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub reply: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UpstreamError>,
}

#[derive(Debug)]
struct ChatRequest {
    message: String,
    history: Option<Vec<Value>>,
}

impl ChatRequest {
    /// Malformed JSON and a missing, empty or non-string `message` are all
    /// the same validation failure.
    fn parse(body: &[u8]) -> Result<Self, ChatError> {
        let value: Value = serde_json::from_slice(body).map_err(|_| ChatError::Validation)?;
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .ok_or(ChatError::Validation)?
            .to_string();
        let history = value.get("history").and_then(Value::as_array).cloned();
        Ok(Self { message, history })
    }
}

pub struct ChatService {
    store: ConversationStore,
    limiter: RateLimiter,
    upstream: Option<UpstreamClient>,
}

impl ChatService {
    pub fn new(
        store: ConversationStore,
        limiter: RateLimiter,
        upstream: Option<UpstreamClient>,
    ) -> Self {
        Self {
            store,
            limiter,
            upstream,
        }
    }

    pub fn provider(&self) -> &str {
        self.upstream
            .as_ref()
            .map(UpstreamClient::provider)
            .unwrap_or(FALLBACK_PROVIDER)
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[tracing::instrument(level = "info", skip_all, fields(client_id = %client_id))]
    pub async fn handle(&self, client_id: &str, body: &[u8]) -> Result<ChatReply, ChatError> {
        if !self.limiter.admit(client_id) {
            tracing::warn!("chat request rejected by rate limiter");
            return Err(ChatError::RateLimited);
        }

        let request = ChatRequest::parse(body)?;

        if let Some(entries) = request.history.as_deref() {
            let turns = history::normalize(entries, self.store.max_message_chars());
            let normalized = turns.len();
            let appended = self.store.merge(turns).await;
            tracing::debug!(
                received = entries.len(),
                normalized,
                appended,
                "client history merged"
            );
        }

        let turns = self
            .store
            .append_and_snapshot(Turn::user(request.message.as_str()))
            .await;

        let Some(upstream) = self.upstream.as_ref() else {
            return Ok(self.reply_with_fallback(&request.message, None).await);
        };

        match upstream.call(&turns).await {
            Ok(reply) => {
                self.store.append(Turn::assistant(reply.as_str())).await;
                tracing::info!(
                    provider = upstream.provider(),
                    reply_chars = reply.chars().count(),
                    "chat reply from upstream"
                );
                Ok(ChatReply {
                    reply,
                    provider: upstream.provider().to_string(),
                    error: None,
                })
            }
            Err(e) => {
                let diagnostic = e.diagnostic();
                tracing::warn!(
                    provider = upstream.provider(),
                    status = ?diagnostic.status,
                    error = %diagnostic.message,
                    "upstream failed; returning fallback reply"
                );
                Ok(self
                    .reply_with_fallback(&request.message, Some(diagnostic))
                    .await)
            }
        }
    }

    async fn reply_with_fallback(
        &self,
        message: &str,
        error: Option<UpstreamError>,
    ) -> ChatReply {
        let reply = fallback::reply(message);
        self.store.append(Turn::assistant(reply)).await;
        ChatReply {
            reply: reply.to_string(),
            provider: FALLBACK_PROVIDER.to_string(),
            error,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_llm::{LlmError, RetryPolicy, TextGenerator};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;

    pub(crate) struct ScriptedUpstream {
        outcomes: Mutex<VecDeque<relay_llm::Result<String>>>,
        pub(crate) calls: Mutex<Vec<(Instant, Vec<Turn>)>>,
    }

    impl ScriptedUpstream {
        pub(crate) fn new(outcomes: Vec<relay_llm::Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedUpstream {
        async fn generate(&self, turns: &[Turn]) -> relay_llm::Result<String> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((Instant::now(), turns.to_vec()));
            self.outcomes
                .lock()
                .expect("outcomes lock")
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Transport("script exhausted".to_string())))
        }
    }

    pub(crate) fn status(code: u16) -> relay_llm::Result<String> {
        Err(LlmError::Status {
            status: code,
            message: format!("HTTP {code}"),
            raw: Some(json!({ "error": { "code": code } })),
        })
    }

    pub(crate) fn service(upstream: Option<Arc<ScriptedUpstream>>, max_per_window: u32) -> ChatService {
        ChatService::new(
            ConversationStore::new(20, 20_000),
            RateLimiter::new(Duration::from_secs(3600), max_per_window),
            upstream.map(|u| UpstreamClient::new("gemini", u, RetryPolicy::default())),
        )
    }

    fn body(value: Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    #[tokio::test]
    async fn without_upstream_every_reply_is_fallback() {
        let svc = service(None, 10);
        let reply = svc
            .handle("c", &body(json!({ "message": "hello there" })))
            .await
            .expect("reply");
        assert_eq!(reply.reply, fallback::GREETING_REPLY);
        assert_eq!(reply.provider, "fallback");
        assert!(reply.error.is_none());
        assert_eq!(
            svc.store().snapshot().await,
            vec![Turn::user("hello there"), Turn::assistant(fallback::GREETING_REPLY)]
        );
    }

    #[tokio::test]
    async fn missing_or_invalid_message_is_rejected_without_touching_the_store() {
        let svc = service(None, 10);
        for raw in [
            body(json!({ "history": [{ "role": "user", "content": "x" }] })),
            body(json!({ "message": 42 })),
            body(json!({ "message": "" })),
            b"not json".to_vec(),
        ] {
            let err = svc.handle("c", &raw).await.expect_err("invalid");
            assert!(matches!(err, ChatError::Validation));
        }
        assert_eq!(svc.store().turn_count().await, 0);
    }

    #[tokio::test]
    async fn rate_limited_client_is_rejected_before_validation() {
        let svc = service(None, 1);
        svc.handle("c", &body(json!({ "message": "hi" })))
            .await
            .expect("first");
        let err = svc
            .handle("c", &body(json!({ "message": "hi" })))
            .await
            .expect_err("second");
        assert!(matches!(err, ChatError::RateLimited));

        let err = svc.handle("c", b"garbage").await.expect_err("third");
        assert!(matches!(err, ChatError::RateLimited));
        assert!(svc.handle("other", &body(json!({ "message": "hi" }))).await.is_ok());
    }

    #[tokio::test]
    async fn history_merge_dedups_only_against_the_last_stored_turn() {
        let svc = service(None, 10);
        svc.handle("c", &body(json!({ "message": "hello" })))
            .await
            .expect("first");

        // A full replay starts with a turn that differs from the stored tail.
        let history = json!([
            { "role": "user", "content": "hello" },
            { "role": "assistant", "content": fallback::GREETING_REPLY },
        ]);
        svc.handle("c", &body(json!({ "message": "thanks", "history": history })))
            .await
            .expect("second");

        assert_eq!(
            svc.store().snapshot().await,
            vec![
                Turn::user("hello"),
                Turn::assistant(fallback::GREETING_REPLY),
                Turn::user("hello"),
                Turn::assistant(fallback::GREETING_REPLY),
                Turn::user("thanks"),
                Turn::assistant(fallback::THANKS_REPLY),
            ]
        );
    }

    #[tokio::test]
    async fn replayed_history_matching_the_last_turn_is_skipped() {
        let svc = service(None, 10);
        svc.handle("c", &body(json!({ "message": "hello" })))
            .await
            .expect("first");
        let history = json!([{ "role": "bot", "content": fallback::GREETING_REPLY }]);
        svc.handle("c", &body(json!({ "message": "xyzzy", "history": history })))
            .await
            .expect("second");
        assert_eq!(svc.store().turn_count().await, 4);
    }

    #[tokio::test]
    async fn over_cap_message_is_stored_as_its_trailing_suffix() {
        let svc = ChatService::new(
            ConversationStore::new(20, 8),
            RateLimiter::new(Duration::from_secs(3600), 10),
            None,
        );
        svc.handle("c", &body(json!({ "message": "0123456789abcdef" })))
            .await
            .expect("reply");
        let stored = svc.store().snapshot().await;
        assert_eq!(stored[0], Turn::user("89abcdef"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_upstream_failures_are_retried_then_succeed() {
        let upstream = ScriptedUpstream::new(vec![
            status(503),
            status(503),
            Ok("from gemini".to_string()),
        ]);
        let svc = service(Some(upstream.clone()), 10);

        let reply = svc
            .handle("c", &body(json!({ "message": "hi" })))
            .await
            .expect("reply");
        assert_eq!(
            reply,
            ChatReply {
                reply: "from gemini".to_string(),
                provider: "gemini".to_string(),
                error: None,
            }
        );

        let calls = upstream.calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1].0 - calls[0].0;
        let second_gap = calls[2].0 - calls[1].0;
        assert_eq!(first_gap, Duration::from_millis(800));
        assert_eq!(second_gap, first_gap * 2);
        assert_eq!(calls[0].1, vec![Turn::user("hi")]);
        drop(calls);

        assert_eq!(
            svc.store().snapshot().await,
            vec![Turn::user("hi"), Turn::assistant("from gemini")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_upstream_failure_degrades_to_fallback_with_diagnostic() {
        let upstream = ScriptedUpstream::new(vec![status(500), status(500), status(500)]);
        let svc = service(Some(upstream.clone()), 10);

        let reply = svc
            .handle("c", &body(json!({ "message": "xyzzy" })))
            .await
            .expect("fallback reply, not an error");
        assert_eq!(reply.provider, "fallback");
        assert_eq!(reply.reply, fallback::DEFLECTION_REPLY);
        let error = reply.error.expect("diagnostic attached");
        assert_eq!(error.status, Some(500));
        assert_eq!(error.message, "HTTP 500");
        assert!(error.raw.is_some());

        assert_eq!(
            svc.store().snapshot().await.last(),
            Some(&Turn::assistant(fallback::DEFLECTION_REPLY))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_payload_is_the_whole_trimmed_store() {
        let upstream = ScriptedUpstream::new(vec![Ok("one".to_string()), Ok("two".to_string())]);
        let svc = service(Some(upstream.clone()), 10);
        svc.handle("c", &body(json!({ "message": "first" })))
            .await
            .expect("first");
        svc.handle("c", &body(json!({ "message": "second" })))
            .await
            .expect("second");

        let calls = upstream.calls.lock().expect("calls lock");
        assert_eq!(
            calls[1].1,
            vec![
                Turn::user("first"),
                Turn::assistant("one"),
                Turn::user("second"),
            ]
        );
    }
}
