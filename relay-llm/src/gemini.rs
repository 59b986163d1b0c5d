use crate::client::TextGenerator;
use crate::error::{LlmError, Result};
use crate::types::Turn;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "models/gemini-2.5-flash";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
const API_KEY_HEADER: &str = "x-goog-api-key";

/// One `generateContent` call per `generate`; retries live in `UpstreamClient`.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl GeminiClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}:generateContent",
            self.base_url,
            self.model.trim_start_matches('/')
        )
    }

    async fn send(&self, req: &GeminiRequest) -> Result<String> {
        let response = self
            .http
            .post(self.endpoint())
            .header(API_KEY_HEADER, &self.api_key)
            .json(req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let data: Option<serde_json::Value> = serde_json::from_str(&body).ok();

        if !status.is_success() {
            let message = data
                .as_ref()
                .and_then(|d| d.pointer("/error/message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .or_else(|| data.as_ref().map(|d| d.to_string()))
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(LlmError::Status {
                status: status.as_u16(),
                message,
                raw: data,
            });
        }

        let reply = data
            .as_ref()
            .and_then(|d| serde_json::from_value::<GeminiResponse>(d.clone()).ok())
            .and_then(GeminiResponse::into_reply_text);
        reply.ok_or(LlmError::EmptyReply {
            status: status.as_u16(),
            raw: data,
        })
    }
}

#[async_trait::async_trait]
impl TextGenerator for GeminiClient {
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model, turns = turns.len()))]
    async fn generate(&self, turns: &[Turn]) -> Result<String> {
        if turns.is_empty() {
            return Err(LlmError::InvalidInput(
                "gemini request needs at least one turn".to_string(),
            ));
        }
        let req = GeminiRequest::new(turns);
        // Dropping the send future on elapse aborts the in-flight request.
        match tokio::time::timeout(self.timeout, self.send(&req)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout)),
        }
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

impl GeminiRequest {
    fn new(turns: &[Turn]) -> Self {
        Self {
            contents: turns
                .iter()
                .map(|t| GeminiContent {
                    role: t.role.as_gemini().to_string(),
                    parts: vec![GeminiPart {
                        text: t.text.clone(),
                    }],
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiCandidateContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

impl GeminiResponse {
    fn into_reply_text(self) -> Option<String> {
        let part = self
            .candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .next()?;
        Some(part.text).filter(|t| !t.is_empty())
    }
}
