use crate::error::Result;
use crate::gemini::GeminiClient;
use crate::retry::RetryPolicy;
use crate::types::Turn;
use async_trait::async_trait;
use std::sync::Arc;

/// A single upstream attempt. Implementations must not retry on their own.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, turns: &[Turn]) -> Result<String>;
}

/// Upstream generator wrapped in the bounded exponential-backoff retry loop.
#[derive(Clone)]
pub struct UpstreamClient {
    provider: String,
    generator: Arc<dyn TextGenerator>,
    policy: RetryPolicy,
}

impl UpstreamClient {
    pub fn new(
        provider: impl Into<String>,
        generator: Arc<dyn TextGenerator>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            provider: provider.into(),
            generator,
            policy,
        }
    }

    pub fn gemini(client: GeminiClient, policy: RetryPolicy) -> Self {
        Self::new("gemini", Arc::new(client), policy)
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = %self.provider))]
    pub async fn call(&self, turns: &[Turn]) -> Result<String> {
        let mut attempt = 0;
        loop {
            let err = match self.generator.generate(turns).await {
                Ok(reply) => {
                    tracing::debug!(attempt = attempt + 1, "upstream reply received");
                    return Ok(reply);
                }
                Err(e) => e,
            };

            if !self.policy.should_retry(attempt, &err) {
                tracing::error!(
                    attempt = attempt + 1,
                    max_attempts = self.policy.max_attempts,
                    status = ?err.status(),
                    error = %err,
                    "upstream call failed"
                );
                return Err(err);
            }

            let backoff = self.policy.delay(attempt);
            tracing::warn!(
                attempt = attempt + 1,
                status = ?err.status(),
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "upstream transient failure; retrying with backoff"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}
