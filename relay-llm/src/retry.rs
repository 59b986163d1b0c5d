use crate::error::LlmError;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(800);

static TRANSIENT_MESSAGE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)overload|temporar").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// `attempt` is zero-based. The last attempt never retries.
    pub fn should_retry(&self, attempt: u32, err: &LlmError) -> bool {
        attempt.saturating_add(1) < self.max_attempts && is_transient(err)
    }

    /// Backoff slept after the zero-based `attempt` fails: `base * 2^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1_u32 << attempt.min(16))
    }

    /// Longest a failing call can take: every attempt hits `per_attempt`
    /// and every backoff is slept.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        (0..attempts - 1).fold(per_attempt.saturating_mul(attempts), |total, n| {
            total.saturating_add(self.delay(n))
        })
    }
}

pub fn is_transient(err: &LlmError) -> bool {
    match err {
        LlmError::Status {
            status, message, ..
        } => {
            *status == 429
                || *status == 503
                || TRANSIENT_MESSAGE
                    .as_ref()
                    .is_some_and(|re| re.is_match(message))
        }
        LlmError::Timeout(_) | LlmError::Transport(_) | LlmError::EmptyReply { .. } => true,
        LlmError::InvalidInput(_) => false,
    }
}
