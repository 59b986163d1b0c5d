//! Upstream generative-text client for relaychat.
//!
//! Pure HTTP client: one Gemini `generateContent` attempt behind
//! [`TextGenerator`], wrapped by [`UpstreamClient`]'s bounded retry loop.

mod client;
mod error;
mod gemini;
mod retry;
mod types;

pub use client::{TextGenerator, UpstreamClient};
pub use error::{LlmError, Result, UpstreamError};
pub use gemini::{DEFAULT_GEMINI_MODEL, DEFAULT_TIMEOUT, GEMINI_BASE_URL, GeminiClient};
pub use retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, RetryPolicy, is_transient};
pub use types::{Role, Turn, clamp_tail};
