use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("upstream status={status}: {message}")]
    Status {
        status: u16,
        message: String,
        raw: Option<serde_json::Value>,
    },

    #[error("upstream call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("http error: {0}")]
    Transport(String),

    #[error("no reply text in upstream response (status={status})")]
    EmptyReply {
        status: u16,
        raw: Option<serde_json::Value>,
    },
}

/// Diagnostic form of the last upstream failure, attached to fallback replies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl LlmError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } | Self::EmptyReply { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn diagnostic(&self) -> UpstreamError {
        let (message, raw) = match self {
            Self::Status { message, raw, .. } => (message.clone(), raw.clone()),
            Self::EmptyReply { raw, .. } => ("No reply text in response".to_string(), raw.clone()),
            other => (other.to_string(), None),
        };
        UpstreamError {
            status: self.status(),
            message,
            raw,
        }
    }
}

// The request URL is stripped; it never reaches logs or reply diagnostics.
impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.without_url().to_string())
    }
}
