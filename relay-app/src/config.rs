//! relaychat configuration loader.
//!
//! Optional TOML file, then environment overrides, then validation.

use relay_llm::{DEFAULT_GEMINI_MODEL, GEMINI_BASE_URL, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "relaychat.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// Directory holding the browser frontend. Served only if it exists.
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_port() -> u16 {
    8000
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_static_dir() -> String {
    "public".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            static_dir: default_static_dir(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Without a key every reply comes from the fallback responder.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_model() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}

fn default_base_url() -> String {
    GEMINI_BASE_URL.to_string()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    800
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConversationConfig {
    /// Exchanges (user + model) kept; the store holds twice as many turns.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

fn default_max_history() -> usize {
    10
}

fn default_max_message_chars() -> usize {
    20_000
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            max_message_chars: default_max_message_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,
    /// How often expired records are dropped. 0 keeps every record forever.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

fn default_window_seconds() -> u64 {
    60 * 60
}

fn default_max_per_window() -> u32 {
    150
}

fn default_sweep_interval_seconds() -> u64 {
    600
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            max_per_window: default_max_per_window(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl RelayConfig {
    /// Loads `path`, or `./relaychat.toml` when present, or built-in defaults.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut cfg = match resolve_config_path(path) {
            Some(path) => {
                let contents = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
                let cfg: RelayConfig = toml::from_str(&contents)
                    .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
                tracing::info!(config_path = %path.display(), "config file loaded");
                cfg
            }
            None => {
                tracing::info!("no config file found; using defaults");
                RelayConfig::default()
            }
        };

        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("PORT") {
            match v.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(e) => tracing::warn!(%e, value = %v, "ignoring invalid PORT"),
            }
        }
        if let Some(v) = non_empty("RELAYCHAT_BIND") {
            match v.trim().parse() {
                Ok(bind) => self.server.bind = bind,
                Err(e) => tracing::warn!(%e, value = %v, "ignoring invalid RELAYCHAT_BIND"),
            }
        }
        if let Some(v) = non_empty("RELAYCHAT_STATIC_DIR") {
            self.server.static_dir = v;
        }
        if let Some(v) = non_empty("GEMINI_API_KEY") {
            self.upstream.api_key = Some(v);
        }
        if let Some(v) = non_empty("GEMINI_MODEL") {
            self.upstream.model = v;
        }
        if let Some(v) = non_empty("GEMINI_BASE_URL") {
            self.upstream.base_url = v;
        }
        if let Some(v) = non_empty("MAX_HISTORY") {
            match v.trim().parse() {
                Ok(n) => self.conversation.max_history = n,
                Err(e) => tracing::warn!(%e, value = %v, "ignoring invalid MAX_HISTORY"),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be > 0"));
        }
        if self.server.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.request_timeout_seconds must be > 0"));
        }
        if self.conversation.max_history == 0 {
            return Err(anyhow::anyhow!("conversation.max_history must be > 0"));
        }
        if self.conversation.max_message_chars == 0 {
            return Err(anyhow::anyhow!("conversation.max_message_chars must be > 0"));
        }
        if self.upstream.max_attempts == 0 {
            return Err(anyhow::anyhow!("upstream.max_attempts must be >= 1"));
        }
        if self.upstream.timeout_ms == 0 {
            return Err(anyhow::anyhow!("upstream.timeout_ms must be > 0"));
        }
        if self.api_key().is_some() && self.upstream.model.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "upstream.model is required when an api key is set"
            ));
        }
        if self.api_key().is_some() {
            // The request timeout must outlast the retry loop so a failing
            // upstream still ends in the fallback reply.
            let budget = self.retry_policy().worst_case(self.upstream_timeout());
            let request_timeout = Duration::from_secs(self.server.request_timeout_seconds);
            if request_timeout <= budget {
                return Err(anyhow::anyhow!(
                    "server.request_timeout_seconds ({}s) must exceed the worst-case upstream time ({}ms)",
                    self.server.request_timeout_seconds,
                    budget.as_millis()
                ));
            }
        }
        if self.rate_limit.window_seconds == 0 {
            return Err(anyhow::anyhow!("rate_limit.window_seconds must be > 0"));
        }
        if self.rate_limit.max_per_window == 0 {
            return Err(anyhow::anyhow!("rate_limit.max_per_window must be > 0"));
        }
        Ok(())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.upstream
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind, self.server.port)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.upstream.max_attempts,
            base_delay: Duration::from_millis(self.upstream.base_delay_ms),
        }
    }

    pub fn max_turns(&self) -> usize {
        self.conversation.max_history.saturating_mul(2)
    }
}

fn resolve_config_path(path: Option<PathBuf>) -> Option<PathBuf> {
    if path.is_some() {
        return path;
    }
    let default = Path::new(DEFAULT_CONFIG_FILE);
    default.exists().then(|| default.to_path_buf())
}
