//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.companion/config.json`) and environment.
//! Every field has a default, so a missing file or `{}` is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatch::DispatchOptions;
use crate::session::DEFAULT_HISTORY_LIMIT;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP listener settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Channel settings (e.g. Telegram).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Session store backend and history bound.
    #[serde(default)]
    pub session: SessionConfig,

    /// Worker pool for inbound events.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Language-model endpoint.
    #[serde(default)]
    pub llm: LlmConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the webhook and health endpoints (default 8000).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// Public base URL; the webhook is registered at `{webhookUrl}/telegram`. If unset, long-poll getUpdates is used.
    /// Overridden by WEBHOOK_URL env.
    pub webhook_url: Option<String>,
    /// Optional secret for webhook verification (X-Telegram-Bot-Api-Secret-Token).
    pub webhook_secret: Option<String>,
}

/// Session store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Redis/Valkey connection string. Overridden by REDIS_URL env. Unset or unreachable => in-memory store.
    pub redis_url: Option<String>,
    /// Entries kept per session history (default 4).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Startup probe timeout for the Redis backend in milliseconds (default 2000).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Sessions idle longer than this are removed by `companion sweep` (default 30).
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_retention_days() -> u32 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            history_limit: default_history_limit(),
            probe_timeout_ms: default_probe_timeout_ms(),
            retention_days: default_retention_days(),
        }
    }
}

impl SessionConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Dispatch worker pool config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Worker loops; events for one session always go to the same worker (default 4).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Queued events per worker before submissions are rejected (default 64).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Upper bound for one task including the model call (default 60).
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// How long shutdown waits for in-flight tasks (default 10).
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_task_timeout_secs() -> u64 {
    60
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            task_timeout_secs: default_task_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn options(&self) -> DispatchOptions {
        DispatchOptions {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Model endpoint config (OpenAI-compatible).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    /// Base URL up to `/v1` (default SEA-LION).
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Bearer key. Overridden by SEA_LION_API_KEY env.
    pub api_key: Option<String>,
}

/// Non-empty trimmed env var.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Non-empty trimmed config value.
fn config_value(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    env_value("TELEGRAM_BOT_TOKEN").or_else(|| config_value(&config.channels.telegram.bot_token))
}

/// Resolve the public webhook base URL: env WEBHOOK_URL overrides config. Trailing slashes are removed.
pub fn resolve_webhook_url(config: &Config) -> Option<String> {
    env_value("WEBHOOK_URL")
        .or_else(|| config_value(&config.channels.telegram.webhook_url))
        .map(|u| u.trim_end_matches('/').to_string())
}

/// Webhook secret from config; blank counts as unset.
pub fn resolve_webhook_secret(config: &Config) -> Option<String> {
    config_value(&config.channels.telegram.webhook_secret)
}

/// Resolve the Redis connection string: env REDIS_URL overrides config.
pub fn resolve_redis_url(config: &Config) -> Option<String> {
    env_value("REDIS_URL").or_else(|| config_value(&config.session.redis_url))
}

/// Resolve the model API key: env SEA_LION_API_KEY overrides config.
pub fn resolve_llm_api_key(config: &Config) -> Option<String> {
    env_value("SEA_LION_API_KEY").or_else(|| config_value(&config.llm.api_key))
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("COMPANION_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".companion").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (COMPANION_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_object() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.gateway.port, 8000);
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.session.history_limit, 4);
        assert_eq!(config.session.probe_timeout(), Duration::from_secs(2));
        assert_eq!(config.session.retention_days, 30);
        assert_eq!(config.dispatch.workers, 4);
        assert_eq!(config.dispatch.options().task_timeout, Duration::from_secs(60));
        assert_eq!(config.dispatch.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn camel_case_fields() {
        let config: Config = serde_json::from_str(
            r#"{
                "gateway": { "port": 9000 },
                "channels": { "telegram": { "botToken": "t", "webhookUrl": "https://x.example/", "webhookSecret": "s" } },
                "session": { "redisUrl": "redis://localhost", "historyLimit": 5 },
                "dispatch": { "workers": 2, "taskTimeoutSecs": 5 },
                "llm": { "model": "m" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.channels.telegram.webhook_secret.as_deref(), Some("s"));
        assert_eq!(config.session.history_limit, 5);
        assert_eq!(config.session.redis_url.as_deref(), Some("redis://localhost"));
        assert_eq!(config.dispatch.workers, 2);
        assert_eq!(config.dispatch.queue_capacity, 64);
        assert_eq!(config.llm.model.as_deref(), Some("m"));
    }

    #[test]
    fn blank_values_resolve_to_none() {
        let mut config = Config::default();
        config.llm.api_key = Some("   ".to_string());
        assert_eq!(config_value(&config.llm.api_key), None);
        config.llm.api_key = Some(" k ".to_string());
        assert_eq!(config_value(&config.llm.api_key).as_deref(), Some("k"));
    }

    #[test]
    fn blank_webhook_secret_is_unset() {
        let mut config = Config::default();
        assert_eq!(resolve_webhook_secret(&config), None);
        config.channels.telegram.webhook_secret = Some("  ".to_string());
        assert_eq!(resolve_webhook_secret(&config), None);
        config.channels.telegram.webhook_secret = Some(" s3cret ".to_string());
        assert_eq!(resolve_webhook_secret(&config).as_deref(), Some("s3cret"));
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind(" localhost "));
        assert!(!is_loopback_bind("0.0.0.0"));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join(format!("companion-missing-{}.json", uuid::Uuid::new_v4()));
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.gateway.port, 8000);
    }
}
