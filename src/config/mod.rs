//! Configuration loading and management.
//!
//! This module provides structured configuration for clank, including:
//! - Store backend selection and connection parameters
//! - Generator endpoint, default model, and deadline
//! - Chat credentials, channel list, and known-bot names
//! - Content filter settings
//! - Initial per-channel limits and retention windows

mod defaults;
mod validation;

use defaults::*;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

pub use validation::validate;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Store backend selection and connection parameters.
    #[serde(default)]
    pub store: StoreConfig,
    /// Generator client settings.
    pub generator: GeneratorConfig,
    /// Chat network settings and credentials.
    pub chat: ChatConfig,
    /// Content filter settings.
    #[serde(default)]
    pub filter: FilterConfig,
    /// Initial per-channel limits (used until a channel is configured in chat).
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Retention windows and cleanup cadence.
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Token encryption settings.
    #[serde(default)]
    pub security: SecurityConfig,
    /// Logging knobs.
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        validate(&config)?;
        Ok(config)
    }
}

/// Which persistent store backs the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Embedded single-file store (default).
    Sqlite,
    /// Networked relational store.
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// File path for the embedded backend.
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Connection URL for the networked backend.
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: default_store_path(),
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator_base_url")]
    pub base_url: String,
    /// Global default model; validated against the catalog at startup.
    pub default_model: String,
    #[serde(default = "default_generator_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_server")]
    pub server: String,
    #[serde(default = "default_chat_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    pub client_id: String,
    pub client_secret: String,
    /// OAuth token endpoint used for the single startup refresh.
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Channels to join at startup.
    pub channels: Vec<String>,
    /// Author names always ignored, case-insensitive (extends the built-in list).
    #[serde(default)]
    pub known_bots: Vec<String>,
    /// Bot account name; required on the first run, afterwards the stored
    /// auth material is authoritative.
    pub bot_username: Option<String>,
    /// Optional first-run token seed; the store copy is authoritative afterwards.
    pub initial_access_token: Option<String>,
    pub initial_refresh_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_blocked_terms_file")]
    pub blocked_terms_file: String,
    /// Substring matching on top of token matching.
    #[serde(default)]
    pub strict: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked_terms_file: default_blocked_terms_file(),
            strict: false,
        }
    }
}

/// Initial per-channel limits, applied when a channel has no stored config.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_message_threshold")]
    pub message_threshold: u32,
    #[serde(default = "default_spontaneous_cooldown_s")]
    pub spontaneous_cooldown_s: u32,
    #[serde(default = "default_response_cooldown_s")]
    pub response_cooldown_s: u32,
    #[serde(default = "default_context_limit")]
    pub context_limit: u32,
    /// Per-channel event queue depth; overflow drops the oldest event.
    #[serde(default = "default_mailbox_depth")]
    pub mailbox_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            message_threshold: default_message_threshold(),
            spontaneous_cooldown_s: default_spontaneous_cooldown_s(),
            response_cooldown_s: default_response_cooldown_s(),
            context_limit: default_context_limit(),
            mailbox_depth: default_mailbox_depth(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_messages_days")]
    pub messages_days: u32,
    #[serde(default = "default_metrics_days")]
    pub metrics_days: u32,
    #[serde(default = "default_cooldowns_days")]
    pub cooldowns_days: u32,
    #[serde(default = "default_cleanup_interval_minutes")]
    pub cleanup_interval_minutes: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            messages_days: default_messages_days(),
            metrics_days: default_metrics_days(),
            cooldowns_days: default_cooldowns_days(),
            cleanup_interval_minutes: default_cleanup_interval_minutes(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// Base64-encoded 32-byte key for token encryption at rest.
    pub token_encryption_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `console` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r##"
            [generator]
            default_model = "llama3.2"

            [chat]
            client_id = "abc"
            client_secret = "def"
            channels = ["#somechan"]
        "##
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.path, "clank.db");
        assert_eq!(config.generator.timeout_secs, 30);
        assert_eq!(config.limits.message_threshold, 30);
        assert_eq!(config.limits.context_limit, 200);
        assert_eq!(config.retention.cleanup_interval_minutes, 60);
        assert!(config.filter.enabled);
        assert!(!config.filter.strict);
        assert_eq!(config.log.format, "console");
    }

    #[test]
    fn backend_selection_parses() {
        let toml_str = format!(
            "{}\n[store]\nbackend = \"postgres\"\nurl = \"postgres://c@localhost/clank\"",
            minimal_toml()
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Postgres);
        assert!(config.store.url.is_some());
    }
}
