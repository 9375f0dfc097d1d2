//! Persistent storage for messages, channel configuration, cooldowns, auth
//! material, and performance counters.
//!
//! One `Store` trait, two backends: an embedded SQLite file (default) and a
//! networked PostgreSQL server. Selection is by configuration; there is no
//! auto-fallback. The schema is identical across both.
//!
//! Every read and write is keyed by channel where the data is per-channel;
//! there is no query shape that can cross channels.

mod postgres;
mod resilience;
mod sqlite;

pub use postgres::PostgresStore;
pub use resilience::ResilientStore;
pub use sqlite::SqliteStore;

use crate::config::{LimitsConfig, StoreBackend, StoreConfig};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How far back `count_recent` looks when judging context adequacy.
pub const RECENT_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Rows deleted per statement during retention cleanup, to avoid long locks.
pub const CLEANUP_BATCH: u32 = 500;

/// Store errors.
///
/// `Unavailable` is the normal failure mode: the caller must treat the
/// operation as not having happened and move on. `Schema` only occurs at
/// open time and is startup-fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("schema error: {0}")]
    Schema(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl StoreError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Schema(_) => "schema",
        }
    }
}

/// A message about to be appended.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: String,
    pub channel: String,
    pub user_id: String,
    pub user_display_name: String,
    pub content: String,
    pub timestamp_ms: i64,
}

/// A message read back from the store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredMessage {
    pub message_id: String,
    pub channel: String,
    pub user_id: String,
    pub user_display_name: String,
    pub content: String,
    pub timestamp_ms: i64,
}

/// Result of an append: either stored (with the channel's new message count)
/// or a duplicate `message_id` that was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Stored { message_count: i64 },
    Duplicate,
}

/// Global defaults used to synthesize config for channels never seen before.
#[derive(Debug, Clone, Copy)]
pub struct ChannelDefaults {
    pub message_threshold: u32,
    pub spontaneous_cooldown_s: u32,
    pub response_cooldown_s: u32,
    pub context_limit: u32,
}

impl From<&LimitsConfig> for ChannelDefaults {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            message_threshold: limits.message_threshold,
            spontaneous_cooldown_s: limits.spontaneous_cooldown_s,
            response_cooldown_s: limits.response_cooldown_s,
            context_limit: limits.context_limit,
        }
    }
}

/// Per-channel configuration as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub channel: String,
    pub message_threshold: u32,
    pub spontaneous_cooldown_s: u32,
    pub response_cooldown_s: u32,
    pub context_limit: u32,
    /// Per-channel model override; `None` inherits the global default.
    pub model_name: Option<String>,
    pub message_count: i64,
    pub last_spontaneous_ms: Option<i64>,
}

impl ChannelConfig {
    /// Synthesize a config for an unknown channel from global defaults.
    pub fn synthesized(channel: &str, defaults: &ChannelDefaults) -> Self {
        Self {
            channel: channel.to_string(),
            message_threshold: defaults.message_threshold,
            spontaneous_cooldown_s: defaults.spontaneous_cooldown_s,
            response_cooldown_s: defaults.response_cooldown_s,
            context_limit: defaults.context_limit,
            model_name: None,
            message_count: 0,
            last_spontaneous_ms: None,
        }
    }
}

/// A single typed configuration mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigField {
    Threshold(u32),
    SpontaneousCooldown(u32),
    ResponseCooldown(u32),
    ContextLimit(u32),
    Model(Option<String>),
}

impl ConfigField {
    /// Column the field maps to; the column set is closed.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Threshold(_) => "message_threshold",
            Self::SpontaneousCooldown(_) => "spontaneous_cooldown_s",
            Self::ResponseCooldown(_) => "response_cooldown_s",
            Self::ContextLimit(_) => "context_limit",
            Self::Model(_) => "model_name",
        }
    }
}

/// Auth material row. Token fields are stored encrypted; this struct carries
/// whatever bytes the cipher produced (or plaintext when permitted).
#[derive(Debug, Clone)]
pub struct AuthRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at_ms: Option<i64>,
    pub bot_username: Option<String>,
}

/// One performance metric sample.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub channel: String,
    pub kind: String,
    pub value: f64,
    pub timestamp_ms: i64,
}

/// Aggregate over metric samples in a window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricAggregate {
    pub count: u64,
    pub sum: f64,
}

impl MetricAggregate {
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Retention windows for periodic cleanup.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub messages_days: u32,
    pub metrics_days: u32,
    pub cooldowns_days: u32,
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupReport {
    pub messages_deleted: u64,
    pub metrics_deleted: u64,
    pub cooldowns_deleted: u64,
}

/// Durable persistence contract.
///
/// Failure semantics: a write that returns `Unavailable` did NOT happen; a
/// read that returns `Unavailable` must be treated as "no adequate context".
#[async_trait]
pub trait Store: Send + Sync {
    /// Append a message and increment the channel's message count in one
    /// transaction. Idempotent on `message_id`.
    async fn append_message(
        &self,
        msg: &NewMessage,
        defaults: &ChannelDefaults,
    ) -> Result<AppendOutcome, StoreError>;

    /// The most recent `limit` messages for a channel, oldest first.
    async fn recent_messages(
        &self,
        channel: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Number of stored messages for a channel inside [`RECENT_WINDOW`].
    async fn count_recent(&self, channel: &str) -> Result<i64, StoreError>;

    /// Moderation: remove one message. Returns rows removed.
    async fn delete_by_message_id(&self, message_id: &str) -> Result<u64, StoreError>;

    /// Moderation: remove every message a user posted in a channel.
    async fn delete_by_user(&self, channel: &str, user_id: &str) -> Result<u64, StoreError>;

    /// Moderation: remove every message in a channel.
    async fn clear_channel(&self, channel: &str) -> Result<u64, StoreError>;

    /// Per-channel configuration; unknown channels get synthesized defaults
    /// (persisted on first write, not on read).
    async fn channel_config(
        &self,
        channel: &str,
        defaults: &ChannelDefaults,
    ) -> Result<ChannelConfig, StoreError>;

    /// Persist one configuration field, creating the row from defaults first
    /// if the channel has never been written.
    async fn set_channel_field(
        &self,
        channel: &str,
        field: &ConfigField,
        defaults: &ChannelDefaults,
    ) -> Result<(), StoreError>;

    /// Restore a channel's configuration to the global defaults. Counters and
    /// the spontaneous stamp are preserved.
    async fn reset_channel_config(
        &self,
        channel: &str,
        defaults: &ChannelDefaults,
    ) -> Result<(), StoreError>;

    /// Stamp a successful spontaneous emission: `last_spontaneous_at`
    /// advances monotonically and the message counter resets to zero, in one
    /// transaction.
    async fn record_spontaneous(
        &self,
        channel: &str,
        at_ms: i64,
        defaults: &ChannelDefaults,
    ) -> Result<(), StoreError>;

    /// When the bot last responded to this user in this channel.
    async fn user_cooldown(
        &self,
        channel: &str,
        user_id: &str,
    ) -> Result<Option<i64>, StoreError>;

    /// Upsert the user's response stamp.
    async fn stamp_user_cooldown(
        &self,
        channel: &str,
        user_id: &str,
        at_ms: i64,
    ) -> Result<(), StoreError>;

    /// Load the (at most one) auth material row.
    async fn load_auth(&self) -> Result<Option<AuthRecord>, StoreError>;

    /// Replace the auth material row.
    async fn store_auth(&self, record: &AuthRecord) -> Result<(), StoreError>;

    /// Append a batch of metric samples.
    async fn record_metrics(&self, batch: &[MetricSample]) -> Result<(), StoreError>;

    /// Aggregate samples of one kind for one channel inside a window.
    async fn aggregate_metric(
        &self,
        channel: &str,
        kind: &str,
        window: Duration,
    ) -> Result<MetricAggregate, StoreError>;

    /// Retention cleanup in bounded batches. Never touches auth material or
    /// channel configuration.
    async fn cleanup(&self, policy: &RetentionPolicy) -> Result<CleanupReport, StoreError>;

    /// Short backend name for status output.
    fn backend_name(&self) -> &'static str;
}

/// Open the configured backend, run migrations, and wrap it in the
/// fail-fast resilience layer.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn Store>, StoreError> {
    match config.backend {
        StoreBackend::Sqlite => {
            let inner = SqliteStore::open(&config.path, config.max_connections).await?;
            Ok(Arc::new(ResilientStore::new(inner)))
        }
        StoreBackend::Postgres => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| StoreError::Schema("store.url missing for postgres".into()))?;
            let inner = PostgresStore::open(url, config.max_connections).await?;
            Ok(Arc::new(ResilientStore::new(inner)))
        }
    }
}

/// Cutoff timestamp (ms) for a retention window expressed in days.
pub(crate) fn cutoff_ms(now_ms: i64, days: u32) -> i64 {
    now_ms - (days as i64) * 86_400_000
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
