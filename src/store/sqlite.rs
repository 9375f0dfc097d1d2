//! Embedded single-file store backed by SQLite.

use super::{
    AppendOutcome, AuthRecord, ChannelConfig, ChannelDefaults, CleanupReport, ConfigField,
    MetricAggregate, MetricSample, NewMessage, RetentionPolicy, Store, StoredMessage, StoreError,
    CLEANUP_BATCH, RECENT_WINDOW,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Idempotent schema, applied at every open.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id TEXT NOT NULL UNIQUE,
        channel TEXT NOT NULL,
        user_id TEXT NOT NULL,
        user_display_name TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp_ms INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_channel_ts ON messages(channel, timestamp_ms)",
    "CREATE INDEX IF NOT EXISTS idx_messages_channel_user ON messages(channel, user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS channel_configs (
        channel TEXT PRIMARY KEY,
        message_threshold INTEGER NOT NULL,
        spontaneous_cooldown_s INTEGER NOT NULL,
        response_cooldown_s INTEGER NOT NULL,
        context_limit INTEGER NOT NULL,
        model_name TEXT,
        message_count INTEGER NOT NULL DEFAULT 0,
        last_spontaneous_ms INTEGER,
        created_ms INTEGER NOT NULL,
        updated_ms INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_response_cooldowns (
        channel TEXT NOT NULL,
        user_id TEXT NOT NULL,
        last_response_ms INTEGER NOT NULL,
        PRIMARY KEY (channel, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS auth_material (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        access_token TEXT NOT NULL,
        refresh_token TEXT,
        expires_at_ms INTEGER,
        bot_username TEXT,
        updated_ms INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        channel TEXT NOT NULL,
        kind TEXT NOT NULL,
        value REAL NOT NULL,
        timestamp_ms INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_metrics_channel_kind_ts ON metrics(channel, kind, timestamp_ms)",
];

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connection acquire timeout - a slow store must reject fast, not block
    /// the event loop.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Open (creating if missing) and apply the schema.
    pub async fn open(path: &str, max_connections: u32) -> Result<Self, StoreError> {
        let memory = path == ":memory:";
        let options = if memory {
            // Each `:memory:` open gets its own shared-cache database, kept
            // alive by pinning one connection in the pool.
            static MEMORY_SEQ: std::sync::atomic::AtomicU64 =
                std::sync::atomic::AtomicU64::new(0);
            let seq = MEMORY_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            SqliteConnectOptions::new()
                .filename(format!("file:clank-mem-{seq}?mode=memory"))
                .shared_cache(true)
                .create_if_missing(true)
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        tracing::warn!(path = %parent.display(), error = %e, "Failed to create store directory");
                    }
                }
            }
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(if memory { 1 } else { 0 })
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .idle_timeout(Some(Self::IDLE_TIMEOUT))
            .test_before_acquire(true)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Schema(format!("failed to open sqlite store: {e}")))?;

        Self::migrate(&pool).await?;
        info!(path = %path, "SQLite store opened");
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| StoreError::Schema(format!("migration failed: {e}")))?;
        }
        Ok(())
    }

    /// Insert the defaults row for a channel unless one exists, inside the
    /// given transaction.
    async fn ensure_config_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        channel: &str,
        defaults: &ChannelDefaults,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO channel_configs
                (channel, message_threshold, spontaneous_cooldown_s, response_cooldown_s,
                 context_limit, message_count, created_ms, updated_ms)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(channel) DO NOTHING
            "#,
        )
        .bind(channel)
        .bind(defaults.message_threshold as i64)
        .bind(defaults.spontaneous_cooldown_s as i64)
        .bind(defaults.response_cooldown_s as i64)
        .bind(defaults.context_limit as i64)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

type ConfigRow = (
    String,
    i64,
    i64,
    i64,
    i64,
    Option<String>,
    i64,
    Option<i64>,
);

fn config_from_row(row: ConfigRow) -> ChannelConfig {
    let (
        channel,
        message_threshold,
        spontaneous_cooldown_s,
        response_cooldown_s,
        context_limit,
        model_name,
        message_count,
        last_spontaneous_ms,
    ) = row;
    ChannelConfig {
        channel,
        message_threshold: message_threshold.max(0) as u32,
        spontaneous_cooldown_s: spontaneous_cooldown_s.max(0) as u32,
        response_cooldown_s: response_cooldown_s.max(0) as u32,
        context_limit: context_limit.max(0) as u32,
        model_name,
        message_count,
        last_spontaneous_ms,
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn append_message(
        &self,
        msg: &NewMessage,
        defaults: &ChannelDefaults,
    ) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (message_id, channel, user_id, user_display_name, content, timestamp_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id) DO NOTHING
            "#,
        )
        .bind(&msg.message_id)
        .bind(&msg.channel)
        .bind(&msg.user_id)
        .bind(&msg.user_display_name)
        .bind(&msg.content)
        .bind(msg.timestamp_ms)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(AppendOutcome::Duplicate);
        }

        Self::ensure_config_row(&mut tx, &msg.channel, defaults, msg.timestamp_ms).await?;

        sqlx::query(
            "UPDATE channel_configs SET message_count = message_count + 1, updated_ms = ? WHERE channel = ?",
        )
        .bind(msg.timestamp_ms)
        .bind(&msg.channel)
        .execute(&mut *tx)
        .await?;

        let message_count: i64 =
            sqlx::query_scalar("SELECT message_count FROM channel_configs WHERE channel = ?")
                .bind(&msg.channel)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(AppendOutcome::Stored { message_count })
    }

    async fn recent_messages(
        &self,
        channel: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut rows: Vec<StoredMessage> = sqlx::query_as(
            r#"
            SELECT message_id, channel, user_id, user_display_name, content, timestamp_ms
            FROM messages
            WHERE channel = ?
            ORDER BY timestamp_ms DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(channel)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    async fn count_recent(&self, channel: &str) -> Result<i64, StoreError> {
        let cutoff = super::now_ms() - RECENT_WINDOW.as_millis() as i64;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE channel = ? AND timestamp_ms >= ?",
        )
        .bind(channel)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn delete_by_message_id(&self, message_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE message_id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_user(&self, channel: &str, user_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE channel = ? AND user_id = ?")
            .bind(channel)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn clear_channel(&self, channel: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE channel = ?")
            .bind(channel)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn channel_config(
        &self,
        channel: &str,
        defaults: &ChannelDefaults,
    ) -> Result<ChannelConfig, StoreError> {
        let row: Option<ConfigRow> = sqlx::query_as(
            r#"
            SELECT channel, message_threshold, spontaneous_cooldown_s, response_cooldown_s,
                   context_limit, model_name, message_count, last_spontaneous_ms
            FROM channel_configs
            WHERE channel = ?
            "#,
        )
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(config_from_row)
            .unwrap_or_else(|| ChannelConfig::synthesized(channel, defaults)))
    }

    async fn set_channel_field(
        &self,
        channel: &str,
        field: &ConfigField,
        defaults: &ChannelDefaults,
    ) -> Result<(), StoreError> {
        let now = super::now_ms();
        let mut tx = self.pool.begin().await?;
        Self::ensure_config_row(&mut tx, channel, defaults, now).await?;

        // The column set is closed (see ConfigField::column), so formatting
        // the column name into the statement is safe.
        let sql = format!(
            "UPDATE channel_configs SET {} = ?, updated_ms = ? WHERE channel = ?",
            field.column()
        );
        let query = sqlx::query(&sql);
        let query = match field {
            ConfigField::Threshold(v)
            | ConfigField::SpontaneousCooldown(v)
            | ConfigField::ResponseCooldown(v)
            | ConfigField::ContextLimit(v) => query.bind(*v as i64),
            ConfigField::Model(m) => query.bind(m.clone()),
        };
        query.bind(now).bind(channel).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reset_channel_config(
        &self,
        channel: &str,
        defaults: &ChannelDefaults,
    ) -> Result<(), StoreError> {
        let now = super::now_ms();
        let mut tx = self.pool.begin().await?;
        Self::ensure_config_row(&mut tx, channel, defaults, now).await?;
        sqlx::query(
            r#"
            UPDATE channel_configs
            SET message_threshold = ?, spontaneous_cooldown_s = ?, response_cooldown_s = ?,
                context_limit = ?, model_name = NULL, updated_ms = ?
            WHERE channel = ?
            "#,
        )
        .bind(defaults.message_threshold as i64)
        .bind(defaults.spontaneous_cooldown_s as i64)
        .bind(defaults.response_cooldown_s as i64)
        .bind(defaults.context_limit as i64)
        .bind(now)
        .bind(channel)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_spontaneous(
        &self,
        channel: &str,
        at_ms: i64,
        defaults: &ChannelDefaults,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_config_row(&mut tx, channel, defaults, at_ms).await?;
        // MAX keeps last_spontaneous_ms monotonically non-decreasing.
        sqlx::query(
            r#"
            UPDATE channel_configs
            SET last_spontaneous_ms = MAX(COALESCE(last_spontaneous_ms, 0), ?),
                message_count = 0,
                updated_ms = ?
            WHERE channel = ?
            "#,
        )
        .bind(at_ms)
        .bind(at_ms)
        .bind(channel)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn user_cooldown(
        &self,
        channel: &str,
        user_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        let stamp: Option<i64> = sqlx::query_scalar(
            "SELECT last_response_ms FROM user_response_cooldowns WHERE channel = ? AND user_id = ?",
        )
        .bind(channel)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(stamp)
    }

    async fn stamp_user_cooldown(
        &self,
        channel: &str,
        user_id: &str,
        at_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_response_cooldowns (channel, user_id, last_response_ms)
            VALUES (?, ?, ?)
            ON CONFLICT(channel, user_id) DO UPDATE SET last_response_ms = excluded.last_response_ms
            "#,
        )
        .bind(channel)
        .bind(user_id)
        .bind(at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_auth(&self) -> Result<Option<AuthRecord>, StoreError> {
        let row: Option<(String, Option<String>, Option<i64>, Option<String>)> = sqlx::query_as(
            "SELECT access_token, refresh_token, expires_at_ms, bot_username FROM auth_material WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(
            |(access_token, refresh_token, expires_at_ms, bot_username)| AuthRecord {
                access_token,
                refresh_token,
                expires_at_ms,
                bot_username,
            },
        ))
    }

    async fn store_auth(&self, record: &AuthRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO auth_material (id, access_token, refresh_token, expires_at_ms, bot_username, updated_ms)
            VALUES (1, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at_ms = excluded.expires_at_ms,
                bot_username = excluded.bot_username,
                updated_ms = excluded.updated_ms
            "#,
        )
        .bind(&record.access_token)
        .bind(&record.refresh_token)
        .bind(record.expires_at_ms)
        .bind(&record.bot_username)
        .bind(super::now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_metrics(&self, batch: &[MetricSample]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for sample in batch {
            sqlx::query(
                "INSERT INTO metrics (channel, kind, value, timestamp_ms) VALUES (?, ?, ?, ?)",
            )
            .bind(&sample.channel)
            .bind(&sample.kind)
            .bind(sample.value)
            .bind(sample.timestamp_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn aggregate_metric(
        &self,
        channel: &str,
        kind: &str,
        window: Duration,
    ) -> Result<MetricAggregate, StoreError> {
        let cutoff = super::now_ms() - window.as_millis() as i64;
        let (count, sum): (i64, f64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(value), 0.0)
            FROM metrics
            WHERE channel = ? AND kind = ? AND timestamp_ms >= ?
            "#,
        )
        .bind(channel)
        .bind(kind)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(MetricAggregate {
            count: count.max(0) as u64,
            sum,
        })
    }

    async fn cleanup(&self, policy: &RetentionPolicy) -> Result<CleanupReport, StoreError> {
        let now = super::now_ms();
        let mut report = CleanupReport::default();

        let message_cutoff = super::cutoff_ms(now, policy.messages_days);
        loop {
            let deleted = sqlx::query(
                "DELETE FROM messages WHERE id IN (SELECT id FROM messages WHERE timestamp_ms < ? LIMIT ?)",
            )
            .bind(message_cutoff)
            .bind(CLEANUP_BATCH as i64)
            .execute(&self.pool)
            .await?
            .rows_affected();
            report.messages_deleted += deleted;
            if deleted < CLEANUP_BATCH as u64 {
                break;
            }
        }

        let metric_cutoff = super::cutoff_ms(now, policy.metrics_days);
        loop {
            let deleted = sqlx::query(
                "DELETE FROM metrics WHERE id IN (SELECT id FROM metrics WHERE timestamp_ms < ? LIMIT ?)",
            )
            .bind(metric_cutoff)
            .bind(CLEANUP_BATCH as i64)
            .execute(&self.pool)
            .await?
            .rows_affected();
            report.metrics_deleted += deleted;
            if deleted < CLEANUP_BATCH as u64 {
                break;
            }
        }

        let cooldown_cutoff = super::cutoff_ms(now, policy.cooldowns_days);
        report.cooldowns_deleted = sqlx::query(
            "DELETE FROM user_response_cooldowns WHERE last_response_ms < ?",
        )
        .bind(cooldown_cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(report)
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
