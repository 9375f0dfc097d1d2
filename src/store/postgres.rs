//! Networked relational store backed by PostgreSQL.
//!
//! Same schema and contract as the embedded backend; only the SQL dialect
//! differs. Connection-level resilience (fail-fast windows, capped backoff)
//! lives in [`super::ResilientStore`].

use super::{
    AppendOutcome, AuthRecord, ChannelConfig, ChannelDefaults, CleanupReport, ConfigField,
    MetricAggregate, MetricSample, NewMessage, RetentionPolicy, Store, StoredMessage, StoreError,
    CLEANUP_BATCH, RECENT_WINDOW,
};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id BIGSERIAL PRIMARY KEY,
        message_id TEXT NOT NULL UNIQUE,
        channel TEXT NOT NULL,
        user_id TEXT NOT NULL,
        user_display_name TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp_ms BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_channel_ts ON messages(channel, timestamp_ms)",
    "CREATE INDEX IF NOT EXISTS idx_messages_channel_user ON messages(channel, user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS channel_configs (
        channel TEXT PRIMARY KEY,
        message_threshold BIGINT NOT NULL,
        spontaneous_cooldown_s BIGINT NOT NULL,
        response_cooldown_s BIGINT NOT NULL,
        context_limit BIGINT NOT NULL,
        model_name TEXT,
        message_count BIGINT NOT NULL DEFAULT 0,
        last_spontaneous_ms BIGINT,
        created_ms BIGINT NOT NULL,
        updated_ms BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_response_cooldowns (
        channel TEXT NOT NULL,
        user_id TEXT NOT NULL,
        last_response_ms BIGINT NOT NULL,
        PRIMARY KEY (channel, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS auth_material (
        id BIGINT PRIMARY KEY CHECK (id = 1),
        access_token TEXT NOT NULL,
        refresh_token TEXT,
        expires_at_ms BIGINT,
        bot_username TEXT,
        updated_ms BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metrics (
        id BIGSERIAL PRIMARY KEY,
        channel TEXT NOT NULL,
        kind TEXT NOT NULL,
        value DOUBLE PRECISION NOT NULL,
        timestamp_ms BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_metrics_channel_kind_ts ON metrics(channel, kind, timestamp_ms)",
];

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Connect and apply the schema.
    pub async fn open(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .test_before_acquire(true)
            .connect(url)
            .await
            .map_err(|e| StoreError::Schema(format!("failed to open postgres store: {e}")))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| StoreError::Schema(format!("migration failed: {e}")))?;
        }

        info!("PostgreSQL store opened");
        Ok(Self { pool })
    }

    async fn ensure_config_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        channel: &str,
        defaults: &ChannelDefaults,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO channel_configs
                (channel, message_threshold, spontaneous_cooldown_s, response_cooldown_s,
                 context_limit, message_count, created_ms, updated_ms)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $6)
            ON CONFLICT (channel) DO NOTHING
            "#,
        )
        .bind(channel)
        .bind(defaults.message_threshold as i64)
        .bind(defaults.spontaneous_cooldown_s as i64)
        .bind(defaults.response_cooldown_s as i64)
        .bind(defaults.context_limit as i64)
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
impl Store for PostgresStore {
    async fn append_message(
        &self,
        msg: &NewMessage,
        defaults: &ChannelDefaults,
    ) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (message_id, channel, user_id, user_display_name, content, timestamp_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (message_id) DO NOTHING
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

        let message_count: i64 = sqlx::query_scalar(
            r#"
            UPDATE channel_configs
            SET message_count = message_count + 1, updated_ms = $1
            WHERE channel = $2
            RETURNING message_count
            "#,
        )
        .bind(msg.timestamp_ms)
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
            WHERE channel = $1
            ORDER BY timestamp_ms DESC, id DESC
            LIMIT $2
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
            "SELECT COUNT(*) FROM messages WHERE channel = $1 AND timestamp_ms >= $2",
        )
        .bind(channel)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn delete_by_message_id(&self, message_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_user(&self, channel: &str, user_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE channel = $1 AND user_id = $2")
            .bind(channel)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn clear_channel(&self, channel: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE channel = $1")
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
            WHERE channel = $1
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

        // Column names come from the closed ConfigField set.
        let sql = format!(
            "UPDATE channel_configs SET {} = $1, updated_ms = $2 WHERE channel = $3",
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
            SET message_threshold = $1, spontaneous_cooldown_s = $2, response_cooldown_s = $3,
                context_limit = $4, model_name = NULL, updated_ms = $5
            WHERE channel = $6
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
        sqlx::query(
            r#"
            UPDATE channel_configs
            SET last_spontaneous_ms = GREATEST(COALESCE(last_spontaneous_ms, 0), $1),
                message_count = 0,
                updated_ms = $1
            WHERE channel = $2
            "#,
        )
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
            "SELECT last_response_ms FROM user_response_cooldowns WHERE channel = $1 AND user_id = $2",
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
            VALUES ($1, $2, $3)
            ON CONFLICT (channel, user_id) DO UPDATE SET last_response_ms = excluded.last_response_ms
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
            VALUES (1, $1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
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
                "INSERT INTO metrics (channel, kind, value, timestamp_ms) VALUES ($1, $2, $3, $4)",
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
            WHERE channel = $1 AND kind = $2 AND timestamp_ms >= $3
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
                "DELETE FROM messages WHERE id IN (SELECT id FROM messages WHERE timestamp_ms < $1 LIMIT $2)",
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
                "DELETE FROM metrics WHERE id IN (SELECT id FROM metrics WHERE timestamp_ms < $1 LIMIT $2)",
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
            "DELETE FROM user_response_cooldowns WHERE last_response_ms < $1",
        )
        .bind(cooldown_cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(report)
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
