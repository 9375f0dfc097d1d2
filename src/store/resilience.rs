//! Fail-fast resilience for store access.
//!
//! Consecutive failures open a window during which every operation is
//! rejected immediately instead of blocking the event loop on a dead
//! backend. The window doubles per failure streak and is capped at five
//! minutes; one success closes it.

use super::{
    AppendOutcome, AuthRecord, ChannelConfig, ChannelDefaults, CleanupReport, ConfigField,
    MetricAggregate, MetricSample, NewMessage, RetentionPolicy, Store, StoredMessage, StoreError,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Failure tracker with exponential fail-fast windows.
pub(super) struct Breaker {
    state: Mutex<BreakerState>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Reject fast while a window is open.
    fn check(&self) -> Result<(), StoreError> {
        let state = self.state.lock().expect("breaker lock poisoned");
        if let Some(until) = state.open_until {
            let now = Instant::now();
            if now < until {
                return Err(StoreError::Unavailable(format!(
                    "store disconnected; retrying in {}s",
                    (until - now).as_secs().max(1)
                )));
            }
        }
        Ok(())
    }

    fn success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    fn failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let exponent = state.consecutive_failures.saturating_sub(1).min(16);
        let backoff = BASE_BACKOFF
            .saturating_mul(1u32 << exponent)
            .min(MAX_BACKOFF);
        state.open_until = Some(Instant::now() + backoff);
        warn!(
            failures = state.consecutive_failures,
            backoff_s = backoff.as_secs(),
            "Store operation failed; failing fast"
        );
    }
}

/// Store wrapper applying the breaker to every operation.
pub struct ResilientStore<S> {
    inner: S,
    breaker: Breaker,
}

impl<S: Store> ResilientStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            breaker: Breaker::new(),
        }
    }

    async fn guard<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        self.breaker.check()?;
        match op.await {
            Ok(value) => {
                self.breaker.success();
                Ok(value)
            }
            Err(e) => {
                if matches!(e, StoreError::Unavailable(_)) {
                    self.breaker.failure();
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<S: Store> Store for ResilientStore<S> {
    async fn append_message(
        &self,
        msg: &NewMessage,
        defaults: &ChannelDefaults,
    ) -> Result<AppendOutcome, StoreError> {
        self.guard(self.inner.append_message(msg, defaults)).await
    }

    async fn recent_messages(
        &self,
        channel: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.guard(self.inner.recent_messages(channel, limit)).await
    }

    async fn count_recent(&self, channel: &str) -> Result<i64, StoreError> {
        self.guard(self.inner.count_recent(channel)).await
    }

    async fn delete_by_message_id(&self, message_id: &str) -> Result<u64, StoreError> {
        self.guard(self.inner.delete_by_message_id(message_id)).await
    }

    async fn delete_by_user(&self, channel: &str, user_id: &str) -> Result<u64, StoreError> {
        self.guard(self.inner.delete_by_user(channel, user_id)).await
    }

    async fn clear_channel(&self, channel: &str) -> Result<u64, StoreError> {
        self.guard(self.inner.clear_channel(channel)).await
    }

    async fn channel_config(
        &self,
        channel: &str,
        defaults: &ChannelDefaults,
    ) -> Result<ChannelConfig, StoreError> {
        self.guard(self.inner.channel_config(channel, defaults)).await
    }

    async fn set_channel_field(
        &self,
        channel: &str,
        field: &ConfigField,
        defaults: &ChannelDefaults,
    ) -> Result<(), StoreError> {
        self.guard(self.inner.set_channel_field(channel, field, defaults))
            .await
    }

    async fn reset_channel_config(
        &self,
        channel: &str,
        defaults: &ChannelDefaults,
    ) -> Result<(), StoreError> {
        self.guard(self.inner.reset_channel_config(channel, defaults))
            .await
    }

    async fn record_spontaneous(
        &self,
        channel: &str,
        at_ms: i64,
        defaults: &ChannelDefaults,
    ) -> Result<(), StoreError> {
        self.guard(self.inner.record_spontaneous(channel, at_ms, defaults))
            .await
    }

    async fn user_cooldown(
        &self,
        channel: &str,
        user_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        self.guard(self.inner.user_cooldown(channel, user_id)).await
    }

    async fn stamp_user_cooldown(
        &self,
        channel: &str,
        user_id: &str,
        at_ms: i64,
    ) -> Result<(), StoreError> {
        self.guard(self.inner.stamp_user_cooldown(channel, user_id, at_ms))
            .await
    }

    async fn load_auth(&self) -> Result<Option<AuthRecord>, StoreError> {
        self.guard(self.inner.load_auth()).await
    }

    async fn store_auth(&self, record: &AuthRecord) -> Result<(), StoreError> {
        self.guard(self.inner.store_auth(record)).await
    }

    async fn record_metrics(&self, batch: &[MetricSample]) -> Result<(), StoreError> {
        self.guard(self.inner.record_metrics(batch)).await
    }

    async fn aggregate_metric(
        &self,
        channel: &str,
        kind: &str,
        window: Duration,
    ) -> Result<MetricAggregate, StoreError> {
        self.guard(self.inner.aggregate_metric(channel, kind, window))
            .await
    }

    async fn cleanup(&self, policy: &RetentionPolicy) -> Result<CleanupReport, StoreError> {
        self.guard(self.inner.cleanup(policy)).await
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_failure_and_closes_on_success() {
        let breaker = Breaker::new();
        assert!(breaker.check().is_ok());

        breaker.failure();
        assert!(breaker.check().is_err());

        breaker.success();
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn backoff_grows_with_failure_streak() {
        let breaker = Breaker::new();
        breaker.failure();
        let first = breaker
            .state
            .lock()
            .unwrap()
            .open_until
            .unwrap();
        breaker.failure();
        let second = breaker.state.lock().unwrap().open_until.unwrap();
        assert!(second > first);
    }

    #[test]
    fn backoff_is_capped() {
        let breaker = Breaker::new();
        for _ in 0..40 {
            breaker.failure();
        }
        let until = breaker.state.lock().unwrap().open_until.unwrap();
        assert!(until <= Instant::now() + MAX_BACKOFF + Duration::from_secs(1));
    }
}
