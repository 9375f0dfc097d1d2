//! Buffered performance metrics, persisted through the Store.
//!
//! Samples are cheap to record from hot paths (a mutex push) and are flushed
//! to the metric table in batches: on an interval, when the buffer grows
//! large, and once more at shutdown. A failed flush drops the batch with a
//! warning; metrics are best-effort and never block message processing.

use crate::store::{MetricSample, Store};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Closed set of metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    GenerationSuccess,
    GeneratorUnavailable,
    InvalidOutput,
    FilterBlockInput,
    FilterBlockOutput,
    ResponseTimeMs,
    QueueDrop,
    RateLimitHit,
    StoreUnavailable,
    InadequateContext,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerationSuccess => "generation_success",
            Self::GeneratorUnavailable => "generator_unavailable",
            Self::InvalidOutput => "invalid_output",
            Self::FilterBlockInput => "filter_block_input",
            Self::FilterBlockOutput => "filter_block_output",
            Self::ResponseTimeMs => "response_time_ms",
            Self::QueueDrop => "queue_drop",
            Self::RateLimitHit => "rate_limit_hit",
            Self::StoreUnavailable => "store_unavailable",
            Self::InadequateContext => "inadequate_context",
        }
    }
}

/// Flush when the buffer reaches this size, without waiting for the tick.
const FLUSH_HIGH_WATER: usize = 256;

/// Buffered metric sink.
pub struct MetricsRecorder {
    store: Arc<dyn Store>,
    buffer: Mutex<Vec<MetricSample>>,
    kick: Notify,
}

impl MetricsRecorder {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            buffer: Mutex::new(Vec::new()),
            kick: Notify::new(),
        })
    }

    /// Record one sample. Never blocks on I/O.
    pub fn record(&self, channel: &str, kind: MetricKind, value: f64) {
        let sample = MetricSample {
            channel: channel.to_string(),
            kind: kind.as_str().to_string(),
            value,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        let len = {
            let mut buffer = self.buffer.lock().expect("metrics lock poisoned");
            buffer.push(sample);
            buffer.len()
        };
        if len >= FLUSH_HIGH_WATER {
            self.kick.notify_one();
        }
    }

    /// Count a unit event.
    pub fn incr(&self, channel: &str, kind: MetricKind) {
        self.record(channel, kind, 1.0);
    }

    /// Persist everything buffered so far.
    pub async fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().expect("metrics lock poisoned");
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        if let Err(e) = self.store.record_metrics(&batch).await {
            warn!(error = %e, dropped = count, "Metric flush failed; batch dropped");
        } else {
            debug!(flushed = count, "Metrics flushed");
        }
    }

    /// Run the periodic flush loop until shutdown, then flush once more.
    pub fn spawn_flush_task(
        self: &Arc<Self>,
        interval: std::time::Duration,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) {
        let recorder = Arc::clone(self);
        tracker.spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => recorder.flush().await,
                    _ = recorder.kick.notified() => recorder.flush().await,
                    _ = shutdown.cancelled() => {
                        recorder.flush().await;
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use std::time::Duration;

    #[tokio::test]
    async fn samples_flush_to_the_store() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(":memory:", 1).await.unwrap());
        let recorder = MetricsRecorder::new(Arc::clone(&store));

        recorder.incr("#chan", MetricKind::GenerationSuccess);
        recorder.record("#chan", MetricKind::ResponseTimeMs, 420.0);
        recorder.flush().await;

        let agg = store
            .aggregate_metric("#chan", "response_time_ms", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(agg.count, 1);
        assert!((agg.sum - 420.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn flush_with_empty_buffer_is_a_noop() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(":memory:", 1).await.unwrap());
        let recorder = MetricsRecorder::new(Arc::clone(&store));
        recorder.flush().await;

        let agg = store
            .aggregate_metric("#chan", "generation_success", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(agg.count, 0);
    }
}
