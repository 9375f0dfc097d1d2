//! Per-channel live state: counters, cooldown stamps, and configuration
//! mirrored from the Store.
//!
//! The in-memory view is authoritative for trigger checks, but every
//! mutation writes through to the Store before the memory is touched; a
//! failed write leaves the last durable value in place, so a restart resumes
//! exactly at the persisted count and no further.

use crate::store::{ChannelDefaults, ConfigField, Store, StoreError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Live per-channel view used by trigger evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveState {
    pub message_threshold: u32,
    pub spontaneous_cooldown_s: u32,
    pub response_cooldown_s: u32,
    pub context_limit: u32,
    pub model_name: Option<String>,
    pub message_count: i64,
    pub last_spontaneous_ms: Option<i64>,
}

impl From<crate::store::ChannelConfig> for LiveState {
    fn from(config: crate::store::ChannelConfig) -> Self {
        Self {
            message_threshold: config.message_threshold,
            spontaneous_cooldown_s: config.spontaneous_cooldown_s,
            response_cooldown_s: config.response_cooldown_s,
            context_limit: config.context_limit,
            model_name: config.model_name,
            message_count: config.message_count,
            last_spontaneous_ms: config.last_spontaneous_ms,
        }
    }
}

/// One channel's entry: the live view plus the spontaneous-generation latch.
pub struct ChannelEntry {
    state: RwLock<LiveState>,
    spontaneous_inflight: AtomicBool,
}

impl ChannelEntry {
    fn new(state: LiveState) -> Self {
        Self {
            state: RwLock::new(state),
            spontaneous_inflight: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> LiveState {
        self.state.read().expect("channel state lock poisoned").clone()
    }

    fn update<F: FnOnce(&mut LiveState)>(&self, apply: F) {
        let mut state = self.state.write().expect("channel state lock poisoned");
        apply(&mut state);
    }

    /// Claim the spontaneous latch; at most one spontaneous generation runs
    /// per channel at a time.
    pub fn try_begin_spontaneous(self: &Arc<Self>) -> Option<InflightGuard> {
        if self
            .spontaneous_inflight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(InflightGuard {
                entry: Arc::clone(self),
            })
        } else {
            None
        }
    }
}

/// Clears the spontaneous latch when the generation task finishes, however
/// it finishes.
pub struct InflightGuard {
    entry: Arc<ChannelEntry>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.entry
            .spontaneous_inflight
            .store(false, Ordering::Release);
    }
}

/// Registry of live channel state, keyed by channel name.
pub struct ChannelRegistry {
    store: Arc<dyn Store>,
    defaults: ChannelDefaults,
    channels: DashMap<String, Arc<ChannelEntry>>,
}

impl ChannelRegistry {
    pub fn new(store: Arc<dyn Store>, defaults: ChannelDefaults) -> Self {
        Self {
            store,
            defaults,
            channels: DashMap::new(),
        }
    }

    pub fn defaults(&self) -> &ChannelDefaults {
        &self.defaults
    }

    /// The entry for a channel, loading it from the Store on first contact.
    pub async fn entry(&self, channel: &str) -> Result<Arc<ChannelEntry>, StoreError> {
        if let Some(entry) = self.channels.get(channel) {
            return Ok(Arc::clone(&entry));
        }
        let config = self.store.channel_config(channel, &self.defaults).await?;
        let entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(ChannelEntry::new(LiveState::from(config))));
        Ok(Arc::clone(&entry))
    }

    /// Startup restore: populate the live view for every configured channel.
    pub async fn load_all(&self, channels: &[String]) -> Result<(), StoreError> {
        for channel in channels {
            let entry = self.entry(channel).await?;
            let state = entry.snapshot();
            info!(
                channel = %channel,
                message_count = state.message_count,
                threshold = state.message_threshold,
                "Channel state restored"
            );
        }
        Ok(())
    }

    /// Adopt the post-append counter value returned by the Store.
    pub fn note_append(&self, channel: &str, message_count: i64) {
        if let Some(entry) = self.channels.get(channel) {
            entry.update(|state| state.message_count = message_count);
        }
    }

    /// Stamp a spontaneous emission: Store first, memory second.
    pub async fn record_spontaneous(&self, channel: &str, at_ms: i64) -> Result<(), StoreError> {
        self.store
            .record_spontaneous(channel, at_ms, &self.defaults)
            .await?;
        if let Some(entry) = self.channels.get(channel) {
            entry.update(|state| {
                state.message_count = 0;
                state.last_spontaneous_ms =
                    Some(state.last_spontaneous_ms.unwrap_or(0).max(at_ms));
            });
        }
        Ok(())
    }

    /// Persist one configuration field and mirror it into memory.
    pub async fn apply_field(&self, channel: &str, field: &ConfigField) -> Result<(), StoreError> {
        self.store
            .set_channel_field(channel, field, &self.defaults)
            .await?;
        let entry = self.entry(channel).await?;
        let field = field.clone();
        entry.update(|state| match field {
            ConfigField::Threshold(v) => state.message_threshold = v,
            ConfigField::SpontaneousCooldown(v) => state.spontaneous_cooldown_s = v,
            ConfigField::ResponseCooldown(v) => state.response_cooldown_s = v,
            ConfigField::ContextLimit(v) => state.context_limit = v,
            ConfigField::Model(m) => state.model_name = m,
        });
        Ok(())
    }

    /// Restore a channel's limits to the global defaults (counters and the
    /// spontaneous stamp are preserved).
    pub async fn reset(&self, channel: &str) -> Result<(), StoreError> {
        self.store
            .reset_channel_config(channel, &self.defaults)
            .await?;
        let defaults = self.defaults;
        if let Some(entry) = self.channels.get(channel) {
            entry.update(|state| {
                state.message_threshold = defaults.message_threshold;
                state.spontaneous_cooldown_s = defaults.spontaneous_cooldown_s;
                state.response_cooldown_s = defaults.response_cooldown_s;
                state.context_limit = defaults.context_limit;
                state.model_name = None;
            });
        }
        Ok(())
    }
}
