//! The central coordinator: routes inbound events, drives generation
//! triggers, and orchestrates filtering, storage, and egress.
//!
//! Each channel gets one mailbox and one worker task; events for a channel
//! are processed in arrival order, channels in parallel. The worker is the
//! serialization point for Filter -> Store append -> counter -> trigger
//! evaluation; the Generator is never awaited while the worker holds that
//! position - generation runs in a spawned task that re-touches counters and
//! stamps only after a successful send.

mod queue;
pub mod triggers;

pub use queue::{Mailbox, PushOutcome};

use crate::channels::{ChannelRegistry, InflightGuard, LiveState};
use crate::chat::{ChatEvent, Egress, EventKind, MESSAGE_BYTE_LIMIT};
use crate::commands::{self, CommandHandler};
use crate::filter::{ContentFilter, Verdict};
use crate::generator::{Generator, GeneratorError};
use crate::metrics::{MetricKind, MetricsRecorder};
use crate::store::{AppendOutcome, NewMessage, Store};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use triggers::MIN_CONTEXT;

/// Chat bots everyone runs; their messages are never stored or counted.
const DEFAULT_KNOWN_BOTS: &[&str] = &[
    "nightbot",
    "streamelements",
    "streamlabs",
    "moobot",
    "fossabot",
    "wizebot",
    "botisimo",
    "cloudbot",
    "phantombot",
    "coebot",
];

/// Everything the Processor needs, wired by the composition root.
pub struct ProcessorDeps {
    pub store: Arc<dyn Store>,
    pub generator: Arc<dyn Generator>,
    pub egress: Arc<dyn Egress>,
    pub filter: Arc<ContentFilter>,
    pub registry: Arc<ChannelRegistry>,
    pub metrics: Arc<MetricsRecorder>,
    pub commands: CommandHandler,
    pub bot_username: String,
    pub known_bots: Vec<String>,
    pub default_model: String,
    pub mailbox_depth: usize,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

pub struct Processor {
    store: Arc<dyn Store>,
    generator: Arc<dyn Generator>,
    egress: Arc<dyn Egress>,
    filter: Arc<ContentFilter>,
    registry: Arc<ChannelRegistry>,
    metrics: Arc<MetricsRecorder>,
    commands: CommandHandler,
    bot_username: String,
    known_bots: HashSet<String>,
    default_model: String,
    mailbox_depth: usize,
    mailboxes: DashMap<String, Arc<Mailbox>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Processor {
    pub fn new(deps: ProcessorDeps) -> Arc<Self> {
        let mut known_bots: HashSet<String> = DEFAULT_KNOWN_BOTS
            .iter()
            .map(|name| name.to_string())
            .collect();
        known_bots.extend(deps.known_bots.iter().map(|name| name.to_ascii_lowercase()));
        known_bots.insert(deps.bot_username.to_ascii_lowercase());

        Arc::new(Self {
            store: deps.store,
            generator: deps.generator,
            egress: deps.egress,
            filter: deps.filter,
            registry: deps.registry,
            metrics: deps.metrics,
            commands: deps.commands,
            bot_username: deps.bot_username.to_ascii_lowercase(),
            known_bots,
            default_model: deps.default_model,
            mailbox_depth: deps.mailbox_depth,
            mailboxes: DashMap::new(),
            shutdown: deps.shutdown,
            tracker: deps.tracker,
        })
    }

    /// Pump inbound events into per-channel mailboxes until shutdown or the
    /// chat side closes.
    pub async fn run(self: &Arc<Self>, mut events: mpsc::Receiver<ChatEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                maybe = events.recv() => match maybe {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
        }
        for entry in self.mailboxes.iter() {
            entry.value().close();
        }
    }

    /// Route one event to its channel worker, creating the worker on first
    /// contact. Overflow drops the oldest queued event, never the newest.
    pub fn dispatch(self: &Arc<Self>, event: ChatEvent) {
        let channel = event.channel.clone();
        let mailbox = match self.mailboxes.entry(channel.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let mailbox = Arc::new(Mailbox::new(self.mailbox_depth));
                vacant.insert(Arc::clone(&mailbox));
                let this = Arc::clone(self);
                let worker_mailbox = Arc::clone(&mailbox);
                let worker_channel = channel.clone();
                self.tracker.spawn(async move {
                    this.worker_loop(worker_channel, worker_mailbox).await;
                });
                mailbox
            }
        };

        if let PushOutcome::DroppedOldest(dropped) = mailbox.push(event) {
            warn!(
                channel = %channel,
                dropped_id = ?dropped.message_id,
                "Channel backlog full; oldest event dropped"
            );
            self.metrics.incr(&channel, MetricKind::QueueDrop);
        }
    }

    async fn worker_loop(self: Arc<Self>, channel: String, mailbox: Arc<Mailbox>) {
        debug!(channel = %channel, "Channel worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                maybe = mailbox.recv() => match maybe {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!(channel = %channel, "Channel worker stopped");
    }

    /// Classify and handle one inbound event.
    pub async fn handle_event(self: &Arc<Self>, event: ChatEvent) {
        let channel = event.channel.clone();
        match &event.kind {
            EventKind::Delete { message_id } => {
                match self.store.delete_by_message_id(message_id).await {
                    Ok(removed) => info!(
                        channel = %channel,
                        message_id = %message_id,
                        removed,
                        "Message removed by moderation"
                    ),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Moderation delete failed");
                        self.metrics.incr(&channel, MetricKind::StoreUnavailable);
                    }
                }
                return;
            }
            EventKind::UserClear { user_id } => {
                match self.store.delete_by_user(&channel, user_id).await {
                    Ok(removed) => info!(
                        channel = %channel,
                        user_id = %user_id,
                        removed,
                        "User history purged by moderation"
                    ),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Moderation purge failed");
                        self.metrics.incr(&channel, MetricKind::StoreUnavailable);
                    }
                }
                return;
            }
            EventKind::ChannelClear => {
                match self.store.clear_channel(&channel).await {
                    Ok(removed) => {
                        info!(channel = %channel, removed, "Channel history cleared by moderation")
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Moderation clear failed");
                        self.metrics.incr(&channel, MetricKind::StoreUnavailable);
                    }
                }
                return;
            }
            EventKind::System => return,
            EventKind::Message => {}
        }

        if let Some(login) = &event.author_login {
            if self.known_bots.contains(login.as_str()) {
                return;
            }
        }
        let author_id = match event.author_id.clone() {
            Some(id) => id,
            None => return,
        };

        if let Some(command) = commands::parse(&event.content) {
            if let Some(reply) = self.commands.handle(&event, command).await {
                if let Err(e) = self.egress.send(&channel, &reply).await {
                    warn!(channel = %channel, error = %e, "Command reply send failed");
                }
            }
            return;
        }

        self.handle_user_message(event, author_id).await;
    }

    async fn handle_user_message(self: &Arc<Self>, event: ChatEvent, author_id: String) {
        let channel = event.channel.clone();

        // Input filter runs before anything else; blocked content never
        // produces a row, a counter bump, or a mention.
        if self.filter.classify(&event.content) == Verdict::Blocked {
            warn!(
                channel = %channel,
                user_id = %author_id,
                content = %event.content,
                "Inbound message blocked by content filter"
            );
            self.metrics.incr(&channel, MetricKind::FilterBlockInput);
            return;
        }

        let mention = triggers::is_mention(&event.content, &self.bot_username);

        let entry = match self.registry.entry(&channel).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Channel state unavailable");
                self.metrics.incr(&channel, MetricKind::StoreUnavailable);
                return;
            }
        };

        let message = NewMessage {
            message_id: event
                .message_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            channel: channel.clone(),
            user_id: author_id.clone(),
            user_display_name: event.display_name().to_string(),
            content: event.content.clone(),
            timestamp_ms: event.timestamp_ms,
        };

        match self
            .store
            .append_message(&message, self.registry.defaults())
            .await
        {
            Ok(AppendOutcome::Stored { message_count }) => {
                self.registry.note_append(&channel, message_count);
                debug!(
                    channel = %channel,
                    user = %message.user_display_name,
                    message_count,
                    "Message stored"
                );
            }
            Ok(AppendOutcome::Duplicate) => {
                debug!(channel = %channel, message_id = %message.message_id, "Duplicate message ignored");
                return;
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Message append failed");
                self.metrics.incr(&channel, MetricKind::StoreUnavailable);
                return;
            }
        }

        let now_ms = chrono::Utc::now().timestamp_millis();

        if mention {
            let state = entry.snapshot();
            match self.store.user_cooldown(&channel, &author_id).await {
                Ok(last) if triggers::response_ready(last, state.response_cooldown_s, now_ms) => {
                    self.spawn_response(&event, author_id, state);
                    return;
                }
                Ok(_) => {
                    debug!(channel = %channel, user_id = %author_id, "Mention declined: user on cooldown");
                    self.metrics.incr(&channel, MetricKind::RateLimitHit);
                    // Declined mentions fall through to the spontaneous check.
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Cooldown read failed; response declined");
                    self.metrics.incr(&channel, MetricKind::StoreUnavailable);
                }
            }
        }

        let state = entry.snapshot();
        if let Err(reason) = triggers::spontaneous_gate(&state, now_ms) {
            debug!(channel = %channel, reason = ?reason, "Spontaneous declined");
            return;
        }

        match self.store.count_recent(&channel).await {
            Ok(available) if available >= MIN_CONTEXT => {}
            Ok(available) => {
                debug!(
                    channel = %channel,
                    available,
                    required = MIN_CONTEXT,
                    "Spontaneous declined: inadequate context"
                );
                self.metrics.incr(&channel, MetricKind::InadequateContext);
                return;
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Context count failed; spontaneous declined");
                self.metrics.incr(&channel, MetricKind::StoreUnavailable);
                return;
            }
        }

        let guard = match entry.try_begin_spontaneous() {
            Some(guard) => guard,
            None => {
                debug!(channel = %channel, "Spontaneous already in flight");
                return;
            }
        };
        self.spawn_spontaneous(channel, state, guard);
    }

    fn spawn_response(self: &Arc<Self>, event: &ChatEvent, author_id: String, state: LiveState) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let this = Arc::clone(self);
        let channel = event.channel.clone();
        let user_name = event.display_name().to_string();
        let user_text =
            triggers::mention_content(&event.content, &self.bot_username).to_string();
        self.tracker.spawn(async move {
            this.run_response(channel, author_id, user_name, user_text, state)
                .await;
        });
    }

    async fn run_response(
        self: Arc<Self>,
        channel: String,
        author_id: String,
        user_name: String,
        user_text: String,
        state: LiveState,
    ) {
        let started = Instant::now();

        if state.context_limit == 0 {
            self.metrics.incr(&channel, MetricKind::InadequateContext);
            return;
        }
        let context = match self
            .store
            .recent_messages(&channel, state.context_limit)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Context read failed; response dropped");
                self.metrics.incr(&channel, MetricKind::StoreUnavailable);
                return;
            }
        };

        let model = state
            .model_name
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let text = match self
            .generator
            .generate_response(&model, &context, &user_name, &user_text, MESSAGE_BYTE_LIMIT)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                self.note_generation_failure(&channel, &e, "response");
                return;
            }
        };

        if self.filter.classify(&text) == Verdict::Blocked {
            warn!(
                channel = %channel,
                content = %text,
                "Generated response blocked by output filter"
            );
            self.metrics.incr(&channel, MetricKind::FilterBlockOutput);
            return;
        }

        if let Err(e) = self.egress.send(&channel, &text).await {
            warn!(channel = %channel, error = %e, "Response send failed");
            return;
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        if let Err(e) = self
            .store
            .stamp_user_cooldown(&channel, &author_id, now_ms)
            .await
        {
            warn!(channel = %channel, user_id = %author_id, error = %e, "Cooldown stamp failed after send");
        }

        self.metrics.incr(&channel, MetricKind::GenerationSuccess);
        self.metrics.record(
            &channel,
            MetricKind::ResponseTimeMs,
            started.elapsed().as_millis() as f64,
        );
        info!(
            channel = %channel,
            user = %user_name,
            model = %model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            bytes = text.len(),
            "Response sent"
        );
    }

    fn spawn_spontaneous(
        self: &Arc<Self>,
        channel: String,
        state: LiveState,
        guard: InflightGuard,
    ) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            this.run_spontaneous(channel, state, guard).await;
        });
    }

    async fn run_spontaneous(
        self: Arc<Self>,
        channel: String,
        state: LiveState,
        _guard: InflightGuard,
    ) {
        let started = Instant::now();

        let context = match self
            .store
            .recent_messages(&channel, state.context_limit)
            .await
        {
            Ok(context) if !context.is_empty() => context,
            Ok(_) => {
                self.metrics.incr(&channel, MetricKind::InadequateContext);
                return;
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Context read failed; spontaneous dropped");
                self.metrics.incr(&channel, MetricKind::StoreUnavailable);
                return;
            }
        };

        let model = state
            .model_name
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let text = match self
            .generator
            .generate_spontaneous(&model, &context, MESSAGE_BYTE_LIMIT)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                self.note_generation_failure(&channel, &e, "spontaneous");
                return;
            }
        };

        if self.filter.classify(&text) == Verdict::Blocked {
            warn!(
                channel = %channel,
                content = %text,
                "Generated message blocked by output filter"
            );
            self.metrics.incr(&channel, MetricKind::FilterBlockOutput);
            return;
        }

        if let Err(e) = self.egress.send(&channel, &text).await {
            warn!(channel = %channel, error = %e, "Spontaneous send failed");
            return;
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        if let Err(e) = self.registry.record_spontaneous(&channel, now_ms).await {
            warn!(channel = %channel, error = %e, "Spontaneous stamp failed after send");
        }

        self.metrics.incr(&channel, MetricKind::GenerationSuccess);
        self.metrics.record(
            &channel,
            MetricKind::ResponseTimeMs,
            started.elapsed().as_millis() as f64,
        );
        info!(
            channel = %channel,
            model = %model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            bytes = text.len(),
            context_size = context.len(),
            "Spontaneous message sent"
        );
    }

    /// Generation failures are silent toward chat: record a metric, keep
    /// counters and stamps untouched, let the next event re-evaluate.
    fn note_generation_failure(&self, channel: &str, error: &GeneratorError, path: &str) {
        match error {
            GeneratorError::Invalid => {
                debug!(channel = %channel, path = %path, "Generation produced invalid output");
                self.metrics.incr(channel, MetricKind::InvalidOutput);
            }
            other => {
                warn!(channel = %channel, path = %path, error = %other, "Generator unavailable");
                self.metrics.incr(channel, MetricKind::GeneratorUnavailable);
            }
        }
    }
}
