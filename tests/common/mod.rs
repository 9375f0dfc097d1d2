//! Shared harness for pipeline integration tests: an in-memory store, a
//! scripted generator, and a recording egress wired into a real Processor.

use async_trait::async_trait;
use clank::channels::ChannelRegistry;
use clank::chat::{BadgeSet, ChatEvent, Egress, EventKind};
use clank::commands::CommandHandler;
use clank::error::ChatError;
use clank::filter::ContentFilter;
use clank::generator::{Generator, GeneratorError};
use clank::metrics::{MetricKind, MetricsRecorder};
use clank::processor::{Processor, ProcessorDeps};
use clank::store::{ChannelDefaults, SqliteStore, Store, StoredMessage};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const BOT: &str = "clank";

/// What the scripted generator does on the next call.
#[derive(Clone)]
pub enum Behavior {
    Text(String),
    Unavailable,
    Invalid,
}

pub struct ScriptedGenerator {
    behavior: Mutex<Behavior>,
    pub spontaneous_calls: AtomicUsize,
    pub response_calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            spontaneous_calls: AtomicUsize::new(0),
            response_calls: AtomicUsize::new(0),
        })
    }

    #[allow(dead_code)]
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    fn produce(&self) -> Result<String, GeneratorError> {
        match self.behavior.lock().unwrap().clone() {
            Behavior::Text(text) => Ok(text),
            Behavior::Unavailable => Err(GeneratorError::Unavailable("scripted outage".into())),
            Behavior::Invalid => Err(GeneratorError::Invalid),
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn list_models(&self) -> Result<Vec<String>, GeneratorError> {
        Ok(vec!["llama3.2".into(), "mistral".into()])
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn generate_spontaneous(
        &self,
        _model: &str,
        _context: &[StoredMessage],
        _byte_limit: usize,
    ) -> Result<String, GeneratorError> {
        self.spontaneous_calls.fetch_add(1, Ordering::SeqCst);
        self.produce()
    }

    async fn generate_response(
        &self,
        _model: &str,
        _context: &[StoredMessage],
        _user_name: &str,
        _user_text: &str,
        _byte_limit: usize,
    ) -> Result<String, GeneratorError> {
        self.response_calls.fetch_add(1, Ordering::SeqCst);
        self.produce()
    }

    async fn validate_startup_model(&self, _default_model: &str) -> Result<(), GeneratorError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEgress {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingEgress {
    pub fn lines_for(&self, channel: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Egress for RecordingEgress {
    async fn send(&self, channel: &str, text: &str) -> Result<(), ChatError> {
        self.sent
            .lock()
            .unwrap()
            .push((channel.to_string(), text.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub processor: Arc<Processor>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<ChannelRegistry>,
    pub egress: Arc<RecordingEgress>,
    pub generator: Arc<ScriptedGenerator>,
    pub metrics: Arc<MetricsRecorder>,
    pub tracker: TaskTracker,
    _blocked_terms: tempfile::NamedTempFile,
}

impl Harness {
    pub async fn new(defaults: ChannelDefaults) -> Self {
        Self::with_generator(defaults, Behavior::Text("a perfectly normal line".into())).await
    }

    pub async fn with_generator(defaults: ChannelDefaults, behavior: Behavior) -> Self {
        let mut blocked_terms = tempfile::NamedTempFile::new().unwrap();
        writeln!(blocked_terms, "badterm\nforbidden").unwrap();

        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(":memory:", 1).await.unwrap());
        let registry = Arc::new(ChannelRegistry::new(Arc::clone(&store), defaults));
        let egress = Arc::new(RecordingEgress::default());
        let generator = ScriptedGenerator::new(behavior);
        let metrics = MetricsRecorder::new(Arc::clone(&store));
        let filter = Arc::new(ContentFilter::new(blocked_terms.path(), true, false));
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let commands = CommandHandler::new(
            Arc::clone(&store),
            generator.clone() as Arc<dyn Generator>,
            Arc::clone(&registry),
            "llama3.2".into(),
        );

        let processor = Processor::new(ProcessorDeps {
            store: Arc::clone(&store),
            generator: generator.clone() as Arc<dyn Generator>,
            egress: egress.clone() as Arc<dyn Egress>,
            filter,
            registry: Arc::clone(&registry),
            metrics: Arc::clone(&metrics),
            commands,
            bot_username: BOT.into(),
            known_bots: vec!["somebot".into()],
            default_model: "llama3.2".into(),
            mailbox_depth: 64,
            shutdown,
            tracker: tracker.clone(),
        });

        Self {
            processor,
            store,
            registry,
            egress,
            generator,
            metrics,
            tracker,
            _blocked_terms: blocked_terms,
        }
    }

    /// Feed one event through the pipeline and wait for any spawned
    /// generation task to finish.
    pub async fn push(&self, event: ChatEvent) {
        self.processor.handle_event(event).await;
        self.settle().await;
    }

    /// Wait for outstanding generation tasks.
    pub async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Flushed count of one metric kind for a channel.
    pub async fn metric_count(&self, channel: &str, kind: MetricKind) -> u64 {
        self.metrics.flush().await;
        self.store
            .aggregate_metric(channel, kind.as_str(), Duration::from_secs(3600))
            .await
            .unwrap()
            .count
    }
}

pub fn defaults() -> ChannelDefaults {
    ChannelDefaults {
        message_threshold: 30,
        spontaneous_cooldown_s: 300,
        response_cooldown_s: 60,
        context_limit: 200,
    }
}

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

pub fn user_message(channel: &str, user: &str, content: &str) -> ChatEvent {
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
    ChatEvent {
        channel: channel.to_string(),
        author_id: Some(user.to_string()),
        author_login: Some(user.to_lowercase()),
        author_display_name: Some(user.to_string()),
        badges: BadgeSet::default(),
        message_id: Some(format!("mid-{id}")),
        content: content.to_string(),
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        kind: EventKind::Message,
    }
}

pub fn mod_message(channel: &str, user: &str, content: &str) -> ChatEvent {
    let mut event = user_message(channel, user, content);
    event.badges = BadgeSet::from_names(vec!["moderator".to_string()]);
    event
}

pub fn moderation(channel: &str, kind: EventKind) -> ChatEvent {
    ChatEvent {
        channel: channel.to_string(),
        author_id: None,
        author_login: None,
        author_display_name: None,
        badges: BadgeSet::default(),
        message_id: None,
        content: String::new(),
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        kind,
    }
}
