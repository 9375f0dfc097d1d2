//! Privileged in-chat configuration commands (`!clank ...`).
//!
//! Only senders carrying the broadcaster or moderator capability are heard;
//! anyone else is dropped silently. Replies go back through the egress
//! interface handed in by the Processor and are operator output: they are not
//! content-filtered and touch no counters or cooldowns.

use crate::channels::ChannelRegistry;
use crate::chat::ChatEvent;
use crate::error::CommandError;
use crate::generator::Generator;
use crate::metrics::MetricKind;
use crate::store::{ConfigField, Store};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How long a `reset` stays armed waiting for `reset confirm`.
const RESET_CONFIRM_WINDOW: Duration = Duration::from_secs(60);

/// Window used for the status line's success rate.
const STATUS_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Tunable settings reachable from chat, with their accepted ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    Threshold,
    Spontaneous,
    Response,
    Context,
    Model,
}

impl SettingKey {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "threshold" => Some(Self::Threshold),
            "spontaneous" => Some(Self::Spontaneous),
            "response" => Some(Self::Response),
            "context" => Some(Self::Context),
            "model" => Some(Self::Model),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Spontaneous => "spontaneous",
            Self::Response => "response",
            Self::Context => "context",
            Self::Model => "model",
        }
    }

    /// Accepted numeric range; `None` for the model key.
    fn range(&self) -> Option<(u32, u32)> {
        match self {
            Self::Threshold => Some((5, 200)),
            Self::Spontaneous => Some((60, 3600)),
            Self::Response => Some((10, 1800)),
            Self::Context => Some((50, 500)),
            Self::Model => None,
        }
    }
}

/// A parsed `!clank` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClankCommand {
    Help,
    Get(SettingKey),
    Set(SettingKey, String),
    Models,
    Status,
    Reset,
    ResetConfirm,
}

/// Parse a message as a `!clank` command. `None` means the message is not a
/// command at all (and should flow through the normal pipeline).
pub fn parse(content: &str) -> Option<ClankCommand> {
    let mut words = content.split_whitespace();
    if words.next()? != "!clank" {
        return None;
    }
    let command = match words.next() {
        Some(word) => word.to_ascii_lowercase(),
        None => return Some(ClankCommand::Help),
    };
    let argument = words.next().map(str::to_string);

    Some(match (command.as_str(), argument) {
        ("help", _) => ClankCommand::Help,
        ("models", _) => ClankCommand::Models,
        ("status", _) => ClankCommand::Status,
        ("reset", Some(arg)) if arg.eq_ignore_ascii_case("confirm") => ClankCommand::ResetConfirm,
        ("reset", _) => ClankCommand::Reset,
        (key, argument) => match SettingKey::parse(key) {
            Some(key) => match argument {
                Some(value) => ClankCommand::Set(key, value),
                None => ClankCommand::Get(key),
            },
            None => ClankCommand::Help,
        },
    })
}

/// Validate a numeric setting against its range.
fn validate_numeric(key: SettingKey, value: &str) -> Result<u32, CommandError> {
    let (min, max) = key.range().expect("numeric keys have ranges");
    let parsed: u32 = value.parse().map_err(|_| CommandError::NotANumber {
        key: key.name().to_string(),
    })?;
    if parsed < min || parsed > max {
        return Err(CommandError::OutOfRange {
            key: key.name().to_string(),
            min,
            max,
        });
    }
    Ok(parsed)
}

/// Executes `!clank` commands against the registry, store, and generator.
pub struct CommandHandler {
    store: Arc<dyn Store>,
    generator: Arc<dyn Generator>,
    registry: Arc<ChannelRegistry>,
    default_model: String,
    pending_resets: DashMap<(String, String), Instant>,
}

impl CommandHandler {
    pub fn new(
        store: Arc<dyn Store>,
        generator: Arc<dyn Generator>,
        registry: Arc<ChannelRegistry>,
        default_model: String,
    ) -> Self {
        Self {
            store,
            generator,
            registry,
            default_model,
            pending_resets: DashMap::new(),
        }
    }

    /// Handle a command event. Returns the reply line to send, or `None` when
    /// the sender is not privileged (dropped silently).
    pub async fn handle(&self, event: &ChatEvent, command: ClankCommand) -> Option<String> {
        if !event.badges.is_privileged() {
            info!(
                channel = %event.channel,
                user = %event.display_name(),
                "Unprivileged sender attempted a command; dropping"
            );
            return None;
        }

        let who = event.display_name().to_string();
        let reply = match self.execute(event, command).await {
            Ok(text) => text,
            Err(e) => e.to_string(),
        };
        Some(format!("@{who} {reply}"))
    }

    async fn execute(
        &self,
        event: &ChatEvent,
        command: ClankCommand,
    ) -> Result<String, CommandError> {
        let channel = event.channel.as_str();
        match command {
            ClankCommand::Help => Ok(
                "commands: threshold [n], spontaneous [s], response [s], context [n], \
                 model [name], models, status, reset"
                    .to_string(),
            ),
            ClankCommand::Get(key) => self.show(channel, key).await,
            ClankCommand::Set(key, value) => self.set(channel, key, &value).await,
            ClankCommand::Models => self.list_models().await,
            ClankCommand::Status => self.status(channel).await,
            ClankCommand::Reset => {
                let user = event
                    .author_id
                    .clone()
                    .unwrap_or_else(|| event.display_name().to_string());
                self.pending_resets
                    .insert((channel.to_string(), user), Instant::now());
                Ok(format!(
                    "this will restore default settings for {channel}; send \
                     '!clank reset confirm' within 60s to proceed"
                ))
            }
            ClankCommand::ResetConfirm => {
                let user = event
                    .author_id
                    .clone()
                    .unwrap_or_else(|| event.display_name().to_string());
                let armed = self
                    .pending_resets
                    .remove(&(channel.to_string(), user))
                    .map(|(_, at)| at.elapsed() <= RESET_CONFIRM_WINDOW)
                    .unwrap_or(false);
                if !armed {
                    return Err(CommandError::ResetNotConfirmed);
                }
                self.registry.reset(channel).await.map_err(|e| {
                    warn!(channel = %channel, error = %e, "Reset failed");
                    CommandError::StoreFailed
                })?;
                info!(channel = %channel, "Channel settings restored to defaults");
                Ok("settings restored to defaults".to_string())
            }
        }
    }

    async fn show(&self, channel: &str, key: SettingKey) -> Result<String, CommandError> {
        let entry = self.registry.entry(channel).await.map_err(|e| {
            warn!(channel = %channel, error = %e, "Config read failed");
            CommandError::StoreFailed
        })?;
        let state = entry.snapshot();
        let value = match key {
            SettingKey::Threshold => state.message_threshold.to_string(),
            SettingKey::Spontaneous => state.spontaneous_cooldown_s.to_string(),
            SettingKey::Response => state.response_cooldown_s.to_string(),
            SettingKey::Context => state.context_limit.to_string(),
            SettingKey::Model => state
                .model_name
                .unwrap_or_else(|| "default (global)".to_string()),
        };
        Ok(format!("{}: {value}", key.name()))
    }

    async fn set(
        &self,
        channel: &str,
        key: SettingKey,
        value: &str,
    ) -> Result<String, CommandError> {
        let field = match key {
            SettingKey::Model => {
                let value = value.trim();
                if value.eq_ignore_ascii_case("default") {
                    ConfigField::Model(None)
                } else {
                    let catalog = self.generator.list_models().await.map_err(|e| {
                        warn!(error = %e, "Model catalog unavailable during set");
                        CommandError::UnknownModel(value.to_string())
                    })?;
                    if !catalog.iter().any(|m| m == value) {
                        return Err(CommandError::UnknownModel(value.to_string()));
                    }
                    ConfigField::Model(Some(value.to_string()))
                }
            }
            SettingKey::Threshold => ConfigField::Threshold(validate_numeric(key, value)?),
            SettingKey::Spontaneous => {
                ConfigField::SpontaneousCooldown(validate_numeric(key, value)?)
            }
            SettingKey::Response => ConfigField::ResponseCooldown(validate_numeric(key, value)?),
            SettingKey::Context => ConfigField::ContextLimit(validate_numeric(key, value)?),
        };

        self.registry.apply_field(channel, &field).await.map_err(|e| {
            warn!(channel = %channel, error = %e, "Config write failed");
            CommandError::StoreFailed
        })?;

        info!(channel = %channel, setting = key.name(), value = %value, "Configuration updated");
        Ok(format!("{} updated to {value}", key.name()))
    }

    async fn list_models(&self) -> Result<String, CommandError> {
        match self.generator.list_models().await {
            Ok(models) if models.is_empty() => Ok("no models available".to_string()),
            Ok(models) => Ok(format!("available models: {}", models.join(", "))),
            Err(_) => Ok("generator unavailable; could not list models".to_string()),
        }
    }

    async fn status(&self, channel: &str) -> Result<String, CommandError> {
        let entry = self.registry.entry(channel).await.map_err(|e| {
            warn!(channel = %channel, error = %e, "Status read failed");
            CommandError::StoreFailed
        })?;
        let state = entry.snapshot();

        let started = Instant::now();
        let generator_part = match self.generator.list_models().await {
            Ok(models) => {
                let elapsed = started.elapsed().as_millis();
                format!("generator: connected ({} models, {elapsed}ms)", models.len())
            }
            Err(_) => "generator: disconnected".to_string(),
        };

        let model = state
            .model_name
            .clone()
            .unwrap_or_else(|| format!("{} (default)", self.default_model));

        let spontaneous = match state.last_spontaneous_ms {
            Some(last) => {
                let elapsed_s = (chrono::Utc::now().timestamp_millis() - last) / 1000;
                let remaining = state.spontaneous_cooldown_s as i64 - elapsed_s;
                if remaining > 0 {
                    format!("{remaining}s")
                } else {
                    "ready".to_string()
                }
            }
            None => "ready".to_string(),
        };

        let mut parts = vec![
            generator_part,
            format!("model: {model}"),
            format!("messages: {}/{}", state.message_count, state.message_threshold),
            format!("spontaneous: {spontaneous}"),
            format!("response cooldown: {}s", state.response_cooldown_s),
        ];

        // Best-effort success rate over the last day; omitted when the store
        // has no samples.
        let successes = self
            .store
            .aggregate_metric(channel, MetricKind::GenerationSuccess.as_str(), STATUS_WINDOW)
            .await
            .map(|a| a.count)
            .unwrap_or(0);
        let failures = self
            .store
            .aggregate_metric(
                channel,
                MetricKind::GeneratorUnavailable.as_str(),
                STATUS_WINDOW,
            )
            .await
            .map(|a| a.count)
            .unwrap_or(0);
        if successes + failures > 0 {
            let rate = successes * 100 / (successes + failures);
            parts.push(format!("success (24h): {rate}%"));
        }

        Ok(format!("status - {}", parts.join(" | ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{BadgeSet, EventKind};
    use crate::generator::GeneratorError;
    use crate::store::{ChannelDefaults, SqliteStore, StoredMessage};
    use async_trait::async_trait;

    struct FixedCatalog(Vec<String>);

    #[async_trait]
    impl Generator for FixedCatalog {
        async fn list_models(&self) -> Result<Vec<String>, GeneratorError> {
            Ok(self.0.clone())
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn generate_spontaneous(
            &self,
            _: &str,
            _: &[StoredMessage],
            _: usize,
        ) -> Result<String, GeneratorError> {
            Err(GeneratorError::Invalid)
        }
        async fn generate_response(
            &self,
            _: &str,
            _: &[StoredMessage],
            _: &str,
            _: &str,
            _: usize,
        ) -> Result<String, GeneratorError> {
            Err(GeneratorError::Invalid)
        }
        async fn validate_startup_model(&self, _: &str) -> Result<(), GeneratorError> {
            Ok(())
        }
    }

    fn command_event(channel: &str, user: &str, content: &str, privileged: bool) -> ChatEvent {
        let badges = if privileged {
            BadgeSet::from_names(vec!["moderator".to_string()])
        } else {
            BadgeSet::default()
        };
        ChatEvent {
            channel: channel.to_string(),
            author_id: Some(user.to_string()),
            author_login: Some(user.to_string()),
            author_display_name: Some(user.to_uppercase()),
            badges,
            message_id: Some("cmd".to_string()),
            content: content.to_string(),
            timestamp_ms: 0,
            kind: EventKind::Message,
        }
    }

    async fn handler() -> CommandHandler {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(":memory:", 1).await.unwrap());
        let registry = Arc::new(ChannelRegistry::new(
            Arc::clone(&store),
            ChannelDefaults {
                message_threshold: 30,
                spontaneous_cooldown_s: 300,
                response_cooldown_s: 60,
                context_limit: 200,
            },
        ));
        let generator: Arc<dyn Generator> =
            Arc::new(FixedCatalog(vec!["llama3.2".into(), "mistral".into()]));
        CommandHandler::new(store, generator, registry, "llama3.2".into())
    }

    #[test]
    fn parse_recognizes_the_command_surface() {
        assert_eq!(parse("!clank"), Some(ClankCommand::Help));
        assert_eq!(parse("!clank help"), Some(ClankCommand::Help));
        assert_eq!(parse("!clank threshold"), Some(ClankCommand::Get(SettingKey::Threshold)));
        assert_eq!(
            parse("!clank threshold 50"),
            Some(ClankCommand::Set(SettingKey::Threshold, "50".into()))
        );
        assert_eq!(parse("!clank models"), Some(ClankCommand::Models));
        assert_eq!(parse("!clank status"), Some(ClankCommand::Status));
        assert_eq!(parse("!clank reset"), Some(ClankCommand::Reset));
        assert_eq!(parse("!clank reset confirm"), Some(ClankCommand::ResetConfirm));
        assert_eq!(parse("!clank bogus"), Some(ClankCommand::Help));
        assert_eq!(parse("hello there"), None);
        assert_eq!(parse("!clankier threshold"), None);
    }

    #[test]
    fn numeric_validation_enforces_ranges() {
        assert_eq!(validate_numeric(SettingKey::Threshold, "5").unwrap(), 5);
        assert_eq!(validate_numeric(SettingKey::Threshold, "200").unwrap(), 200);
        assert!(matches!(
            validate_numeric(SettingKey::Threshold, "4"),
            Err(CommandError::OutOfRange { .. })
        ));
        assert!(matches!(
            validate_numeric(SettingKey::Spontaneous, "59"),
            Err(CommandError::OutOfRange { .. })
        ));
        assert!(matches!(
            validate_numeric(SettingKey::Response, "1801"),
            Err(CommandError::OutOfRange { .. })
        ));
        assert!(matches!(
            validate_numeric(SettingKey::Context, "49"),
            Err(CommandError::OutOfRange { .. })
        ));
        assert!(matches!(
            validate_numeric(SettingKey::Context, "lots"),
            Err(CommandError::NotANumber { .. })
        ));
    }

    #[tokio::test]
    async fn unprivileged_senders_are_dropped_silently() {
        let handler = handler().await;
        let event = command_event("#chan", "pleb", "!clank threshold 50", false);
        let reply = handler.handle(&event, parse(&event.content).unwrap()).await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let handler = handler().await;
        let set = command_event("#chan", "mod1", "!clank threshold 50", true);
        let reply = handler
            .handle(&set, parse(&set.content).unwrap())
            .await
            .unwrap();
        assert!(reply.contains("threshold updated to 50"));

        let get = command_event("#chan", "mod1", "!clank threshold", true);
        let reply = handler
            .handle(&get, parse(&get.content).unwrap())
            .await
            .unwrap();
        assert!(reply.contains("threshold: 50"));
    }

    #[tokio::test]
    async fn invalid_value_changes_nothing() {
        let handler = handler().await;
        let set = command_event("#chan", "mod1", "!clank threshold 9999", true);
        let reply = handler
            .handle(&set, parse(&set.content).unwrap())
            .await
            .unwrap();
        assert!(reply.contains("between 5 and 200"));

        let get = command_event("#chan", "mod1", "!clank threshold", true);
        let reply = handler
            .handle(&get, parse(&get.content).unwrap())
            .await
            .unwrap();
        assert!(reply.contains("threshold: 30"));
    }

    #[tokio::test]
    async fn model_set_validates_against_catalog() {
        let handler = handler().await;
        let bad = command_event("#chan", "mod1", "!clank model gpt-unreal", true);
        let reply = handler
            .handle(&bad, parse(&bad.content).unwrap())
            .await
            .unwrap();
        assert!(reply.contains("not available"));

        let good = command_event("#chan", "mod1", "!clank model mistral", true);
        let reply = handler
            .handle(&good, parse(&good.content).unwrap())
            .await
            .unwrap();
        assert!(reply.contains("model updated to mistral"));

        let back = command_event("#chan", "mod1", "!clank model default", true);
        let reply = handler
            .handle(&back, parse(&back.content).unwrap())
            .await
            .unwrap();
        assert!(reply.contains("model updated to default"));
    }

    #[tokio::test]
    async fn reset_requires_confirm_from_same_user() {
        let handler = handler().await;

        // Confirm without arming fails.
        let cold = command_event("#chan", "mod1", "!clank reset confirm", true);
        let reply = handler
            .handle(&cold, parse(&cold.content).unwrap())
            .await
            .unwrap();
        assert!(reply.contains("confirmation expired or missing"));

        // Arm as mod1, confirm as mod2: refused.
        let arm = command_event("#chan", "mod1", "!clank reset", true);
        handler.handle(&arm, parse(&arm.content).unwrap()).await.unwrap();
        let other = command_event("#chan", "mod2", "!clank reset confirm", true);
        let reply = handler
            .handle(&other, parse(&other.content).unwrap())
            .await
            .unwrap();
        assert!(reply.contains("confirmation expired or missing"));

        // Same user confirms.
        let arm = command_event("#chan", "mod1", "!clank reset", true);
        handler.handle(&arm, parse(&arm.content).unwrap()).await.unwrap();
        let confirm = command_event("#chan", "mod1", "!clank reset confirm", true);
        let reply = handler
            .handle(&confirm, parse(&confirm.content).unwrap())
            .await
            .unwrap();
        assert!(reply.contains("settings restored to defaults"));
    }

    #[tokio::test]
    async fn status_reports_counters_and_generator() {
        let handler = handler().await;
        let event = command_event("#chan", "mod1", "!clank status", true);
        let reply = handler
            .handle(&event, parse(&event.content).unwrap())
            .await
            .unwrap();
        assert!(reply.contains("generator: connected (2 models"));
        assert!(reply.contains("messages: 0/30"));
        assert!(reply.contains("spontaneous: ready"));
    }
}
