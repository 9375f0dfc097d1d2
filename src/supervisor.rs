//! Lifecycle: startup validation in strict order, background maintenance,
//! and signal-driven graceful shutdown.
//!
//! The supervisor is the composition root: it builds every component, hands
//! out dependencies explicitly, and is the only layer allowed to terminate
//! the process.

use crate::auth::{plaintext_permitted, AuthManager, TokenCipher};
use crate::channels::ChannelRegistry;
use crate::chat::{run_chat, ChatHandle, ChatParams};
use crate::commands::CommandHandler;
use crate::config::{Config, StoreBackend};
use crate::filter::ContentFilter;
use crate::generator::{Generator, HttpGenerator};
use crate::metrics::MetricsRecorder;
use crate::processor::{Processor, ProcessorDeps};
use crate::store::{self, ChannelDefaults, RetentionPolicy, Store};
use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Grace given to in-flight generations at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Metric flush cadence.
const METRIC_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the inbound event pipe between chat and processor.
const EVENT_PIPE_DEPTH: usize = 1024;

/// Run the bot until a shutdown signal. Errors returned from here are
/// startup-fatal and map to a non-zero exit.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();

    // 1. Global defaults.
    let defaults = ChannelDefaults::from(&config.limits);

    // 2. Store: open, verify schema, run migrations.
    let store: Arc<dyn Store> = store::open(&config.store)
        .await
        .context("store initialization failed")?;
    info!(backend = store.backend_name(), "Store ready");

    // 3. Auth material; refresh once if expired.
    let cipher = build_cipher(&config)?;
    let auth = AuthManager::new(
        Arc::clone(&store),
        cipher,
        config.chat.client_id.clone(),
        config.chat.client_secret.clone(),
        config.chat.token_url.clone(),
    )?;
    auth.seed_if_configured(
        config.chat.initial_access_token.as_deref(),
        config.chat.initial_refresh_token.as_deref(),
        config.chat.bot_username.as_deref(),
    )
    .await?;
    let material = auth
        .ensure_valid()
        .await
        .context("authentication failed at startup")?;
    let bot_username = material
        .bot_username
        .clone()
        .or_else(|| config.chat.bot_username.clone())
        .context("bot username unknown; set chat.bot_username for the first run")?;
    info!(bot = %bot_username, "Auth material ready");

    // 4. Generator: probe and validate the global default model.
    let generator: Arc<dyn Generator> = Arc::new(HttpGenerator::new(&config.generator)?);
    if !generator.is_available().await {
        warn!("Generator health probe failed; validating model catalog anyway");
    }
    generator
        .validate_startup_model(&config.generator.default_model)
        .await
        .context("generator startup validation failed")?;
    info!(model = %config.generator.default_model, "Generator ready");

    // Filter degrades rather than failing startup; degraded blocks all.
    let filter = Arc::new(ContentFilter::new(
        &config.filter.blocked_terms_file,
        config.filter.enabled,
        config.filter.strict,
    ));

    let metrics = MetricsRecorder::new(Arc::clone(&store));
    metrics.spawn_flush_task(METRIC_FLUSH_INTERVAL, shutdown.clone(), &tracker);

    // 5. Connect to the chat network and join configured channels.
    let handle = Arc::new(ChatHandle::new());
    let (events_tx, events_rx) = mpsc::channel(EVENT_PIPE_DEPTH);
    {
        let params = ChatParams {
            server: config.chat.server.clone(),
            port: config.chat.port,
            use_tls: config.chat.use_tls,
            bot_username: bot_username.clone(),
            access_token: material.access_token.clone(),
            channels: config.chat.channels.clone(),
        };
        let handle = Arc::clone(&handle);
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            run_chat(params, handle, events_tx, shutdown).await;
        });
    }

    // 6. Restore per-channel counters and configuration.
    let registry = Arc::new(ChannelRegistry::new(Arc::clone(&store), defaults));
    registry
        .load_all(&config.chat.channels)
        .await
        .context("channel state restore failed")?;

    // 7. Periodic cleanup.
    spawn_cleanup_task(
        Arc::clone(&store),
        Arc::clone(&filter),
        &config,
        shutdown.clone(),
        &tracker,
    );

    // 8. The message-processing loop.
    let commands = CommandHandler::new(
        Arc::clone(&store),
        Arc::clone(&generator),
        Arc::clone(&registry),
        config.generator.default_model.clone(),
    );
    let processor = Processor::new(ProcessorDeps {
        store: Arc::clone(&store),
        generator,
        egress: handle,
        filter,
        registry,
        metrics: Arc::clone(&metrics),
        commands,
        bot_username,
        known_bots: config.chat.known_bots.clone(),
        default_model: config.generator.default_model.clone(),
        mailbox_depth: config.limits.mailbox_depth,
        shutdown: shutdown.clone(),
        tracker: tracker.clone(),
    });

    info!(channels = config.chat.channels.len(), "Startup complete");

    tokio::select! {
        _ = processor.run(events_rx) => {
            error!("Event pipeline ended unexpectedly");
        }
        _ = wait_for_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Shutdown: gate new work, let in-flight generations finish within the
    // grace window, flush metrics, release everything.
    shutdown.cancel();
    tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait())
        .await
        .is_err()
    {
        warn!(grace_s = SHUTDOWN_GRACE.as_secs(), "Tasks still running after grace; exiting anyway");
    }
    metrics.flush().await;
    info!("Shutdown complete");
    Ok(())
}

/// Pick the token cipher per configuration and backend policy.
fn build_cipher(config: &Config) -> anyhow::Result<TokenCipher> {
    if let Some(key) = &config.security.token_encryption_key {
        return Ok(TokenCipher::from_key_b64(key)?);
    }
    match config.store.backend {
        StoreBackend::Sqlite => {
            let path = std::path::Path::new(&config.store.path);
            if config.store.path != ":memory:" && !plaintext_permitted(path) {
                bail!(
                    "token encryption key missing and {} is not restricted to the \
                     service user; set security.token_encryption_key or chmod 600 the file",
                    config.store.path
                );
            }
            warn!("No token encryption key configured; storing tokens in plaintext (embedded store)");
            Ok(TokenCipher::plaintext())
        }
        // Unreachable after config validation, kept as a backstop.
        StoreBackend::Postgres => bail!("token encryption key is required for the networked store"),
    }
}

fn spawn_cleanup_task(
    store: Arc<dyn Store>,
    filter: Arc<ContentFilter>,
    config: &Config,
    shutdown: CancellationToken,
    tracker: &TaskTracker,
) {
    let policy = RetentionPolicy {
        messages_days: config.retention.messages_days,
        metrics_days: config.retention.metrics_days,
        cooldowns_days: config.retention.cooldowns_days,
    };
    let interval = Duration::from_secs(config.retention.cleanup_interval_minutes * 60);
    tracker.spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays light.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match store.cleanup(&policy).await {
                        Ok(report) => info!(
                            messages = report.messages_deleted,
                            metrics = report.metrics_deleted,
                            cooldowns = report.cooldowns_deleted,
                            "Retention cleanup complete"
                        ),
                        Err(e) => warn!(error = %e, "Retention cleanup failed"),
                    }
                    if filter.is_degraded() {
                        match filter.reload() {
                            Ok(terms) => info!(terms, "Blocked terms reloaded; filter recovered"),
                            Err(e) => warn!(error = %e, "Filter still degraded"),
                        }
                    }
                }
            }
        }
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable; ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
