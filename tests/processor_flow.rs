//! End-to-end pipeline tests: inbound events through classification,
//! filtering, storage, trigger evaluation, generation, and egress.

mod common;

use clank::chat::EventKind;
use clank::metrics::MetricKind;
use clank::store::ChannelDefaults;
use common::*;

fn fast_defaults(threshold: u32) -> ChannelDefaults {
    ChannelDefaults {
        message_threshold: threshold,
        spontaneous_cooldown_s: 0,
        response_cooldown_s: 60,
        context_limit: 10,
    }
}

#[tokio::test]
async fn threshold_fires_once_and_only_with_adequate_context() {
    // threshold=5, no channel cooldown, context_limit=10. The counter crosses
    // the threshold at message 5, but the 10-message context floor holds the
    // emission back until message 10.
    let harness = Harness::new(fast_defaults(5)).await;

    for i in 0..14 {
        harness
            .push(user_message("#c1", &format!("user{i}"), &format!("chatter {i}")))
            .await;
    }

    let lines = harness.egress.lines_for("#c1");
    assert_eq!(lines.len(), 1, "exactly one spontaneous emission");
    assert_eq!(lines[0], "a perfectly normal line");

    let entry = harness.registry.entry("#c1").await.unwrap();
    let state = entry.snapshot();
    assert!(state.last_spontaneous_ms.is_some());
    // Reset at the emission (message 10), then four more messages arrived.
    assert_eq!(state.message_count, 4);

    // Declines before message 10 were for inadequate context.
    assert!(harness.metric_count("#c1", MetricKind::InadequateContext).await >= 1);
}

#[tokio::test]
async fn mention_bypasses_threshold_and_leaves_spontaneous_state_alone() {
    let harness = Harness::new(defaults()).await; // threshold 30

    harness.push(user_message("#c1", "u1", "@clank hi")).await;

    let lines = harness.egress.lines_for("#c1");
    assert_eq!(lines.len(), 1, "one response despite threshold 30");
    assert_eq!(harness.generator.response_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    let state = harness.registry.entry("#c1").await.unwrap().snapshot();
    assert_eq!(state.last_spontaneous_ms, None, "responses never stamp the channel cooldown");
    assert_eq!(state.message_count, 1, "the mention itself still counts");
}

#[tokio::test]
async fn response_cooldown_is_per_user() {
    let harness = Harness::new(defaults()).await;

    harness.push(user_message("#c1", "u1", "@clank first")).await;
    assert_eq!(harness.egress.lines_for("#c1").len(), 1);

    // Same user inside the 60s cooldown: declined.
    harness.push(user_message("#c1", "u1", "@clank again")).await;
    assert_eq!(harness.egress.lines_for("#c1").len(), 1);
    assert_eq!(harness.metric_count("#c1", MetricKind::RateLimitHit).await, 1);

    // A different user is unaffected.
    harness.push(user_message("#c1", "u2", "@clank hello")).await;
    assert_eq!(harness.egress.lines_for("#c1").len(), 2);

    // Once the stamp ages past the cooldown, the first user is heard again.
    let past = chrono::Utc::now().timestamp_millis() - 61_000;
    harness.store.stamp_user_cooldown("#c1", "u1", past).await.unwrap();
    harness.push(user_message("#c1", "u1", "@clank once more")).await;
    assert_eq!(harness.egress.lines_for("#c1").len(), 3);
}

#[tokio::test]
async fn ban_purges_context_but_not_counters() {
    let harness = Harness::new(defaults()).await;

    for i in 0..4 {
        harness
            .push(user_message("#c1", "u3", &format!("doomed {i}")))
            .await;
    }
    harness.push(user_message("#c1", "u4", "innocent")).await;

    harness
        .push(moderation(
            "#c1",
            EventKind::UserClear { user_id: "u3".into() },
        ))
        .await;

    let recent = harness.store.recent_messages("#c1", 50).await.unwrap();
    assert!(recent.iter().all(|m| m.user_id != "u3"));
    assert_eq!(recent.len(), 1);

    let state = harness.registry.entry("#c1").await.unwrap().snapshot();
    assert_eq!(state.message_count, 5, "moderation leaves counters untouched");
}

#[tokio::test]
async fn generator_outage_is_silent_and_preserves_state() {
    let harness = Harness::with_generator(fast_defaults(3), Behavior::Unavailable).await;

    for i in 0..12 {
        harness
            .push(user_message("#c1", &format!("user{i}"), &format!("line {i}")))
            .await;
    }

    assert!(harness.egress.lines_for("#c1").is_empty(), "no emissions, no placeholders");

    let state = harness.registry.entry("#c1").await.unwrap().snapshot();
    assert_eq!(state.last_spontaneous_ms, None);
    assert_eq!(state.message_count, 12, "counter keeps accumulating");

    assert_eq!(
        harness.store.recent_messages("#c1", 50).await.unwrap().len(),
        12,
        "inbound messages are stored regardless"
    );
    assert!(harness.metric_count("#c1", MetricKind::GeneratorUnavailable).await >= 1);
}

#[tokio::test]
async fn blocked_generation_is_dropped_without_stamping() {
    let harness = Harness::with_generator(
        fast_defaults(3),
        Behavior::Text("well badterm to you too".into()),
    )
    .await;

    for i in 0..10 {
        harness
            .push(user_message("#c1", &format!("user{i}"), &format!("line {i}")))
            .await;
    }

    assert!(harness.egress.lines_for("#c1").is_empty());

    let state = harness.registry.entry("#c1").await.unwrap().snapshot();
    assert_eq!(state.last_spontaneous_ms, None, "blocked output never stamps");
    assert_eq!(state.message_count, 10, "blocked output never resets the counter");
    assert_eq!(harness.metric_count("#c1", MetricKind::FilterBlockOutput).await, 1);
}

#[tokio::test]
async fn blocked_input_never_reaches_the_store() {
    let harness = Harness::new(defaults()).await;

    harness.push(user_message("#c1", "u1", "you utter badterm")).await;
    harness.push(user_message("#c1", "u1", "b4dt3rm evasion")).await;

    assert!(harness.store.recent_messages("#c1", 10).await.unwrap().is_empty());
    let state = harness.registry.entry("#c1").await.unwrap().snapshot();
    assert_eq!(state.message_count, 0);
    assert_eq!(harness.metric_count("#c1", MetricKind::FilterBlockInput).await, 2);
}

#[tokio::test]
async fn mention_with_blocked_content_is_never_seen() {
    let harness = Harness::new(defaults()).await;

    harness.push(user_message("#c1", "u1", "@clank say badterm")).await;

    assert!(harness.egress.lines_for("#c1").is_empty(), "input filter runs first");
    assert_eq!(
        harness.generator.response_calls.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
    assert!(harness.store.recent_messages("#c1", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn self_and_known_bot_messages_are_ignored() {
    let harness = Harness::new(defaults()).await;

    harness.push(user_message("#c1", BOT, "i am the bot")).await;
    harness.push(user_message("#c1", "somebot", "configured bot")).await;
    harness.push(user_message("#c1", "Nightbot", "builtin bot")).await;

    let mut authorless = user_message("#c1", "ghost", "no id");
    authorless.author_id = None;
    authorless.author_login = None;
    harness.push(authorless).await;

    assert!(harness.store.recent_messages("#c1", 10).await.unwrap().is_empty());
    let state = harness.registry.entry("#c1").await.unwrap().snapshot();
    assert_eq!(state.message_count, 0);
}

#[tokio::test]
async fn duplicate_message_ids_store_once() {
    let harness = Harness::new(defaults()).await;

    let event = user_message("#c1", "u1", "same message");
    harness.push(event.clone()).await;
    harness.push(event).await;

    assert_eq!(harness.store.recent_messages("#c1", 10).await.unwrap().len(), 1);
    let state = harness.registry.entry("#c1").await.unwrap().snapshot();
    assert_eq!(state.message_count, 1);
}

#[tokio::test]
async fn commands_are_handled_and_never_stored() {
    let harness = Harness::new(defaults()).await;

    harness.push(mod_message("#c1", "mod1", "!clank threshold 50")).await;
    let lines = harness.egress.lines_for("#c1");
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("threshold updated to 50"));

    // The command line is not a message: nothing stored, nothing counted.
    assert!(harness.store.recent_messages("#c1", 10).await.unwrap().is_empty());
    let state = harness.registry.entry("#c1").await.unwrap().snapshot();
    assert_eq!(state.message_count, 0);
    assert_eq!(state.message_threshold, 50);

    // Unprivileged senders get silence.
    harness.push(user_message("#c1", "pleb", "!clank threshold 60")).await;
    assert_eq!(harness.egress.lines_for("#c1").len(), 1);
    let state = harness.registry.entry("#c1").await.unwrap().snapshot();
    assert_eq!(state.message_threshold, 50);
}

#[tokio::test]
async fn moderation_delete_removes_message_from_read_view() {
    let harness = Harness::new(defaults()).await;

    let event = user_message("#c1", "u1", "soon gone");
    let message_id = event.message_id.clone().unwrap();
    harness.push(event).await;
    harness.push(user_message("#c1", "u1", "still here")).await;

    harness
        .push(moderation("#c1", EventKind::Delete { message_id: message_id.clone() }))
        .await;

    let recent = harness.store.recent_messages("#c1", 10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert!(recent.iter().all(|m| m.message_id != message_id));
}

#[tokio::test]
async fn channel_clear_empties_the_read_view() {
    let harness = Harness::new(defaults()).await;

    for i in 0..3 {
        harness
            .push(user_message("#c1", "u1", &format!("line {i}")))
            .await;
    }
    harness.push(moderation("#c1", EventKind::ChannelClear)).await;

    assert!(harness.store.recent_messages("#c1", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn zero_context_budget_never_invokes_the_generator() {
    let harness = Harness::new(ChannelDefaults {
        message_threshold: 1,
        spontaneous_cooldown_s: 0,
        response_cooldown_s: 60,
        context_limit: 0,
    })
    .await;

    for i in 0..12 {
        harness
            .push(user_message("#c1", &format!("user{i}"), &format!("line {i}")))
            .await;
    }

    assert_eq!(
        harness.generator.spontaneous_calls.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
    assert!(harness.egress.lines_for("#c1").is_empty());
}

#[tokio::test]
async fn invalid_generation_is_counted_and_silent() {
    let harness = Harness::with_generator(fast_defaults(3), Behavior::Invalid).await;

    for i in 0..10 {
        harness
            .push(user_message("#c1", &format!("user{i}"), &format!("line {i}")))
            .await;
    }

    assert!(harness.egress.lines_for("#c1").is_empty());
    assert!(harness.metric_count("#c1", MetricKind::InvalidOutput).await >= 1);
    let state = harness.registry.entry("#c1").await.unwrap().snapshot();
    assert_eq!(state.last_spontaneous_ms, None);
}

#[tokio::test]
async fn channels_are_isolated_end_to_end() {
    let harness = Harness::new(fast_defaults(3)).await;

    for i in 0..10 {
        harness
            .push(user_message("#alpha", &format!("user{i}"), &format!("alpha {i}")))
            .await;
    }
    harness.push(user_message("#beta", "u1", "lonely message")).await;

    // Alpha fired; beta (1 message, threshold 3, context 1) did not.
    assert_eq!(harness.egress.lines_for("#alpha").len(), 1);
    assert!(harness.egress.lines_for("#beta").is_empty());

    let beta = harness.registry.entry("#beta").await.unwrap().snapshot();
    assert_eq!(beta.message_count, 1);
    assert_eq!(beta.last_spontaneous_ms, None);

    let beta_messages = harness.store.recent_messages("#beta", 50).await.unwrap();
    assert_eq!(beta_messages.len(), 1);
    assert!(beta_messages.iter().all(|m| m.channel == "#beta"));
}
