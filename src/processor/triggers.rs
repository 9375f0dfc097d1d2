//! Trigger predicates for the two generation disciplines.
//!
//! The two disciplines share no state: mention responses are gated only by
//! the per-user cooldown, spontaneous emissions only by the channel counter,
//! the channel cooldown, and context adequacy.

use crate::channels::LiveState;

/// Stored messages required before any spontaneous generation makes sense.
pub const MIN_CONTEXT: i64 = 10;

/// Why the spontaneous path declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decline {
    BelowThreshold,
    CooldownActive,
    NoContextBudget,
}

/// Synchronous part of the spontaneous gate: counter, channel cooldown, and
/// the context budget. Context availability (`count_recent`) is checked by
/// the caller against the store.
pub fn spontaneous_gate(state: &LiveState, now_ms: i64) -> Result<(), Decline> {
    if state.context_limit == 0 {
        return Err(Decline::NoContextBudget);
    }
    if state.message_count < state.message_threshold as i64 {
        return Err(Decline::BelowThreshold);
    }
    if let Some(last) = state.last_spontaneous_ms {
        let cooldown_ms = state.spontaneous_cooldown_s as i64 * 1000;
        if now_ms - last < cooldown_ms {
            return Err(Decline::CooldownActive);
        }
    }
    Ok(())
}

/// Per-user response gate: true when the cooldown has elapsed (or the user
/// was never responded to).
pub fn response_ready(last_response_ms: Option<i64>, cooldown_s: u32, now_ms: i64) -> bool {
    match last_response_ms {
        Some(last) => now_ms - last >= cooldown_s as i64 * 1000,
        None => true,
    }
}

/// Trailing punctuation tolerated after the bot name in a mention.
fn trim_mention_punctuation(token: &str) -> &str {
    token.trim_end_matches([':', ',', '!', '?', '.'])
}

/// Mention predicate: the first token is the bot's name, with or without a
/// leading at-sign, case-insensitive.
pub fn is_mention(content: &str, bot_username: &str) -> bool {
    let first = match content.split_whitespace().next() {
        Some(token) => token,
        None => return false,
    };
    let first = trim_mention_punctuation(first.strip_prefix('@').unwrap_or(first));
    first.eq_ignore_ascii_case(bot_username)
}

/// The text after the mention token, for the response prompt. Returns the
/// whole content when the message is not a mention.
pub fn mention_content<'a>(content: &'a str, bot_username: &str) -> &'a str {
    if !is_mention(content, bot_username) {
        return content;
    }
    let trimmed = content.trim_start();
    match trimmed.split_once(char::is_whitespace) {
        Some((_, rest)) => rest.trim(),
        None => "",
    }
}
