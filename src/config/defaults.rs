//! Default value functions for configuration.
//!
//! Separated into its own module for clarity and reuse.

/// Returns `true` (for serde defaults).
pub fn default_true() -> bool {
    true
}

// =============================================================================
// Store Defaults
// =============================================================================

pub fn default_store_path() -> String {
    "clank.db".to_string()
}

pub fn default_max_connections() -> u32 {
    5
}

// =============================================================================
// Generator Defaults
// =============================================================================

pub fn default_generator_base_url() -> String {
    "http://localhost:11434".to_string()
}

pub fn default_generator_timeout_secs() -> u64 {
    30
}

// =============================================================================
// Chat Defaults
// =============================================================================

pub fn default_chat_server() -> String {
    "irc.chat.twitch.tv".to_string()
}

pub fn default_chat_port() -> u16 {
    6697
}

pub fn default_token_url() -> String {
    "https://id.twitch.tv/oauth2/token".to_string()
}

// =============================================================================
// Filter Defaults
// =============================================================================

pub fn default_blocked_terms_file() -> String {
    "blocked_terms.txt".to_string()
}

// =============================================================================
// Per-Channel Limit Defaults
// =============================================================================

pub fn default_message_threshold() -> u32 {
    30
}

pub fn default_spontaneous_cooldown_s() -> u32 {
    300
}

pub fn default_response_cooldown_s() -> u32 {
    60
}

pub fn default_context_limit() -> u32 {
    200
}

pub fn default_mailbox_depth() -> usize {
    64
}

// =============================================================================
// Retention Defaults
// =============================================================================

pub fn default_messages_days() -> u32 {
    7
}

pub fn default_metrics_days() -> u32 {
    7
}

pub fn default_cooldowns_days() -> u32 {
    30
}

pub fn default_cleanup_interval_minutes() -> u64 {
    60
}

// =============================================================================
// Log Defaults
// =============================================================================

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_log_format() -> String {
    "console".to_string()
}
