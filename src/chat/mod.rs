//! Chat-network adapter: structured inbound events and the egress seam.
//!
//! The wire protocol is handled by the `irc` crate; this module maps its
//! parsed messages into the event shape the Processor consumes, and exposes
//! the narrow [`Egress`] contract outbound text goes through.

mod client;
mod tags;

pub use client::{run_chat, ChatHandle, ChatParams};
pub use tags::chat_event_from_irc;

use crate::error::ChatError;
use async_trait::async_trait;
use std::collections::HashSet;

/// Maximum bytes in one outbound chat line.
pub const MESSAGE_BYTE_LIMIT: usize = 500;

/// What an inbound event means for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A user message.
    Message,
    /// Moderation: a single message was deleted.
    Delete { message_id: String },
    /// Moderation: a user was timed out or banned; their messages go away.
    UserClear { user_id: String },
    /// Moderation: the whole channel history was cleared.
    ChannelClear,
    /// Server notice or other authorless traffic.
    System,
}

/// Capability tags attached to the author (broadcaster, moderator, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BadgeSet(HashSet<String>);

impl BadgeSet {
    pub fn from_names<I: IntoIterator<Item = String>>(names: I) -> Self {
        Self(names.into_iter().collect())
    }

    pub fn is_broadcaster(&self) -> bool {
        self.0.contains("broadcaster")
    }

    pub fn is_moderator(&self) -> bool {
        self.0.contains("moderator")
    }

    /// Privileged senders may use configuration commands.
    pub fn is_privileged(&self) -> bool {
        self.is_broadcaster() || self.is_moderator()
    }
}

/// Structured inbound event from the chat network.
#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub channel: String,
    /// Stable author identifier; absent on system traffic.
    pub author_id: Option<String>,
    /// Lowercase login name, used for self/known-bot checks.
    pub author_login: Option<String>,
    pub author_display_name: Option<String>,
    pub badges: BadgeSet,
    pub message_id: Option<String>,
    pub content: String,
    pub timestamp_ms: i64,
    pub kind: EventKind,
}

impl ChatEvent {
    /// Display name with login fallback, for prompts and replies.
    pub fn display_name(&self) -> &str {
        self.author_display_name
            .as_deref()
            .or(self.author_login.as_deref())
            .unwrap_or("someone")
    }
}

/// Outbound text sink. One line per call, at most 500 bytes.
#[async_trait]
pub trait Egress: Send + Sync {
    async fn send(&self, channel: &str, text: &str) -> Result<(), ChatError>;
}
