//! Mapping from library-parsed IRC messages to [`ChatEvent`]s.
//!
//! The chat network annotates messages with IRCv3 tags: `id` (message id),
//! `user-id`, `display-name`, `badges`, and `target-msg-id` /
//! `target-user-id` on moderation commands.

use super::{BadgeSet, ChatEvent, EventKind};
use irc::proto::{Command, Message};

fn tag_value<'a>(message: &'a Message, name: &str) -> Option<&'a str> {
    message
        .tags
        .as_ref()?
        .iter()
        .find(|tag| tag.0 == name)
        .and_then(|tag| tag.1.as_deref())
}

fn badges_from_tag(raw: Option<&str>) -> BadgeSet {
    let names = raw
        .unwrap_or("")
        .split(',')
        .filter_map(|entry| entry.split('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    BadgeSet::from_names(names)
}

/// Translate one parsed IRC message into a pipeline event.
///
/// Returns `None` for protocol traffic the pipeline has no interest in
/// (PING/PONG, JOIN confirmations, numerics, capability acks).
pub fn chat_event_from_irc(message: &Message) -> Option<ChatEvent> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    match &message.command {
        Command::PRIVMSG(target, text) => {
            let login = message.source_nickname().map(|n| n.to_ascii_lowercase());
            Some(ChatEvent {
                channel: target.clone(),
                author_id: tag_value(message, "user-id").map(str::to_string),
                author_login: login,
                author_display_name: tag_value(message, "display-name").map(str::to_string),
                badges: badges_from_tag(tag_value(message, "badges")),
                message_id: tag_value(message, "id").map(str::to_string),
                content: text.clone(),
                timestamp_ms: now_ms,
                kind: EventKind::Message,
            })
        }
        Command::Raw(command, params) if command == "CLEARMSG" => {
            let channel = params.first()?.clone();
            let message_id = tag_value(message, "target-msg-id")?.to_string();
            Some(ChatEvent {
                channel,
                author_id: None,
                author_login: None,
                author_display_name: None,
                badges: BadgeSet::default(),
                message_id: None,
                content: String::new(),
                timestamp_ms: now_ms,
                kind: EventKind::Delete { message_id },
            })
        }
        Command::Raw(command, params) if command == "CLEARCHAT" => {
            let channel = params.first()?.clone();
            let kind = match tag_value(message, "target-user-id") {
                Some(user_id) => EventKind::UserClear {
                    user_id: user_id.to_string(),
                },
                None => EventKind::ChannelClear,
            };
            Some(ChatEvent {
                channel,
                author_id: None,
                author_login: None,
                author_display_name: None,
                badges: BadgeSet::default(),
                message_id: None,
                content: String::new(),
                timestamp_ms: now_ms,
                kind,
            })
        }
        Command::NOTICE(target, text) => Some(ChatEvent {
            channel: target.clone(),
            author_id: None,
            author_login: None,
            author_display_name: None,
            badges: BadgeSet::default(),
            message_id: None,
            content: text.clone(),
            timestamp_ms: now_ms,
            kind: EventKind::System,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn privmsg_maps_to_user_message_with_tags() {
        let raw = "@badges=moderator/1;display-name=Ana;id=abc-123;user-id=42 \
                   :ana!ana@ana.tmi PRIVMSG #chan :hello there";
        let message = Message::from_str(raw).unwrap();
        let event = chat_event_from_irc(&message).unwrap();

        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.channel, "#chan");
        assert_eq!(event.content, "hello there");
        assert_eq!(event.author_id.as_deref(), Some("42"));
        assert_eq!(event.author_login.as_deref(), Some("ana"));
        assert_eq!(event.author_display_name.as_deref(), Some("Ana"));
        assert_eq!(event.message_id.as_deref(), Some("abc-123"));
        assert!(event.badges.is_moderator());
        assert!(!event.badges.is_broadcaster());
    }

    #[test]
    fn clearmsg_maps_to_delete() {
        let raw = "@target-msg-id=dead-beef :tmi CLEARMSG #chan :the text";
        let message = Message::from_str(raw).unwrap();
        let event = chat_event_from_irc(&message).unwrap();
        assert_eq!(
            event.kind,
            EventKind::Delete {
                message_id: "dead-beef".into()
            }
        );
        assert_eq!(event.channel, "#chan");
    }

    #[test]
    fn clearchat_with_target_maps_to_user_clear() {
        let raw = "@ban-duration=600;target-user-id=99 :tmi CLEARCHAT #chan :someuser";
        let message = Message::from_str(raw).unwrap();
        let event = chat_event_from_irc(&message).unwrap();
        assert_eq!(event.kind, EventKind::UserClear { user_id: "99".into() });
    }

    #[test]
    fn clearchat_without_target_maps_to_channel_clear() {
        let raw = ":tmi CLEARCHAT #chan";
        let message = Message::from_str(raw).unwrap();
        let event = chat_event_from_irc(&message).unwrap();
        assert_eq!(event.kind, EventKind::ChannelClear);
    }

    #[test]
    fn ping_is_ignored() {
        let message = Message::from_str("PING :tmi").unwrap();
        assert!(chat_event_from_irc(&message).is_none());
    }

    #[test]
    fn authorless_notice_maps_to_system() {
        let raw = ":tmi NOTICE #chan :slow mode on";
        let message = Message::from_str(raw).unwrap();
        let event = chat_event_from_irc(&message).unwrap();
        assert_eq!(event.kind, EventKind::System);
        assert!(event.author_id.is_none());
    }
}
