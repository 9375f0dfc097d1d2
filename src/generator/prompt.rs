//! Prompt templates and context rendering for the generation backend.

use crate::store::StoredMessage;

/// Instruction for an utterance that joins the conversation without
/// addressing anyone.
pub const SPONTANEOUS_TEMPLATE: &str = "Generate a single casual chat message that fits naturally \
with the recent conversation. Be conversational and match the tone of recent messages. Don't \
reference specific users or respond to anyone directly - just add to the conversation naturally. \
Keep it under 500 characters and avoid special formatting. Generate only the message content, \
nothing else.";

/// Instruction for a reply addressed to the mentioning user.
pub const RESPONSE_TEMPLATE: &str = "Generate a single casual response to the user's message, \
considering the recent chat context. Be conversational and match the tone of the chat. Address \
the user's input naturally but don't be overly formal. Keep it under 500 characters and avoid \
special formatting. Generate only the response content, nothing else.";

/// Render recent messages as `[display_name]: content` lines, newest last.
fn render_context(messages: &[StoredMessage]) -> String {
    let mut lines = vec!["Recent chat messages:".to_string()];
    if messages.is_empty() {
        lines.push("(No recent messages)".to_string());
    } else {
        for msg in messages {
            lines.push(format!("[{}]: {}", msg.user_display_name, msg.content));
        }
    }
    lines.join("\n")
}

/// Full prompt for a spontaneous utterance.
pub fn spontaneous_prompt(messages: &[StoredMessage]) -> String {
    format!(
        "{SPONTANEOUS_TEMPLATE}\n\n{}\n\nGenerate a natural chat message that fits the conversation.",
        render_context(messages)
    )
}

/// Full prompt for a mention response.
pub fn response_prompt(messages: &[StoredMessage], user_name: &str, user_text: &str) -> String {
    format!(
        "{RESPONSE_TEMPLATE}\n\n{}\n\nGenerate a response to {user_name}'s message: \"{user_text}\"",
        render_context(messages)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(name: &str, content: &str) -> StoredMessage {
        StoredMessage {
            message_id: "m".into(),
            channel: "#chan".into(),
            user_id: name.to_lowercase(),
            user_display_name: name.into(),
            content: content.into(),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn context_lines_carry_display_names_newest_last() {
        let prompt = spontaneous_prompt(&[message("Ana", "first"), message("Bo", "second")]);
        let ana = prompt.find("[Ana]: first").unwrap();
        let bo = prompt.find("[Bo]: second").unwrap();
        assert!(ana < bo);
    }

    #[test]
    fn empty_context_is_marked() {
        let prompt = spontaneous_prompt(&[]);
        assert!(prompt.contains("(No recent messages)"));
    }

    #[test]
    fn response_prompt_names_the_user_and_quotes_the_text() {
        let prompt = response_prompt(&[message("Ana", "hi")], "Bo", "what's up?");
        assert!(prompt.contains("response to Bo's message"));
        assert!(prompt.contains("\"what's up?\""));
    }
}
