//! Context window policy: which part of the active path is sent to the model.
use crate::models::message::Message;
use crate::models::role::Role;

/// Rough token estimate, four characters per token
pub fn estimate_tokens(chars: usize) -> usize {
    chars.div_ceil(4)
}

pub fn message_tokens(message: &Message) -> usize {
    estimate_tokens(message.char_len())
}

/// Drop the oldest messages until the estimate fits in `max_tokens`.
///
/// Everything from the newest user message onwards is always kept, and the
/// window never opens on a tool result whose request was cut away.
/// A `max_tokens` of zero disables trimming.
pub fn fit_to_window(messages: &[Message], system: &str, max_tokens: usize) -> Vec<Message> {
    if max_tokens == 0 || messages.is_empty() {
        return messages.to_vec();
    }

    let budget = max_tokens.saturating_sub(estimate_tokens(system.chars().count()));
    let newest_user = messages
        .iter()
        .rposition(|message| message.role == Role::User)
        .unwrap_or(messages.len() - 1);

    let mut start = messages.len();
    let mut total = 0;
    for (index, message) in messages.iter().enumerate().rev() {
        let cost = message_tokens(message);
        if index < newest_user && total + cost > budget {
            break;
        }
        total += cost;
        start = index;
    }

    while start < newest_user && messages[start].role == Role::Tool {
        start += 1;
    }

    if start > 0 {
        tracing::debug!(
            dropped = start,
            kept = messages.len() - start,
            estimated_tokens = total,
            "trimmed conversation to fit context window"
        );
    }
    messages[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::content::Content;
    use crate::models::tool::ToolCall;
    use serde_json::json;

    fn sized(message: Message, chars: usize) -> Message {
        message.with_text("x".repeat(chars))
    }

    #[test]
    fn test_everything_fits() {
        let messages = vec![
            sized(Message::user(), 40),
            sized(Message::assistant(), 40),
            sized(Message::user(), 40),
        ];
        assert_eq!(fit_to_window(&messages, "", 100).len(), 3);
        assert_eq!(fit_to_window(&messages, "", 0).len(), 3);
    }

    #[test]
    fn test_oldest_messages_are_dropped() {
        let messages = vec![
            sized(Message::user(), 400),
            sized(Message::assistant(), 400),
            sized(Message::user(), 40),
        ];
        let window = fit_to_window(&messages, "", 150);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].id, messages[1].id);
    }

    #[test]
    fn test_newest_user_message_is_always_kept() {
        let messages = vec![sized(Message::assistant(), 40), sized(Message::user(), 4000)];
        let window = fit_to_window(&messages, "system prompt", 10);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].role, Role::User);
    }

    #[test]
    fn test_window_never_opens_on_orphaned_tool_result() {
        let messages = vec![
            Message::user().with_text("x".repeat(400)),
            Message::assistant()
                .with_text("x".repeat(400))
                .with_tool_request("1", "calculator", Ok(ToolCall::new("calculator", json!({})))),
            Message::tool().with_tool_response("1", "calculator", Ok(vec![Content::text("4")])),
            Message::user().with_text("and now?"),
        ];
        let window = fit_to_window(&messages, "", 20);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].text(), "and now?");
    }
}
