//! Conversation history shaping for provider requests

use crate::provider::{ChatMessage, ChatRole};
use crate::session::{Role, Turn};

/// Messages kept no matter the budget
const MIN_KEPT: usize = 3;

/// Rough token count: four chars per token
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Tool results go back to the model as user messages
pub fn to_chat(turn: &Turn) -> ChatMessage {
    let role = match turn.role {
        Role::User | Role::Tool => ChatRole::User,
        Role::Assistant => ChatRole::Assistant,
    };
    ChatMessage::new(role, turn.content.clone())
}

/// Keep the first message plus the newest ones that fit `budget`
pub fn truncate(messages: &[ChatMessage], budget: usize) -> Vec<ChatMessage> {
    if messages.len() <= MIN_KEPT {
        return messages.to_vec();
    }

    let mut used = estimate_tokens(&messages[0].content);
    let mut start = messages.len();
    while start > 1 {
        let cost = estimate_tokens(&messages[start - 1].content);
        let kept = 1 + messages.len() - start;
        if kept >= MIN_KEPT && used + cost > budget {
            break;
        }
        used += cost;
        start -= 1;
    }

    if start > 1 {
        tracing::debug!(
            dropped = start - 1,
            kept = 1 + messages.len() - start,
            "Truncated history to fit token budget"
        );
    }

    let mut kept = Vec::with_capacity(1 + messages.len() - start);
    kept.push(messages[0].clone());
    kept.extend_from_slice(&messages[start..]);
    kept
}

/// Append the environment block to the newest user message
pub fn with_environment(mut messages: Vec<ChatMessage>, environment: &str) -> Vec<ChatMessage> {
    if environment.is_empty() {
        return messages;
    }
    match messages.iter_mut().rev().find(|m| m.role == ChatRole::User) {
        Some(last) => {
            last.content.push_str("\n\n");
            last.content.push_str(environment);
        }
        None => messages.push(ChatMessage::new(ChatRole::User, environment)),
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(sizes: &[usize]) -> Vec<ChatMessage> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let role = if i % 2 == 0 { ChatRole::User } else { ChatRole::Assistant };
                ChatMessage::new(role, format!("{}{}", i, "x".repeat(n.saturating_sub(1))))
            })
            .collect()
    }

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("éééé"), 1);
    }

    #[test]
    fn test_everything_fits() {
        let messages = msgs(&[40, 40, 40, 40, 40]);
        assert_eq!(truncate(&messages, 1000), messages);
    }

    #[test]
    fn test_keeps_first_and_newest() {
        // 10 tokens each
        let messages = msgs(&[40, 40, 40, 40, 40, 40]);
        let kept = truncate(&messages, 35);
        let firsts: Vec<char> = kept.iter().map(|m| m.content.chars().next().unwrap()).collect();
        assert_eq!(firsts, vec!['0', '4', '5']);
    }

    #[test]
    fn test_minimum_kept_even_over_budget() {
        let messages = msgs(&[400, 400, 400, 400]);
        let kept = truncate(&messages, 10);
        assert_eq!(kept.len(), 3);
        assert!(kept[0].content.starts_with('0'));
        assert!(kept[2].content.starts_with('3'));
    }

    #[test]
    fn test_environment_goes_on_last_user_message() {
        let messages = vec![
            ChatMessage::new(ChatRole::User, "task"),
            ChatMessage::new(ChatRole::Assistant, "ok"),
            ChatMessage::new(ChatRole::User, "result"),
            ChatMessage::new(ChatRole::Assistant, "thinking"),
        ];
        let out = with_environment(messages, "<environment_details>x</environment_details>");
        assert_eq!(out[2].content, "result\n\n<environment_details>x</environment_details>");
        assert_eq!(out[0].content, "task");
    }

    #[test]
    fn test_tool_turns_are_user_messages() {
        let turn = Turn::new(Role::Tool, "[read_file] Result:\nx");
        assert_eq!(to_chat(&turn).role, ChatRole::User);
    }
}
