//! Prompt-cache breakpoints over the message history.

use crate::llm::{CacheControl, ContentBlock, Message, Role};

/// Re-mark the history so that only the most recent user text block and the
/// most recent tool-result block carry a cache hint.
pub fn refresh_cache_breakpoints(messages: &mut [Message]) {
    for message in messages.iter_mut().filter(|m| m.role == Role::User) {
        for block in &mut message.content {
            block.set_cache_control(None);
        }
    }

    mark_last(messages, |b| matches!(b, ContentBlock::Text { .. }));
    mark_last(messages, |b| matches!(b, ContentBlock::ToolResult { .. }));
}

/// Flag the last matching block of the most recent user message that has one.
fn mark_last(messages: &mut [Message], is_kind: impl Fn(&ContentBlock) -> bool) {
    let target = messages
        .iter_mut()
        .rev()
        .filter(|m| m.role == Role::User)
        .find_map(|m| m.content.iter_mut().rev().find(|b| is_kind(b)));
    if let Some(block) = target {
        block.set_cache_control(Some(CacheControl::Ephemeral));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flagged(messages: &[Message]) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (i, m) in messages.iter().enumerate() {
            for (j, b) in m.content.iter().enumerate() {
                if b.cache_control().is_some() {
                    out.push((i, j));
                }
            }
        }
        out
    }

    #[test]
    fn test_flags_latest_text_and_latest_tool_result() {
        let mut messages = vec![
            Message::user(vec![ContentBlock::text("reminder"), ContentBlock::text("hi")]),
            Message::assistant(vec![ContentBlock::text("checking")]),
            Message::user(vec![
                ContentBlock::tool_result("t1", "a"),
                ContentBlock::tool_result("t2", "b"),
            ]),
            Message::assistant(vec![ContentBlock::text("done")]),
        ];
        refresh_cache_breakpoints(&mut messages);
        assert_eq!(flagged(&messages), vec![(0, 1), (2, 1)]);
    }

    #[test]
    fn test_stale_flags_are_cleared() {
        let mut messages = vec![
            Message::user(vec![ContentBlock::text("first")]),
            Message::user(vec![ContentBlock::tool_result("t1", "a")]),
        ];
        refresh_cache_breakpoints(&mut messages);
        messages.push(Message::user(vec![
            ContentBlock::text("reminder"),
            ContentBlock::text("second"),
        ]));
        messages.push(Message::user(vec![ContentBlock::tool_result("t2", "b")]));
        refresh_cache_breakpoints(&mut messages);

        assert_eq!(flagged(&messages), vec![(2, 1), (3, 0)]);
    }

    #[test]
    fn test_assistant_text_is_never_flagged() {
        let mut messages = vec![Message::assistant(vec![ContentBlock::text("hello")])];
        refresh_cache_breakpoints(&mut messages);
        assert!(flagged(&messages).is_empty());
    }
}
