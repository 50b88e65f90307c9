// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation trimming, compression and reasoning redaction (§4.4).

use mcgw_model::{Message, MessageContent, Role};

const HISTORY_SUMMARY_PREFIX: &str = "[历史摘要] ";
const USER_PREVIEW_CHARS: usize = 50;
const ASSISTANT_PREVIEW_CHARS: usize = 100;
const MAX_SUMMARY_ENTRIES: usize = 10;

/// floor(0.8 × max_turns), computed without floating point.
pub fn compress_trigger_threshold(max_turns: usize) -> usize {
    (4 * max_turns) / 5
}

/// Number of `user-prompt` parts in `messages`.
pub fn count_turns(messages: &[Message]) -> usize {
    messages.iter().filter(|m| m.role == Role::User).count()
}

/// Keep the suffix starting at the Nth-most-recent user turn, extended
/// backward so no `tool-call`/`tool-return` pair is split and so an
/// immediately preceding system-prompt request is retained.
///
/// `count_turns(trim(h, n)) == min(count_turns(h), n)` always holds.
pub fn trim(messages: &[Message], max_turns: usize) -> Vec<Message> {
    let user_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::User)
        .map(|(i, _)| i)
        .collect();

    if user_indices.len() <= max_turns {
        return messages.to_vec();
    }
    if max_turns == 0 {
        return Vec::new();
    }

    let mut cut = user_indices[user_indices.len() - max_turns];

    // (a) Extend backward over any assistant tool-call whose matching
    // tool-return would otherwise be split off from its call.
    while cut > 0 {
        let prev = &messages[cut - 1];
        let unmatched_call_id = match &prev.content {
            MessageContent::ToolCall { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        };
        match unmatched_call_id {
            Some(id) => {
                let return_kept = messages[cut..].iter().any(|m| {
                    matches!(&m.content, MessageContent::ToolResult { tool_call_id, .. } if tool_call_id == id)
                });
                if return_kept {
                    cut -= 1;
                } else {
                    break;
                }
            }
            None => break,
        }
    }

    // (b) Pull in an immediately preceding system-prompt request.
    if cut > 0 && messages[cut - 1].role == Role::System {
        cut -= 1;
    }

    messages[cut..].to_vec()
}

/// Runs [`trim`] to `max_turns` verbatim turns if the turn count has
/// reached `compress_trigger_threshold(max_turns)`, or unconditionally
/// when `force` is set. Returns whether compression ran.
pub fn check_and_compress(messages: &mut Vec<Message>, max_turns: usize, force: bool) -> bool {
    if !force && count_turns(messages) < compress_trigger_threshold(max_turns) {
        return false;
    }
    compress(messages, max_turns);
    true
}

/// Keep the most recent `keep_turns` turns verbatim; fold everything
/// older into one synthetic `"[历史摘要] ..."` user-prompt message
/// prepended to the kept tail.
pub fn compress(messages: &mut Vec<Message>, keep_turns: usize) {
    let user_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::User)
        .map(|(i, _)| i)
        .collect();

    if user_indices.len() <= keep_turns {
        return;
    }

    let split_idx = user_indices[user_indices.len() - keep_turns];
    let older = &messages[..split_idx];
    let summary = build_summary(older);
    let synthetic = Message::user(format!("{HISTORY_SUMMARY_PREFIX}{summary}"));

    let tail = messages.split_off(split_idx);
    messages.clear();
    messages.push(synthetic);
    messages.extend(tail);
}

fn build_summary(older: &[Message]) -> String {
    let mut entries: Vec<String> = Vec::new();
    for m in older {
        match (&m.role, &m.content) {
            (Role::User, _) => {
                if let Some(text) = m.as_text() {
                    entries.push(truncate_ellipsis(text, USER_PREVIEW_CHARS));
                }
            }
            (Role::Assistant, MessageContent::Text(t)) => {
                let normalized = normalize_whitespace(t);
                entries.push(truncate_plain(&normalized, ASSISTANT_PREVIEW_CHARS));
            }
            _ => {}
        }
    }
    // Keep the entries closest to the compression boundary — they carry
    // the most relevant recent context from the folded prefix.
    if entries.len() > MAX_SUMMARY_ENTRIES {
        let drop = entries.len() - MAX_SUMMARY_ENTRIES;
        entries.drain(..drop);
    }
    entries.join(" | ")
}

fn truncate_ellipsis(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

fn truncate_plain(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Clear every `thinking` part's content in place. Non-thinking messages
/// are left untouched — no clone occurs for the common case of a
/// standard text/tool-call/tool-return message.
pub fn strip_reasoning(messages: &mut [Message]) {
    for m in messages.iter_mut() {
        if let MessageContent::Thinking { thinking } = &mut m.content {
            thinking.clear();
        }
    }
}

/// Owned-copy variant of [`strip_reasoning`] for callers holding a
/// borrowed history (e.g. a broker snapshot) that must not be mutated
/// in place.
pub fn strip_reasoning_cloned(messages: &[Message]) -> Vec<Message> {
    let mut copy = messages.to_vec();
    strip_reasoning(&mut copy);
    copy
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mcgw_model::{FunctionCall, Message, MessageContent, Role};

    fn history_with_turns(n: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("you are a helper")];
        for i in 0..n {
            messages.push(Message::user(format!("question {i}")));
            messages.push(Message::assistant(format!("answer {i}")));
        }
        messages
    }

    // ── count_turns / trim ────────────────────────────────────────────────────

    #[test]
    fn count_turns_counts_only_user_messages() {
        let h = history_with_turns(3);
        assert_eq!(count_turns(&h), 3);
    }

    #[test]
    fn trim_keeps_min_of_total_and_n() {
        let h = history_with_turns(10);
        let trimmed = trim(&h, 5);
        assert_eq!(count_turns(&trimmed), 5);
    }

    #[test]
    fn trim_is_noop_when_under_limit() {
        let h = history_with_turns(3);
        let trimmed = trim(&h, 5);
        assert_eq!(trimmed.len(), h.len());
    }

    #[test]
    fn trim_pulls_in_preceding_system_prompt() {
        let messages = vec![
            Message::system("initial prompt"),
            Message::user("turn 0"),
            Message::assistant("reply 0"),
            Message::system("mid-conversation system prompt"),
            Message::user("turn 1"),
            Message::assistant("reply 1"),
            Message::user("turn 2"),
            Message::assistant("reply 2"),
        ];
        let trimmed = trim(&messages, 2);
        assert_eq!(count_turns(&trimmed), 2);
        assert_eq!(trimmed[0].role, Role::System);
        assert_eq!(trimmed[0].as_text(), Some("mid-conversation system prompt"));
    }

    #[test]
    fn trim_never_splits_tool_call_pair() {
        let messages = vec![
            Message::user("turn 1"),
            Message::assistant("turn 1 reply"),
            Message::user("run something"),
            Message {
                role: Role::Assistant,
                content: MessageContent::ToolCall {
                    tool_call_id: "call-1".into(),
                    function: FunctionCall { name: "shell".into(), arguments: "{}".into() },
                },
            },
            Message::tool_result("call-1", "done"),
            Message::user("turn 3"),
        ];
        // The Nth-most-recent-turn cut (N=1) would normally land right at
        // "turn 3", which is fine: the tool pair above is already outside
        // the kept window and not split. Use N=2 to force the cut to land
        // between the tool-call and its result.
        let trimmed = trim(&messages, 2);
        let has_call = trimmed.iter().any(|m| matches!(&m.content, MessageContent::ToolCall { .. }));
        let has_result = trimmed.iter().any(|m| matches!(&m.content, MessageContent::ToolResult { .. }));
        assert_eq!(has_call, has_result, "tool-call and tool-return must stay paired");
    }

    #[test]
    fn trim_empty_history_returns_empty() {
        let trimmed = trim(&[], 5);
        assert!(trimmed.is_empty());
    }

    // ── compress_trigger_threshold ────────────────────────────────────────────

    #[test]
    fn compress_trigger_threshold_is_floor_0_8n() {
        assert_eq!(compress_trigger_threshold(5), 4);
        assert_eq!(compress_trigger_threshold(10), 8);
        assert_eq!(compress_trigger_threshold(3), 2);
    }

    // ── check_and_compress / compress ─────────────────────────────────────────

    #[test]
    fn check_and_compress_fires_after_ten_turns_with_max_five() {
        let mut h = history_with_turns(10);
        let fired = check_and_compress(&mut h, 5, false);
        assert!(fired);
        assert_eq!(count_turns(&h), 6, "synthetic summary turn + 5 verbatim turns");
    }

    #[test]
    fn check_and_compress_does_not_fire_below_threshold() {
        let mut h = history_with_turns(3);
        let fired = check_and_compress(&mut h, 5, false);
        assert!(!fired);
        assert_eq!(count_turns(&h), 3);
    }

    #[test]
    fn check_and_compress_force_always_fires() {
        let mut h = history_with_turns(2);
        let fired = check_and_compress(&mut h, 5, true);
        assert!(fired);
    }

    #[test]
    fn compressed_history_begins_with_summary_message() {
        let mut h = history_with_turns(10);
        compress(&mut h, 5);
        assert_eq!(h[0].role, Role::User);
        assert!(h[0].as_text().unwrap().starts_with("[历史摘要] "));
    }

    #[test]
    fn compress_noop_when_turns_fit_already() {
        let mut h = history_with_turns(3);
        let before_len = h.len();
        compress(&mut h, 5);
        assert_eq!(h.len(), before_len);
    }

    #[test]
    fn summary_truncates_user_preview_to_fifty_chars_with_ellipsis() {
        let mut h = vec![Message::user("x".repeat(80)), Message::assistant("ok")];
        h.extend(history_with_turns(5)[1..].to_vec());
        compress(&mut h, 5);
        let summary = h[0].as_text().unwrap();
        assert!(summary.contains(&format!("{}…", "x".repeat(50))));
    }

    // ── strip_reasoning ───────────────────────────────────────────────────────

    #[test]
    fn strip_reasoning_clears_thinking_content() {
        let mut h = vec![Message::thinking("deep thoughts"), Message::assistant("answer")];
        strip_reasoning(&mut h);
        match &h[0].content {
            MessageContent::Thinking { thinking } => assert!(thinking.is_empty()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn strip_reasoning_leaves_other_messages_untouched() {
        let mut h = vec![Message::user("hi"), Message::assistant("hello")];
        strip_reasoning(&mut h);
        assert_eq!(h[0].as_text(), Some("hi"));
        assert_eq!(h[1].as_text(), Some("hello"));
    }

    #[test]
    fn strip_reasoning_is_idempotent() {
        let mut h = vec![Message::thinking("x")];
        strip_reasoning(&mut h);
        let once = h.clone();
        strip_reasoning(&mut h);
        assert_eq!(
            match (&h[0].content, &once[0].content) {
                (MessageContent::Thinking { thinking: a }, MessageContent::Thinking { thinking: b }) => a == b,
                _ => false,
            },
            true
        );
    }

    #[test]
    fn strip_reasoning_cloned_does_not_mutate_original() {
        let original = vec![Message::thinking("keep me")];
        let stripped = strip_reasoning_cloned(&original);
        match (&original[0].content, &stripped[0].content) {
            (MessageContent::Thinking { thinking: a }, MessageContent::Thinking { thinking: b }) => {
                assert_eq!(a, "keep me");
                assert!(b.is_empty());
            }
            _ => panic!("wrong variant"),
        }
    }
}
