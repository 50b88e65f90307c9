// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! C3: drives one LLM completion run (including any tool-call rounds) to
//! completion, emitting a lazy, finite sequence of [`StreamEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use mcgw_model::{FunctionCall, Message, MessageContent, ModelProvider, ResponseEvent, Role, ToolSchema as ModelToolSchema, CompletionRequest, Usage};
use mcgw_tools::{ToolCall, ToolRegistry};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::events::{RunMetadata, StreamEvent, ToolEvent};

/// Sentences are flushed as soon as they are complete; in non-stream mode,
/// output is instead batched up to this many characters (§4.3).
const NON_STREAM_BATCH_CAP: usize = 150;
/// Delay between non-stream batches, to approximate a typed-out delivery.
const NON_STREAM_BATCH_DELAY: Duration = Duration::from_millis(100);
/// Safety bound on tool-call rounds within a single run.
const MAX_TOOL_ROUNDS: usize = 16;

fn sentence_boundary_regex() -> Regex {
    Regex::new(r"[。！？\n.!?]+").expect("static regex is valid")
}

/// C3: runs one conversation turn (including any tool rounds it triggers)
/// against a model, producing a [`StreamEvent`] sequence.
pub struct AgentEngine {
    model: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
}

impl AgentEngine {
    pub fn new(model: Arc<dyn ModelProvider>, tools: Arc<ToolRegistry>) -> Self {
        Self { model, tools }
    }

    fn tool_schemas(&self) -> Vec<ModelToolSchema> {
        self.tools
            .schemas()
            .into_iter()
            .map(|s| ModelToolSchema { name: s.name, description: s.description, parameters: s.parameters })
            .collect()
    }

    /// Run one turn in streaming mode: each completed sentence is emitted as
    /// its own [`StreamEvent::Content`] as soon as the sentence boundary is
    /// seen (§4.3 streaming mode).
    pub async fn run_streaming(&self, history: Vec<Message>, tx: mpsc::Sender<StreamEvent>) {
        self.run(history, tx, true).await;
    }

    /// Run one turn in non-stream mode: text is accumulated and flushed in
    /// ≤150-char batches with a small delay between batches, splitting
    /// over-long sentences at the char cap (§4.3 non-stream mode).
    pub async fn run_non_stream(&self, history: Vec<Message>, tx: mpsc::Sender<StreamEvent>) {
        self.run(history, tx, false).await;
    }

    async fn run(&self, history: Vec<Message>, tx: mpsc::Sender<StreamEvent>, stream_mode: bool) {
        let mut messages = history;
        let mut sequence: u64 = 0;
        let mut usage = Usage::default();
        let mut tool_events: Vec<ToolEvent> = Vec::new();
        let sentence_re = sentence_boundary_regex();

        for _round in 0..MAX_TOOL_ROUNDS {
            let req = CompletionRequest {
                messages: messages.clone(),
                tools: self.tool_schemas(),
                stream: stream_mode,
                system_dynamic_suffix: None,
            };

            let mut stream = match self.model.complete(req).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error { sequence, message: e.to_string() }).await;
                    return;
                }
            };

            let mut batcher = SentenceBatcher::new(sentence_re.clone());
            let mut full_text = String::new();
            let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
            let mut pending_order: Vec<u32> = Vec::new();
            let mut turn_failed = false;

            while let Some(event) = stream.next().await {
                let event = match event {
                    Ok(ev) => ev,
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Error { sequence, message: e.to_string() }).await;
                        turn_failed = true;
                        break;
                    }
                };

                match event {
                    ResponseEvent::TextDelta(delta) => {
                        full_text.push_str(&delta);
                        if stream_mode {
                            for sentence in batcher.push(&delta) {
                                sequence += 1;
                                if tx.send(StreamEvent::Content { sequence, text: sentence, metadata: None }).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    ResponseEvent::ThinkingDelta(delta) => {
                        sequence += 1;
                        if tx.send(StreamEvent::Reasoning { sequence, text: delta }).await.is_err() {
                            return;
                        }
                    }
                    ResponseEvent::ToolCall { index, id, name, arguments } => {
                        let entry = pending.entry(index).or_insert_with(|| {
                            pending_order.push(index);
                            PendingToolCall::default()
                        });
                        if !id.is_empty() {
                            entry.id = id;
                        }
                        if !name.is_empty() {
                            entry.name = name;
                        }
                        entry.args_buf.push_str(&arguments);
                    }
                    ResponseEvent::Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens } => {
                        usage.input_tokens += input_tokens;
                        usage.output_tokens += output_tokens;
                        usage.cache_read_tokens += cache_read_tokens;
                        usage.cache_write_tokens += cache_write_tokens;
                    }
                    ResponseEvent::Error(message) => {
                        sequence += 1;
                        let _ = tx.send(StreamEvent::Error { sequence, message }).await;
                        turn_failed = true;
                        break;
                    }
                    ResponseEvent::Done => {}
                }
            }

            if turn_failed {
                return;
            }

            // Flush whatever sentence fragment remains unterminated.
            if stream_mode {
                if let Some(tail) = batcher.flush() {
                    sequence += 1;
                    if tx.send(StreamEvent::Content { sequence, text: tail, metadata: None }).await.is_err() {
                        return;
                    }
                }
            }

            let tool_calls: Vec<ToolCall> = pending_order
                .into_iter()
                .enumerate()
                .filter_map(|(i, idx)| pending.remove(&idx).map(|p| p.finish(i)))
                .filter(|tc| !tc.name.is_empty())
                .collect();

            if tool_calls.is_empty() {
                if !stream_mode && !full_text.is_empty() {
                    for batch in batch_for_non_stream(&full_text, NON_STREAM_BATCH_CAP) {
                        sequence += 1;
                        if tx.send(StreamEvent::Content { sequence, text: batch, metadata: None }).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(NON_STREAM_BATCH_DELAY).await;
                    }
                }
                if !full_text.is_empty() {
                    messages.push(Message::assistant(full_text));
                }
                sequence += 1;
                let metadata = RunMetadata { usage, all_messages: messages, tool_events };
                let _ = tx.send(StreamEvent::terminal(sequence, metadata)).await;
                return;
            }

            // The model requested tools: push every assistant ToolCall message
            // first (providers that issue parallel calls expect them grouped),
            // then execute all of them, then push every result (§4.3).
            for call in &tool_calls {
                messages.push(Message {
                    role: Role::Assistant,
                    content: MessageContent::ToolCall {
                        tool_call_id: call.id.clone(),
                        function: FunctionCall { name: call.name.clone(), arguments: call.args.to_string() },
                    },
                });
                sequence += 1;
                if tx
                    .send(StreamEvent::ToolCall { sequence, tool_name: call.name.clone(), tool_call_id: call.id.clone(), args: call.args.clone() })
                    .await
                    .is_err()
                {
                    return;
                }
            }

            let outputs = futures::future::join_all(tool_calls.iter().map(|call| {
                let tools = Arc::clone(&self.tools);
                let call = call.clone();
                async move { tools.execute(&call).await }
            }))
            .await;

            for (call, output) in tool_calls.iter().zip(outputs.into_iter()) {
                messages.push(Message::tool_result(output.call_id.clone(), output.content.clone()));
                tool_events.push(ToolEvent {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    args: call.args.clone(),
                    result: Some(output.content.clone()),
                });
                sequence += 1;
                if tx
                    .send(StreamEvent::ToolResult { sequence, tool_call_id: output.call_id, content: output.content })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            // Loop back: feed tool results to the model for the next round.
        }

        sequence += 1;
        let _ = tx
            .send(StreamEvent::Error { sequence, message: format!("exceeded {MAX_TOOL_ROUNDS} tool-call rounds without a final answer") })
            .await;
    }
}

/// Accumulates streamed `ToolCall` argument deltas for one index until the
/// call is flushed at the end of a turn.
#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self, ordinal: usize) -> ToolCall {
        let args = if self.args_buf.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&self.args_buf).unwrap_or_else(|_| {
                warn!(tool = %self.name, "tool call arguments were not valid JSON, using empty object");
                serde_json::json!({})
            })
        };
        let id = if self.id.is_empty() { format!("tc_synthetic_{ordinal}") } else { self.id };
        ToolCall { id, name: self.name, args }
    }
}

/// Splits streamed text on sentence boundaries (`[。！？\n.!?]+`), returning
/// each completed sentence as soon as its boundary has been seen and holding
/// back the trailing fragment for the next push (or a final [`flush`]).
///
/// [`flush`]: SentenceBatcher::flush
struct SentenceBatcher {
    re: Regex,
    buf: String,
}

impl SentenceBatcher {
    fn new(re: Regex) -> Self {
        Self { re, buf: String::new() }
    }

    /// Feed a text delta, returning zero or more completed sentences.
    fn push(&mut self, delta: &str) -> Vec<String> {
        self.buf.push_str(delta);
        let mut out = Vec::new();
        loop {
            let Some(m) = self.re.find(&self.buf) else { break };
            let end = m.end();
            let sentence: String = self.buf[..end].to_string();
            if sentence.trim().is_empty() {
                // boundary at the very start (e.g. leading newline): drop it
                self.buf = self.buf[end..].to_string();
                continue;
            }
            out.push(sentence);
            self.buf = self.buf[end..].to_string();
        }
        out
    }

    /// Flush and return the remaining fragment, if non-empty.
    fn flush(&mut self) -> Option<String> {
        if self.buf.trim().is_empty() {
            self.buf.clear();
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// Split `sentences` of `text` (by the same boundary regex used in streaming
/// mode) into ≤`cap`-char batches, splitting any single sentence longer than
/// `cap` at fixed character boundaries (§4.3 non-stream mode).
fn batch_for_non_stream(text: &str, cap: usize) -> Vec<String> {
    let re = sentence_boundary_regex();
    let mut sentences: Vec<String> = Vec::new();
    let mut rest = text;
    loop {
        match re.find(rest) {
            Some(m) => {
                let end = m.end();
                sentences.push(rest[..end].to_string());
                rest = &rest[end..];
            }
            None => {
                if !rest.is_empty() {
                    sentences.push(rest.to_string());
                }
                break;
            }
        }
    }

    let mut batches = Vec::new();
    let mut current = String::new();
    for sentence in sentences {
        for chunk in chunk_by_chars(&sentence, cap) {
            if current.chars().count() + chunk.chars().count() > cap && !current.is_empty() {
                batches.push(std::mem::take(&mut current));
            }
            current.push_str(&chunk);
            if current.chars().count() >= cap {
                batches.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Split `text` into `cap`-char (not byte) chunks, never splitting a char.
fn chunk_by_chars(text: &str, cap: usize) -> Vec<String> {
    if text.chars().count() <= cap {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(cap).map(|c| c.iter().collect()).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mcgw_model::ScriptedMockProvider;
    use serde_json::{json, Value};

    struct EchoTool;

    #[async_trait]
    impl mcgw_tools::Tool for EchoTool {
        fn name(&self) -> &str {
            "run_minecraft_command"
        }
        fn description(&self) -> &str {
            "runs a command in-game"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall) -> mcgw_tools::ToolOutput {
            mcgw_tools::ToolOutput::ok(&call.id, format!("ran {}", call.args))
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        Arc::new(reg)
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn streaming_mode_splits_on_sentence_boundaries() {
        let model = Arc::new(ScriptedMockProvider::always_text("First sentence. Second sentence."));
        let engine = AgentEngine::new(model, registry());
        let (tx, rx) = mpsc::channel(32);
        engine.run_streaming(vec![Message::user("hi")], tx).await;
        let events = drain(rx).await;

        let texts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Content { text, .. } if !text.is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["First sentence.", " Second sentence."]);
        assert!(events.last().unwrap().is_complete());
    }

    #[tokio::test]
    async fn non_stream_mode_batches_by_char_cap() {
        let long_sentence = "x".repeat(400);
        let model = Arc::new(ScriptedMockProvider::always_text(long_sentence.clone()));
        let engine = AgentEngine::new(model, registry());
        let (tx, rx) = mpsc::channel(32);
        engine.run_non_stream(vec![Message::user("hi")], tx).await;
        let events = drain(rx).await;

        let batches: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Content { text, metadata: None, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(batches.iter().all(|b| b.chars().count() <= NON_STREAM_BATCH_CAP));
        assert_eq!(batches.concat(), long_sentence);
    }

    #[tokio::test]
    async fn terminal_event_has_strictly_monotonic_sequence() {
        let model = Arc::new(ScriptedMockProvider::always_text("hello there"));
        let engine = AgentEngine::new(model, registry());
        let (tx, rx) = mpsc::channel(32);
        engine.run_streaming(vec![Message::user("hi")], tx).await;
        let events = drain(rx).await;

        let mut last = None;
        for ev in &events {
            if let Some(prev) = last {
                assert!(ev.sequence() > prev);
            }
            last = Some(ev.sequence());
        }
    }

    #[tokio::test]
    async fn tool_call_round_trips_through_result_and_final_text() {
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "call-1",
            "run_minecraft_command",
            r#"{"command":"time set day"}"#,
            "Done!",
        ));
        let engine = AgentEngine::new(model, registry());
        let (tx, rx) = mpsc::channel(32);
        engine.run_streaming(vec![Message::user("make it day")], tx).await;
        let events = drain(rx).await;

        assert!(events.iter().any(|e| matches!(e, StreamEvent::ToolCall { tool_name, .. } if tool_name == "run_minecraft_command")));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::ToolResult { content, .. } if content.contains("ran"))));
        let terminal = events.last().unwrap();
        assert!(terminal.is_complete());
        match terminal {
            StreamEvent::Content { metadata: Some(meta), .. } => {
                assert_eq!(meta.tool_events.len(), 1);
                assert_eq!(meta.tool_events[0].tool_name, "run_minecraft_command");
            }
            _ => panic!("expected terminal content event"),
        }
    }

    #[tokio::test]
    async fn malformed_tool_arguments_fall_back_to_empty_object() {
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "call-1",
            "run_minecraft_command",
            "{not json",
            "ok",
        ));
        let engine = AgentEngine::new(model, registry());
        let (tx, rx) = mpsc::channel(32);
        engine.run_streaming(vec![Message::user("hi")], tx).await;
        let events = drain(rx).await;

        let args = events.iter().find_map(|e| match e {
            StreamEvent::ToolCall { args, .. } => Some(args.clone()),
            _ => None,
        });
        assert_eq!(args, Some(json!({})));
    }

    #[tokio::test]
    async fn error_event_terminates_without_completion_event() {
        let model = Arc::new(ScriptedMockProvider::new(vec![vec![ResponseEvent::Error("provider exploded".into())]]));
        let engine = AgentEngine::new(model, registry());
        let (tx, rx) = mpsc::channel(32);
        engine.run_streaming(vec![Message::user("hi")], tx).await;
        let events = drain(rx).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { message, .. } if message == "provider exploded"));
        assert!(!events[0].is_complete());
    }

    #[test]
    fn sentence_batcher_holds_back_incomplete_fragment() {
        let re = sentence_boundary_regex();
        let mut batcher = SentenceBatcher::new(re);
        let out = batcher.push("Hello wor");
        assert!(out.is_empty());
        let out2 = batcher.push("ld. More");
        assert_eq!(out2, vec!["Hello world."]);
        let tail = batcher.flush();
        assert_eq!(tail, Some(" More".to_string()));
    }

    #[test]
    fn chunk_by_chars_never_splits_below_cap() {
        let chunks = chunk_by_chars("hello", 3);
        assert_eq!(chunks, vec!["hel", "lo"]);
    }
}
