// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The event stream produced by one [`crate::agent::AgentEngine`] run.

use mcgw_model::{Message, Usage};

/// One event in the lazy, finite, non-restartable sequence an [`AgentEngine`]
/// run produces.
///
/// `sequence` is strictly monotonic within a single run, starting at 0, and
/// matches emission order (§ ordering guarantees). The terminal event of a
/// successful run is always a [`StreamEvent::Content`] with an empty `text`
/// and `metadata` set — see [`StreamEvent::is_complete`].
///
/// [`AgentEngine`]: crate::agent::AgentEngine
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A complete sentence (or the terminal flush) of assistant text.
    Content {
        sequence: u64,
        text: String,
        /// Present only on the terminal event of a run.
        metadata: Option<RunMetadata>,
    },
    /// A reasoning/thinking delta, shown to the player but never replayed
    /// back to the model on a later turn (see `strip_reasoning`).
    Reasoning { sequence: u64, text: String },
    /// The model requested a tool call.
    ToolCall {
        sequence: u64,
        tool_name: String,
        tool_call_id: String,
        args: serde_json::Value,
    },
    /// The paired result for an earlier `ToolCall` event.
    ToolResult {
        sequence: u64,
        tool_call_id: String,
        content: String,
    },
    /// The run failed; no completion event follows.
    Error { sequence: u64, message: String },
}

impl StreamEvent {
    pub fn sequence(&self) -> u64 {
        match self {
            StreamEvent::Content { sequence, .. }
            | StreamEvent::Reasoning { sequence, .. }
            | StreamEvent::ToolCall { sequence, .. }
            | StreamEvent::ToolResult { sequence, .. }
            | StreamEvent::Error { sequence, .. } => *sequence,
        }
    }

    /// The terminal event of a successful run: empty body, metadata attached.
    pub fn terminal(sequence: u64, metadata: RunMetadata) -> Self {
        StreamEvent::Content { sequence, text: String::new(), metadata: Some(metadata) }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, StreamEvent::Content { metadata: Some(_), .. })
    }
}

/// Carried by the terminal [`StreamEvent::Content`] of a run.
#[derive(Debug, Clone, Default)]
pub struct RunMetadata {
    pub usage: Usage,
    pub all_messages: Vec<Message>,
    pub tool_events: Vec<ToolEvent>,
}

/// One tool invocation observed during a run: the call, and its result once
/// it arrives (the LLM framework performs the invocation itself; the engine
/// only observes and reports the two paired events).
#[derive(Debug, Clone)]
pub struct ToolEvent {
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub result: Option<String>,
}

impl ToolEvent {
    pub fn new(tool_call_id: impl Into<String>, tool_name: impl Into<String>, args: serde_json::Value) -> Self {
        Self { tool_call_id: tool_call_id.into(), tool_name: tool_name.into(), args, result: None }
    }
}
