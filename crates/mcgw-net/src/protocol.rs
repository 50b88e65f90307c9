// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! MCBE WebSocket wire protocol (§6, §4.7): inbound frame parsing, outbound
//! command framing, and the `ChatRequest` payload carried by the broker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCBE command-frame protocol version (fixed; matches the reference client).
pub const COMMAND_VERSION: u64 = 17039360;

/// How an outbound assistant message is rendered in-game (§3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Tellraw,
    Scriptevent,
}

/// One chat turn submitted to the broker (§3 Request envelope).
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub connection_id: String,
    pub content: String,
    pub player_name: Option<String>,
    pub use_context: bool,
    pub provider: Option<String>,
    pub delivery: Delivery,
}

// ─── Inbound frames ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct InboundHeader {
    #[serde(default, rename = "requestId")]
    pub request_id: Option<String>,
    #[serde(default, rename = "messagePurpose")]
    pub message_purpose: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default, rename = "eventName")]
    pub event_name: Option<String>,
    #[serde(default, rename = "EventName")]
    pub event_name_alt: Option<String>,
}

impl InboundHeader {
    pub fn event_name(&self) -> Option<&str> {
        self.event_name.as_deref().or(self.event_name_alt.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub header: InboundHeader,
    #[serde(default)]
    pub body: Value,
}

/// Parsed `PlayerMessage` event body.
#[derive(Debug, Clone)]
pub struct PlayerMessage {
    pub sender: String,
    pub message: String,
}

impl InboundFrame {
    pub fn is_command_response(&self) -> bool {
        self.header.message_purpose.as_deref() == Some("commandResponse")
    }

    /// `statusCode`/`statusMessage` from a `commandResponse` body.
    pub fn status(&self) -> Option<(i64, Option<String>)> {
        let code = self.body.get("statusCode")?.as_i64()?;
        let message = self.body.get("statusMessage").and_then(Value::as_str).map(str::to_string);
        Some((code, message))
    }

    /// Extract a `PlayerMessage` event's sender + text, if this frame carries one.
    pub fn player_message(&self) -> Option<PlayerMessage> {
        if self.header.event_name() != Some("PlayerMessage") {
            return None;
        }
        let sender = self.body.get("sender").and_then(Value::as_str)?.to_string();
        let message = self.body.get("message").and_then(Value::as_str)?.to_string();
        Some(PlayerMessage { sender, message })
    }
}

/// §4.7 step 1: drop external-origin duplicates when dedup is enabled.
pub fn is_external_duplicate(msg: &PlayerMessage) -> bool {
    msg.sender == "外部"
}

// ─── Outbound command frames ──────────────────────────────────────────────────

/// Resolution string for a completed `commandResponse` (§4.6).
pub fn resolve_command_response(status_code: i64, status_message: Option<&str>) -> String {
    if status_code == 0 {
        status_message.filter(|s| !s.is_empty()).unwrap_or("命令执行成功").to_string()
    } else {
        format!(
            "命令执行失败(statusCode={status_code}): {}",
            status_message.unwrap_or_default()
        )
    }
}

/// Escape a raw-text fragment for embedding inside a `tellraw` JSON command
/// (§6: `"` → `\"`, `:` → `：`, `%` → `\%`).
pub fn escape_tellraw_text(text: &str) -> String {
    text.replace('"', "\\\"").replace(':', "：").replace('%', "\\%")
}

/// Build the `commandLine` for a `tellraw` delivery.
pub fn tellraw_command_line(color: &str, text: &str) -> String {
    let escaped = escape_tellraw_text(&format!("{color}{text}"));
    format!(r#"tellraw @a {{"rawtext":[{{"text":"{escaped}"}}]}}"#)
}

/// Build the `commandLine` for a `scriptevent` delivery.
pub fn scriptevent_command_line(event_id: &str, body: &str) -> String {
    format!("scriptevent {event_id} {body}")
}

/// Build the outbound `commandRequest` JSON frame for `command_line` (§6).
pub fn build_command_request(request_id: &str, command_line: &str, origin: &str) -> Value {
    serde_json::json!({
        "header": {
            "requestId": request_id,
            "messagePurpose": "commandRequest",
            "version": 1,
        },
        "body": {
            "origin": { "type": origin },
            "commandLine": command_line,
            "version": COMMAND_VERSION,
        }
    })
}

/// The subscribe frame sent right after accept, for the `PlayerMessage` event.
pub fn subscribe_frame(event_name: &str) -> Value {
    serde_json::json!({
        "header": {
            "requestId": uuid::Uuid::new_v4().to_string(),
            "messagePurpose": "subscribe",
            "version": 1,
        },
        "body": { "eventName": event_name }
    })
}

/// Accept acknowledgement: `{"Result":"true"}`.
pub fn accept_frame() -> Value {
    serde_json::json!({ "Result": "true" })
}

/// 2.2.0 welcome message, sent once immediately after subscribe (§9 open
/// question 1: the highest-version welcome template is canonical).
pub fn welcome_frame() -> Value {
    let text = "§aMCGW 网关已连接 (v2.2.0)。发送 #登录 <密码> 进行验证，然后用 AGENT 聊天 <内容> 开始对话。";
    serde_json::json!({
        "header": {
            "requestId": uuid::Uuid::new_v4().to_string(),
            "messagePurpose": "commandRequest",
            "version": 1,
        },
        "body": {
            "origin": { "type": "player" },
            "commandLine": tellraw_command_line("", text),
            "version": COMMAND_VERSION,
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
