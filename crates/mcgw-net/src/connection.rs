// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C6 ConnectionManager: per-connection state, the response-sender task,
//! rendering rules, and `run_command` RPC correlation (§4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::broker::{MessageBroker, ResponseItem};
use crate::protocol::{build_command_request, scriptevent_command_line, tellraw_command_line, Delivery};

/// A resolved connection is closed with this string, matching the literal
/// testable invariant in §8 ("every future ... is completed with a
/// `连接已关闭` string").
pub const CONNECTION_CLOSED: &str = "连接已关闭";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Content,
    Reasoning,
    ToolCall,
    ToolResult,
    Error,
    ThinkingStart,
    ThinkingEnd,
}

/// Outbound, fully-rendered chunk produced by C5 and consumed only by C6 (§3).
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub connection_id: String,
    pub sequence: u64,
    pub chunk_type: ChunkType,
    pub content: String,
    pub delivery: Delivery,
    pub tool_name: Option<String>,
    pub tool_args: Option<Value>,
    pub tool_result_preview: Option<String>,
}

/// Per-connection state (§3 Data Model: Connection).
pub struct Connection {
    pub connection_id: String,
    pub authenticated: AtomicBool,
    pub player_name: Mutex<Option<String>>,
    pub context_enabled: AtomicBool,
    pub current_provider: Mutex<String>,
    pub current_template: Mutex<String>,
    pub custom_variables: Mutex<HashMap<String, String>>,
    /// Outstanding `run_command` futures keyed by outbound `requestId`.
    pending_commands: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl Connection {
    fn new(connection_id: String, default_provider: String, default_template: String) -> Self {
        Self {
            connection_id,
            authenticated: AtomicBool::new(false),
            player_name: Mutex::new(None),
            context_enabled: AtomicBool::new(true),
            current_provider: Mutex::new(default_provider),
            current_template: Mutex::new(default_template),
            custom_variables: Mutex::new(HashMap::new()),
            pending_commands: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::SeqCst);
    }

    pub fn context_enabled(&self) -> bool {
        self.context_enabled.load(Ordering::SeqCst)
    }

    pub fn set_context_enabled(&self, value: bool) {
        self.context_enabled.store(value, Ordering::SeqCst);
    }
}

/// A sink abstraction over the underlying WebSocket write half, so the
/// sender loop doesn't depend on axum's concrete types.
#[async_trait::async_trait]
pub trait OutboundSink: Send {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;
}

/// C6: registers connections, runs the per-connection sender task, and
/// resolves `run_command` futures against inbound `commandResponse` frames.
pub struct ConnectionManager {
    broker: MessageBroker,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new(broker: MessageBroker) -> Self {
        Self { broker, connections: Mutex::new(HashMap::new()) }
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    /// Registers `conn_id` with both the broker and the connection map.
    /// Returns `None` if the broker considers this a duplicate registration.
    pub async fn register(
        &self,
        conn_id: &str,
        default_provider: &str,
        default_template: &str,
    ) -> Option<tokio::sync::mpsc::UnboundedReceiver<ResponseItem>> {
        let rx = self.broker.register_connection(conn_id)?;
        let conn = Arc::new(Connection::new(conn_id.to_string(), default_provider.to_string(), default_template.to_string()));
        self.connections.lock().await.insert(conn_id.to_string(), conn);
        Some(rx)
    }

    pub async fn get(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.connections.lock().await.get(conn_id).cloned()
    }

    pub fn is_registered(&self, conn_id: &str) -> bool {
        self.broker.is_registered(conn_id)
    }

    /// Resolves every outstanding `run_command` future for `conn_id` with
    /// [`CONNECTION_CLOSED`], then drops connection + broker state (§4.6
    /// shutdown ordering, §8 invariant).
    pub async fn unregister(&self, conn_id: &str) {
        if let Some(conn) = self.connections.lock().await.remove(conn_id) {
            let mut pending = conn.pending_commands.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(CONNECTION_CLOSED.to_string());
            }
        }
        self.broker.unregister_connection(conn_id);
    }

    /// Resolves a pending `run_command` future keyed by `request_id` against
    /// an inbound `commandResponse` frame. Returns `true` on a hit.
    pub async fn resolve_command_response(&self, conn_id: &str, request_id: &str, status_code: i64, status_message: Option<&str>) -> bool {
        let Some(conn) = self.get(conn_id).await else { return false };
        let mut pending = conn.pending_commands.lock().await;
        match pending.remove(request_id) {
            Some(tx) => {
                let _ = tx.send(crate::protocol::resolve_command_response(status_code, status_message));
                true
            }
            None => false,
        }
    }

    /// Runs the sender loop for `conn_id` until the broker drops its
    /// response channel (on unregister) or the socket write fails.
    pub async fn run_sender_loop(self: Arc<Self>, conn_id: String, mut rx: tokio::sync::mpsc::UnboundedReceiver<ResponseItem>, mut sink: impl OutboundSink) {
        loop {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(item)) => {
                    if let Err(err) = self.dispatch_item(&conn_id, item, &mut sink).await {
                        warn!(conn_id = %conn_id, error = %err, "failed to dispatch response item");
                    }
                }
                Ok(None) => break,
                Err(_elapsed) => {
                    if !self.is_registered(&conn_id) {
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch_item(&self, conn_id: &str, item: ResponseItem, sink: &mut impl OutboundSink) -> anyhow::Result<()> {
        match item {
            ResponseItem::GameMessage(chunk) => {
                if let Some(text) = render_chunk(&chunk) {
                    let command_line = match chunk.delivery {
                        Delivery::Tellraw => tellraw_command_line("", &text),
                        Delivery::Scriptevent => scriptevent_command_line("mcgw:chat", &text),
                    };
                    let frame = build_command_request(&Uuid::new_v4().to_string(), &command_line, "player");
                    sink.send_text(frame.to_string()).await?;
                }
                Ok(())
            }
            ResponseItem::RunCommand { command, origin, result_tx } => {
                let request_id = Uuid::new_v4().to_string();
                if let Some(tx) = result_tx {
                    match self.get(conn_id).await {
                        Some(conn) if self.is_registered(conn_id) => {
                            conn.pending_commands.lock().await.insert(request_id.clone(), tx);
                        }
                        _ => {
                            let _ = tx.send(CONNECTION_CLOSED.to_string());
                            return Ok(());
                        }
                    }
                }
                let frame = build_command_request(&request_id, &command, origin);
                sink.send_text(frame.to_string()).await?;
                Ok(())
            }
        }
    }
}

/// Renders one chunk to in-game text per the §4.6 rendering table. Returns
/// `None` for `thinking_end`, which is suppressed.
pub fn render_chunk(chunk: &StreamChunk) -> Option<String> {
    match chunk.chunk_type {
        ChunkType::Content => Some(format!("§a{}", chunk.content)),
        ChunkType::Reasoning => Some(format!("§7✻ {}", chunk.content)),
        ChunkType::ToolCall => Some(format!("§e{}", chunk.content)),
        ChunkType::ToolResult => Some(format!("§e{}", chunk.content)),
        ChunkType::Error => Some(format!("§c✖ {}", chunk.content)),
        ChunkType::ThinkingStart => Some("§7✻ 思考中...".to_string()),
        ChunkType::ThinkingEnd => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(chunk_type: ChunkType, content: &str) -> StreamChunk {
        StreamChunk {
            connection_id: "c1".into(),
            sequence: 0,
            chunk_type,
            content: content.into(),
            delivery: Delivery::Tellraw,
            tool_name: None,
            tool_args: None,
            tool_result_preview: None,
        }
    }

    #[test]
    fn content_is_rendered_green() {
        assert_eq!(render_chunk(&chunk(ChunkType::Content, "hi")).unwrap(), "§ahi");
    }

    #[test]
    fn reasoning_is_rendered_gray_with_prefix() {
        assert_eq!(render_chunk(&chunk(ChunkType::Reasoning, "thinking")).unwrap(), "§7✻ thinking");
    }

    #[test]
    fn error_is_rendered_red_with_prefix() {
        assert_eq!(render_chunk(&chunk(ChunkType::Error, "boom")).unwrap(), "§c✖ boom");
    }

    #[test]
    fn thinking_end_is_suppressed() {
        assert!(render_chunk(&chunk(ChunkType::ThinkingEnd, "")).is_none());
    }

    #[tokio::test]
    async fn unregister_resolves_pending_futures_as_closed() {
        let broker = MessageBroker::new(10);
        let manager = ConnectionManager::new(broker);
        let _rx = manager.register("c1", "mock", "default").await.unwrap();
        let conn = manager.get("c1").await.unwrap();
        let (tx, rx) = oneshot::channel();
        conn.pending_commands.lock().await.insert("req-1".into(), tx);
        manager.unregister("c1").await;
        assert_eq!(rx.await.unwrap(), CONNECTION_CLOSED);
        assert!(manager.get("c1").await.is_none());
    }

    #[tokio::test]
    async fn resolve_command_response_hits_pending_future() {
        let broker = MessageBroker::new(10);
        let manager = ConnectionManager::new(broker);
        let _rx = manager.register("c1", "mock", "default").await.unwrap();
        let conn = manager.get("c1").await.unwrap();
        let (tx, rx) = oneshot::channel();
        conn.pending_commands.lock().await.insert("req-1".into(), tx);
        assert!(manager.resolve_command_response("c1", "req-1", 0, Some("Gave 1 Diamond")).await);
        assert_eq!(rx.await.unwrap(), "Gave 1 Diamond");
    }

    #[tokio::test]
    async fn resolve_command_response_misses_unknown_request_id() {
        let broker = MessageBroker::new(10);
        let manager = ConnectionManager::new(broker);
        let _rx = manager.register("c1", "mock", "default").await.unwrap();
        assert!(!manager.resolve_command_response("c1", "nope", 0, None).await);
    }
}
