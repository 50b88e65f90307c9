// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! C5 AgentWorker pool: consumes requests from C1, assembles tool/model
//! dependencies, drives C3, routes its events into C1's response queues,
//! and updates C4 state (§4.5).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use mcgw_config::{Config, ModelConfig};
use mcgw_core::{check_and_compress, strip_reasoning, AgentEngine, PromptManager, StreamEvent};
use mcgw_model::{Message, ModelProvider, ProviderRegistry};
use mcgw_tools::builtin::RunCommandFn;
use mcgw_tools::{RunMinecraftCommandTool, ToolRegistry};
use tokio::sync::{oneshot, Mutex};
use tracing::{error, warn};

use crate::broker::{MessageBroker, ResponseItem};
use crate::connection::{ChunkType, ConnectionManager, StreamChunk};
use crate::protocol::ChatRequest;

const COMMAND_RPC_TIMEOUT: Duration = Duration::from_secs(10);
const TOOL_ARGS_PREVIEW_CHARS: usize = 20;
const TOOL_ARGS_PREVIEW_MAX_KEYS: usize = 3;
const TOOL_RESULT_PREVIEW_CHARS: usize = 80;

/// Resolve a named provider to its [`ModelConfig`]: the `providers` map
/// takes priority (explicit switch targets), falling back to the top-level
/// `model` config when `name` is the configured default provider.
pub(crate) fn resolve_model_config<'a>(config: &'a Config, name: &str) -> Option<&'a ModelConfig> {
    config.providers.get(name).or_else(|| {
        if name == config.gateway.default_provider || name == config.model.provider {
            Some(&config.model)
        } else {
            None
        }
    })
}

/// One agent worker: pulls requests off the broker, serializes per
/// connection via its lock, and drives one [`AgentEngine`] run per request.
pub struct AgentWorker {
    id: usize,
    broker: MessageBroker,
    connections: Arc<ConnectionManager>,
    providers: ProviderRegistry,
    prompts: Arc<Mutex<PromptManager>>,
    config: Arc<Config>,
}

impl AgentWorker {
    pub fn new(
        id: usize,
        broker: MessageBroker,
        connections: Arc<ConnectionManager>,
        providers: ProviderRegistry,
        prompts: Arc<Mutex<PromptManager>>,
        config: Arc<Config>,
    ) -> Self {
        Self { id, broker, connections, providers, prompts, config }
    }

    /// Runs until `shutdown` fires. Each iteration waits (with a bounded
    /// poll so shutdown is prompt) for a request, takes the connection's
    /// lock, processes it, then releases the lock and marks it done.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let envelope = tokio::select! {
                env = self.broker.get_request() => env,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                    continue;
                }
            };

            let conn_id = envelope.connection_id.clone();
            let Some(lock) = self.broker.get_connection_lock(&conn_id) else {
                warn!(worker = self.id, conn_id, "dropping request for unregistered connection");
                self.broker.request_done();
                continue;
            };
            let _guard = lock.lock().await;
            if let Err(err) = self.process(&conn_id, envelope.payload).await {
                error!(worker = self.id, conn_id, error = %err, "request processing failed");
            }
            self.broker.request_done();
        }
    }

    async fn process(&self, conn_id: &str, request: ChatRequest) -> anyhow::Result<()> {
        let Some(connection) = self.connections.get(conn_id).await else {
            return Ok(());
        };

        let mut history = if request.use_context {
            self.broker.get_conversation_history(conn_id).await.unwrap_or_default()
        } else {
            Vec::new()
        };
        strip_reasoning(&mut history);

        let provider_name = request
            .provider
            .clone()
            .unwrap_or_else(|| connection.current_provider.try_lock().map(|p| p.clone()).unwrap_or_else(|_| self.config.gateway.default_provider.clone()));

        let Some(model_cfg) = resolve_model_config(&self.config, &provider_name) else {
            self.emit_error(conn_id, request.delivery, format!("未配置的模型提供方: {provider_name}")).await;
            return Ok(());
        };

        let model = match self.providers.get_model(model_cfg) {
            Ok(model) => model,
            Err(err) => {
                self.emit_error(conn_id, request.delivery, format!("模型初始化失败: {err}")).await;
                return Ok(());
            }
        };

        let player_name = request.player_name.clone().or_else(|| connection.player_name.try_lock().ok().and_then(|p| p.clone()));
        let system_prompt = {
            let prompts = self.prompts.lock().await;
            prompts.build_system_prompt(conn_id, player_name.as_deref(), &provider_name, &model_cfg.name, model.catalog_context_window().unwrap_or(0) as usize)
        };

        if history.first().map(|m| m.role) != Some(mcgw_model::Role::System) {
            history.insert(0, Message::system(system_prompt));
        } else {
            history[0] = Message::system(system_prompt);
        }
        history.push(Message::user(request.content.clone()));

        let tools = self.build_tools(conn_id.to_string(), request.delivery);
        let engine = Arc::new(AgentEngine::new(model, tools));

        let (tx, mut rx) = tokio::sync::mpsc::channel::<StreamEvent>(256);
        let stream_mode = self.config.gateway.stream_sentence_mode;
        let turn_history = history.clone();
        let run_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if stream_mode {
                run_engine.run_streaming(turn_history, tx).await;
            } else {
                run_engine.run_non_stream(turn_history, tx).await;
            }
        });

        let mut completed = false;
        while let Some(event) = rx.recv().await {
            self.handle_event(conn_id, request.delivery, &mut history, event, &mut completed).await;
        }
        if !completed {
            warn!(conn_id, "agent run ended without a completion event");
        }

        Ok(())
    }

    async fn handle_event(
        &self,
        conn_id: &str,
        delivery: crate::protocol::Delivery,
        history: &mut Vec<Message>,
        event: StreamEvent,
        completed: &mut bool,
    ) {
        match event {
            StreamEvent::Content { sequence, text, metadata } => {
                if let Some(metadata) = metadata {
                    *completed = true;
                    *history = metadata.all_messages;
                    let max_turns = self.config.gateway.max_history_turns;
                    let trimmed = mcgw_core::trim(history, max_turns);
                    *history = trimmed;
                    strip_reasoning(history);
                    check_and_compress(history, max_turns, false);
                    self.broker.set_conversation_history(conn_id, history.clone()).await;
                    return;
                }
                if text.is_empty() {
                    return;
                }
                self.send_chunk(conn_id, sequence, ChunkType::Content, text, delivery, None, None, None).await;
            }
            StreamEvent::Reasoning { sequence, text } => {
                self.send_chunk(conn_id, sequence, ChunkType::Reasoning, text, delivery, None, None, None).await;
            }
            StreamEvent::ToolCall { sequence, tool_name, tool_call_id: _, args } => {
                let rendered = format!("● {}({})", tool_name, preview_args(&args));
                self.send_chunk(conn_id, sequence, ChunkType::ToolCall, rendered, delivery, Some(tool_name), Some(args), None).await;
            }
            StreamEvent::ToolResult { sequence, tool_call_id: _, content } => {
                if !self.config.gateway.tool_response_verbose {
                    return;
                }
                let preview = truncate_chars(&content, TOOL_RESULT_PREVIEW_CHARS);
                self.send_chunk(conn_id, sequence, ChunkType::ToolResult, preview.clone(), delivery, None, None, Some(preview)).await;
            }
            StreamEvent::Error { sequence, message } => {
                self.send_chunk(conn_id, sequence, ChunkType::Error, message, delivery, None, None, None).await;
            }
        }
    }

    async fn emit_error(&self, conn_id: &str, delivery: crate::protocol::Delivery, message: String) {
        self.send_chunk(conn_id, 0, ChunkType::Error, message, delivery, None, None, None).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_chunk(
        &self,
        conn_id: &str,
        sequence: u64,
        chunk_type: ChunkType,
        content: String,
        delivery: crate::protocol::Delivery,
        tool_name: Option<String>,
        tool_args: Option<serde_json::Value>,
        tool_result_preview: Option<String>,
    ) {
        let chunk = StreamChunk { connection_id: conn_id.to_string(), sequence, chunk_type, content, delivery, tool_name, tool_args, tool_result_preview };
        if !self.broker.send_response(conn_id, ResponseItem::GameMessage(chunk)) {
            warn!(conn_id, "dropping chunk for a connection that already unregistered");
        }
    }

    fn build_tools(&self, conn_id: String, _delivery: crate::protocol::Delivery) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        let broker = self.broker.clone();
        let run_command: RunCommandFn = Arc::new(move |command: String| -> Pin<Box<dyn Future<Output = String> + Send>> {
            let broker = broker.clone();
            let conn_id = conn_id.clone();
            Box::pin(async move {
                let (tx, rx) = oneshot::channel();
                let sent = broker.send_response(
                    &conn_id,
                    ResponseItem::RunCommand { command, origin: "player", result_tx: Some(tx) },
                );
                if !sent {
                    return "连接已关闭".to_string();
                }
                match tokio::time::timeout(COMMAND_RPC_TIMEOUT, rx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => "命令执行失败: 连接已关闭".to_string(),
                    Err(_) => "命令执行超时，请稍后查看游戏内结果".to_string(),
                }
            })
        });
        registry.register(RunMinecraftCommandTool::new(run_command));
        Arc::new(registry)
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Render up to three key `(name, value)` pairs from a tool call's argument
/// object, truncating string values to 20 chars, for the `"● name(args)"`
/// tool-call display line (§4.5).
fn preview_args(args: &serde_json::Value) -> String {
    let Some(map) = args.as_object() else {
        return args.to_string();
    };
    map.iter()
        .take(TOOL_ARGS_PREVIEW_MAX_KEYS)
        .map(|(k, v)| {
            let value_str = match v {
                serde_json::Value::String(s) => truncate_chars(s, TOOL_ARGS_PREVIEW_CHARS),
                other => truncate_chars(&other.to_string(), TOOL_ARGS_PREVIEW_CHARS),
            };
            format!("{k}={value_str}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}
