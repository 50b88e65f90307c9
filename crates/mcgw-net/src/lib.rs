// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wires C1–C8 together: an axum WebSocket server bridging MCBE game
//! clients to the agent pipeline (§2, §5, §6).

mod auth;
mod broker;
mod commands;
mod connection;
mod protocol;
mod worker;

pub use auth::{Authenticator, LoginError};
pub use broker::{MessageBroker, QueueFull, RequestEnvelope, ResponseItem};
pub use commands::{CommandContext, CommandRegistry, CommandType, AUTH_REQUIRED_MESSAGE};
pub use connection::{ChunkType, Connection, ConnectionManager, OutboundSink, StreamChunk, CONNECTION_CLOSED};
pub use protocol::{
    accept_frame, build_command_request, escape_tellraw_text, is_external_duplicate, resolve_command_response, scriptevent_command_line,
    subscribe_frame, tellraw_command_line, welcome_frame, ChatRequest, Delivery, InboundFrame, PlayerMessage, COMMAND_VERSION,
};
pub use worker::AgentWorker;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use mcgw_config::Config;
use mcgw_core::{PromptManager, SessionStore, DEFAULT_TEMPLATE_NAME};
use mcgw_model::ProviderRegistry;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Top-level gateway state shared by the axum handler and the worker pool.
pub struct Gateway {
    config: Arc<Config>,
    connections: Arc<ConnectionManager>,
    registry: CommandRegistry,
    ctx: CommandContext,
}

impl Gateway {
    /// Builds the gateway and runs it until a Ctrl-C signal is received.
    pub async fn run(config: Config) -> anyhow::Result<()> {
        let config = Arc::new(config);

        let providers = ProviderRegistry::new();
        if let Err(err) = providers.warmup_models(&config.model) {
            warn!(error = %err, "failed to warm up default model provider; continuing, it will be constructed lazily");
        }

        let prompts = Arc::new(Mutex::new(PromptManager::new()));
        let broker = MessageBroker::new(config.gateway.queue_max_size);
        let connections = Arc::new(ConnectionManager::new(broker.clone()));
        let auth = Arc::new(Authenticator::new(config.auth.default_password.clone(), config.auth.jwt_secret.clone(), config.auth.jwt_expiration_secs));
        let store = Arc::new(SessionStore::new("data/conversations"));

        let ctx = CommandContext { connections: Arc::clone(&connections), prompts: Arc::clone(&prompts), auth, store, config: Arc::clone(&config) };
        let registry = CommandRegistry::new();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        for id in 0..config.gateway.llm_worker_count.max(1) {
            let worker = AgentWorker::new(id, broker.clone(), Arc::clone(&connections), providers.clone(), Arc::clone(&prompts), Arc::clone(&config));
            let rx = shutdown_rx.clone();
            tokio::spawn(async move {
                worker.run(rx).await;
            });
        }

        let gateway = Arc::new(Gateway { config: Arc::clone(&config), connections, registry, ctx });

        let addr: SocketAddr = format!("{}:{}", gateway.config.gateway.host, gateway.config.gateway.port).parse()?;
        let app = Router::new().route("/", get(ws_handler)).with_state(Arc::clone(&gateway));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "mcgw gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            })
            .await?;

        providers.shutdown();
        Ok(())
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>) {
    let conn_id = Uuid::new_v4().to_string();
    let default_provider = gateway.config.gateway.default_provider.clone();

    let Some(rx) = gateway.connections.register(&conn_id, &default_provider, DEFAULT_TEMPLATE_NAME).await else {
        warn!(conn_id, "duplicate connection id generated; dropping socket");
        return;
    };

    let (write, mut read) = socket.split();
    let mut sink = AxumSink(write);

    if let Err(err) = send_handshake(&mut sink).await {
        warn!(conn_id, error = %err, "handshake send failed");
    }

    let sender_connections = Arc::clone(&gateway.connections);
    let sender_conn_id = conn_id.clone();
    let sender_task = tokio::spawn(async move {
        sender_connections.run_sender_loop(sender_conn_id, rx, sink).await;
    });

    while let Some(Ok(msg)) = read.next().await {
        if let WsMessage::Text(text) = msg {
            handle_inbound_text(&gateway, &conn_id, &text).await;
        }
    }

    gateway.connections.unregister(&conn_id).await;
    sender_task.abort();
    debug!(conn_id, "connection closed");
}

/// `Result:"true"` accept ack, then subscribe to `PlayerMessage`, then the
/// one-time welcome text (§6).
async fn send_handshake(sink: &mut AxumSink) -> anyhow::Result<()> {
    sink.send_text(accept_frame().to_string()).await?;
    sink.send_text(subscribe_frame("PlayerMessage").to_string()).await?;
    sink.send_text(welcome_frame().to_string()).await?;
    Ok(())
}

struct AxumSink(futures::stream::SplitSink<WebSocket, WsMessage>);

#[async_trait::async_trait]
impl OutboundSink for AxumSink {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.0.send(WsMessage::Text(text)).await?;
        Ok(())
    }
}

/// Inbound frame handling order (§4.7): drop external duplicates, resolve
/// `commandResponse`s, parse `PlayerMessage`, lazily set the player name,
/// then route through the command registry.
async fn handle_inbound_text(gateway: &Gateway, conn_id: &str, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(conn_id, error = %err, "ignoring non-frame inbound text");
            return;
        }
    };

    if frame.is_command_response() {
        if let Some(request_id) = frame.header.request_id.as_deref() {
            if let Some((code, message)) = frame.status() {
                gateway.ctx.connections.resolve_command_response(conn_id, request_id, code, message.as_deref()).await;
            }
        }
        return;
    }

    let Some(player_message) = frame.player_message() else { return };

    if gateway.config.gateway.dedup_external_messages && is_external_duplicate(&player_message) {
        return;
    }

    if let Some(connection) = gateway.ctx.connections.get(conn_id).await {
        let mut name = connection.player_name.lock().await;
        if name.is_none() {
            *name = Some(player_message.sender.clone());
        }
    }

    match gateway.registry.resolve(&player_message.message) {
        Some((command_type, content)) => gateway.ctx.dispatch(conn_id, command_type, content).await,
        None => debug!(conn_id, message = %player_message.message, "player text matched no command prefix"),
    }
}
