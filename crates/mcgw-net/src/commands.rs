// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C7 command registry + dispatch: prefix/alias resolution and the
//! behavior of every player-typed command (§4.7).

use std::sync::Arc;

use mcgw_config::Config;
use mcgw_core::{check_and_compress, count_turns, PromptManager, SessionStore};
use mcgw_model::Message;
use tokio::sync::Mutex;
use tracing::warn;

use crate::auth::Authenticator;
use crate::connection::{ChunkType, ConnectionManager, StreamChunk};
use crate::protocol::{ChatRequest, Delivery};
use crate::worker::resolve_model_config;

pub const AUTH_REQUIRED_MESSAGE: &str = "请先登录";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Login,
    Chat,
    ChatScript,
    Context,
    Template,
    Setting,
    SwitchModel,
    RunCommand,
    Help,
    Save,
}

struct CommandSpec {
    prefix: &'static str,
    aliases: &'static [&'static str],
    command_type: CommandType,
    description: &'static str,
    usage: &'static str,
}

/// Maps a command prefix (or alias) to `{type, description, usage}` and
/// resolves player text into `(command_type, content_after_prefix)` (§4.7).
pub struct CommandRegistry {
    specs: Vec<CommandSpec>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        let specs = vec![
            CommandSpec { prefix: "#登录 ", aliases: &["#login "], command_type: CommandType::Login, description: "验证密码并登录", usage: "#登录 <密码>" },
            CommandSpec { prefix: "AGENT 聊天 ", aliases: &["AGENT CHAT "], command_type: CommandType::Chat, description: "与 AI 助手对话（游戏内文字显示）", usage: "AGENT 聊天 <内容>" },
            CommandSpec {
                prefix: "AGENT 脚本聊天 ",
                aliases: &["AGENT SCRIPTCHAT "],
                command_type: CommandType::ChatScript,
                description: "与 AI 助手对话（通过 scriptevent 投递）",
                usage: "AGENT 脚本聊天 <内容>",
            },
            CommandSpec { prefix: "AGENT 上下文 ", aliases: &["AGENT CONTEXT "], command_type: CommandType::Context, description: "管理对话上下文", usage: "AGENT 上下文 <启用|关闭|状态|压缩|保存|恢复 <id>|列表|删除 <id>|清除>" },
            CommandSpec { prefix: "AGENT 模板 ", aliases: &["AGENT TEMPLATE "], command_type: CommandType::Template, description: "查看或切换提示词模板", usage: "AGENT 模板 [list|<名称>]" },
            CommandSpec { prefix: "AGENT 设置 ", aliases: &["AGENT SET "], command_type: CommandType::Setting, description: "设置自定义变量", usage: "AGENT 设置 变量 <名称> <值>" },
            CommandSpec { prefix: "AGENT 切换模型 ", aliases: &["AGENT SWITCH "], command_type: CommandType::SwitchModel, description: "切换模型提供方", usage: "AGENT 切换模型 <名称>" },
            CommandSpec { prefix: "AGENT 指令 ", aliases: &["AGENT RUN "], command_type: CommandType::RunCommand, description: "直接执行一条 MCBE 指令", usage: "AGENT 指令 <command>" },
            CommandSpec { prefix: "AGENT 帮助", aliases: &["AGENT HELP"], command_type: CommandType::Help, description: "显示帮助", usage: "AGENT 帮助" },
            CommandSpec { prefix: "AGENT 保存", aliases: &["AGENT SAVE"], command_type: CommandType::Save, description: "保存当前对话", usage: "AGENT 保存" },
        ];
        Self { specs }
    }

    /// Tries an exact prefix match, then alias match, longest prefix first
    /// so `AGENT 帮助` doesn't shadow a longer sibling prefix.
    pub fn resolve<'a>(&self, message: &'a str) -> Option<(CommandType, &'a str)> {
        let mut candidates: Vec<&CommandSpec> = self.specs.iter().collect();
        candidates.sort_by_key(|s| std::cmp::Reverse(s.prefix.len()));
        for spec in &candidates {
            if let Some(rest) = message.strip_prefix(spec.prefix) {
                return Some((spec.command_type, rest.trim()));
            }
            for alias in spec.aliases {
                if let Some(rest) = message.strip_prefix(*alias) {
                    return Some((spec.command_type, rest.trim()));
                }
            }
        }
        None
    }

    pub fn help_text(&self) -> String {
        self.specs.iter().map(|s| format!("{} — {} ({})", s.usage, s.description, s.prefix.trim())).collect::<Vec<_>>().join("\n")
    }
}

/// Everything C7's dispatch needs: the connection/broker pair, the shared
/// prompt manager, the authenticator, the session store, and static config.
pub struct CommandContext {
    pub connections: Arc<ConnectionManager>,
    pub prompts: Arc<Mutex<PromptManager>>,
    pub auth: Arc<Authenticator>,
    pub store: Arc<SessionStore>,
    pub config: Arc<Config>,
}

impl CommandContext {
    /// Dispatches one resolved command for `conn_id`. Replies (errors,
    /// status reports, help text) are sent directly as rendered chunks;
    /// `chat`/`chat_script` instead enqueue a [`ChatRequest`] on the broker.
    pub async fn dispatch(&self, conn_id: &str, command_type: CommandType, content: &str) {
        let Some(connection) = self.connections.get(conn_id).await else { return };

        if command_type != CommandType::Login && !connection.is_authenticated() && !self.config.gateway.dev_mode {
            self.reply_error(conn_id, AUTH_REQUIRED_MESSAGE).await;
            return;
        }

        match command_type {
            CommandType::Login => match self.auth.verify_password(conn_id, content) {
                Ok(_token) => {
                    connection.set_authenticated(true);
                    self.reply_ok(conn_id, "登录成功").await;
                }
                Err(crate::auth::LoginError::NotConfigured) if self.config.gateway.dev_mode => {
                    connection.set_authenticated(true);
                    self.reply_ok(conn_id, "开发模式：已自动登录").await;
                }
                Err(crate::auth::LoginError::NotConfigured) => self.reply_error(conn_id, "未配置登录密码，请联系管理员").await,
                Err(crate::auth::LoginError::RateLimited) => self.reply_error(conn_id, "登录尝试过于频繁，请稍后再试").await,
                Err(crate::auth::LoginError::WrongPassword) => self.reply_error(conn_id, "密码错误").await,
            },
            CommandType::Chat => self.enqueue_chat(conn_id, content, Delivery::Tellraw).await,
            CommandType::ChatScript => self.enqueue_chat(conn_id, content, Delivery::Scriptevent).await,
            CommandType::Context => self.dispatch_context(conn_id, content).await,
            CommandType::Template => self.dispatch_template(conn_id, content).await,
            CommandType::Setting => self.dispatch_setting(conn_id, content).await,
            CommandType::SwitchModel => self.dispatch_switch_model(conn_id, content).await,
            CommandType::RunCommand => {
                self.connections.broker().send_response(
                    conn_id,
                    crate::broker::ResponseItem::RunCommand { command: content.to_string(), origin: "player", result_tx: None },
                );
            }
            CommandType::Help => self.reply_ok(conn_id, &CommandRegistry::new().help_text()).await,
            CommandType::Save => self.dispatch_save(conn_id).await,
        }
    }

    async fn enqueue_chat(&self, conn_id: &str, content: &str, delivery: Delivery) {
        if content.is_empty() {
            self.reply_error(conn_id, "请输入对话内容").await;
            return;
        }
        let Some(connection) = self.connections.get(conn_id).await else { return };
        let provider = connection.current_provider.lock().await.clone();
        let player_name = connection.player_name.lock().await.clone();
        let request = ChatRequest {
            connection_id: conn_id.to_string(),
            content: content.to_string(),
            player_name,
            use_context: connection.context_enabled(),
            provider: Some(provider),
            delivery,
        };
        if self.connections.broker().submit_request(conn_id, request, 0).is_err() {
            self.reply_error(conn_id, "服务器繁忙，请稍后重试").await;
        }
    }

    async fn dispatch_context(&self, conn_id: &str, content: &str) {
        let Some(connection) = self.connections.get(conn_id).await else { return };
        let broker = self.connections.broker();
        let mut parts = content.splitn(2, ' ');
        match parts.next().unwrap_or("") {
            "启用" => {
                connection.set_context_enabled(true);
                self.reply_ok(conn_id, "已启用上下文记忆").await;
            }
            "关闭" => {
                connection.set_context_enabled(false);
                broker.clear_conversation_history(conn_id).await;
                self.reply_ok(conn_id, "已关闭上下文记忆并清除历史").await;
            }
            "清除" => {
                broker.clear_conversation_history(conn_id).await;
                self.reply_ok(conn_id, "已清除对话历史").await;
            }
            "状态" => {
                let history = broker.get_conversation_history(conn_id).await.unwrap_or_default();
                let turns = count_turns(&history);
                let tokens: usize = history.iter().map(Message::approx_tokens).sum();
                let enabled = if connection.context_enabled() { "启用" } else { "关闭" };
                self.reply_ok(conn_id, &format!("上下文: {enabled} | 轮数: {turns} | 估算 tokens: {tokens}")).await;
            }
            "压缩" => {
                let mut history = broker.get_conversation_history(conn_id).await.unwrap_or_default();
                let max_turns = self.config.gateway.max_history_turns;
                let compressed = check_and_compress(&mut history, max_turns, true);
                broker.set_conversation_history(conn_id, history).await;
                let msg = if compressed { "已压缩历史记录" } else { "历史记录尚不需要压缩" };
                self.reply_ok(conn_id, msg).await;
            }
            "保存" => self.dispatch_save(conn_id).await,
            "列表" => match self.store.list() {
                Ok(list) if list.is_empty() => self.reply_ok(conn_id, "暂无已保存的对话").await,
                Ok(list) => {
                    let body = list.iter().map(|s| format!("{} ({} 条消息)", s.id, s.message_count)).collect::<Vec<_>>().join("\n");
                    self.reply_ok(conn_id, &body).await;
                }
                Err(err) => self.reply_error(conn_id, &format!("列表读取失败: {err}")).await,
            },
            "恢复" => {
                let Some(id) = parts.next() else { return self.reply_error(conn_id, "用法: 恢复 <id>").await };
                match self.store.load(id) {
                    Ok(stored) => {
                        broker.set_conversation_history(conn_id, stored.messages).await;
                        *connection.current_provider.lock().await = stored.provider;
                        self.reply_ok(conn_id, &format!("已恢复会话 {id}")).await;
                    }
                    Err(err) => self.reply_error(conn_id, &format!("恢复失败: {err}")).await,
                }
            }
            "删除" => {
                let Some(id) = parts.next() else { return self.reply_error(conn_id, "用法: 删除 <id>").await };
                match self.store.delete(id) {
                    Ok(true) => self.reply_ok(conn_id, &format!("已删除会话 {id}")).await,
                    Ok(false) => self.reply_error(conn_id, &format!("未找到会话 {id}")).await,
                    Err(err) => self.reply_error(conn_id, &format!("删除失败: {err}")).await,
                }
            }
            other => self.reply_error(conn_id, &format!("未知的上下文子命令: {other}")).await,
        }
    }

    async fn dispatch_template(&self, conn_id: &str, content: &str) {
        let prompts = self.prompts.lock().await;
        if content.is_empty() {
            let Some(connection) = self.connections.get(conn_id).await else { return };
            let current = connection.current_template.lock().await.clone();
            drop(prompts);
            self.reply_ok(conn_id, &format!("当前模板: {current}")).await;
            return;
        }
        if content.eq_ignore_ascii_case("list") {
            let names = prompts.template_names().join(", ");
            drop(prompts);
            self.reply_ok(conn_id, &format!("可用模板: {names}")).await;
            return;
        }
        if prompts.template(content).is_none() {
            drop(prompts);
            self.reply_error(conn_id, &format!("未知的模板: {content}")).await;
            return;
        }
        drop(prompts);
        self.prompts.lock().await.set_connection_template(conn_id, content);
        if let Some(connection) = self.connections.get(conn_id).await {
            *connection.current_template.lock().await = content.to_string();
        }
        self.reply_ok(conn_id, &format!("已切换到模板: {content}")).await;
    }

    async fn dispatch_setting(&self, conn_id: &str, content: &str) {
        let Some(rest) = content.strip_prefix("变量 ") else {
            return self.reply_error(conn_id, "用法: 变量 <名称> <值>").await;
        };
        let (name, value) = if let Some((n, v)) = rest.split_once('=') {
            (n.trim(), v.trim())
        } else if let Some((n, v)) = rest.split_once(' ') {
            (n.trim(), v.trim())
        } else {
            return self.reply_error(conn_id, "用法: 变量 <名称> <值>").await;
        };
        if name.is_empty() || value.is_empty() {
            return self.reply_error(conn_id, "用法: 变量 <名称> <值>").await;
        }
        self.prompts.lock().await.set_custom_variable(conn_id, format!("custom_{name}"), value);
        self.reply_ok(conn_id, &format!("已设置变量 {name} = {value}")).await;
    }

    async fn dispatch_switch_model(&self, conn_id: &str, content: &str) {
        if content.is_empty() {
            return self.reply_error(conn_id, "用法: 切换模型 <名称>").await;
        }
        if resolve_model_config(&self.config, content).is_none() {
            return self.reply_error(conn_id, &format!("未配置的模型提供方: {content}")).await;
        }
        let Some(connection) = self.connections.get(conn_id).await else { return };
        *connection.current_provider.lock().await = content.to_string();
        self.connections.broker().clear_conversation_history(conn_id).await;
        self.reply_ok(conn_id, &format!("已切换模型提供方: {content}，历史记录已清除")).await;
    }

    async fn dispatch_save(&self, conn_id: &str) {
        let Some(connection) = self.connections.get(conn_id).await else { return };
        let messages = self.connections.broker().get_conversation_history(conn_id).await.unwrap_or_default();
        let provider = connection.current_provider.lock().await.clone();
        let player_name = connection.player_name.lock().await.clone();
        let now = chrono::Utc::now();
        let stored = mcgw_core::StoredSession {
            connection_id: conn_id.to_string(),
            player_name,
            provider,
            model: String::new(),
            created_at: now,
            updated_at: now,
            message_count: messages.len(),
            messages,
            metadata: Default::default(),
        };
        let session_id = mcgw_core::new_session_id(conn_id);
        match self.store.save(&session_id, &stored) {
            Ok(()) => self.reply_ok(conn_id, &format!("已保存会话: {session_id}")).await,
            Err(err) => self.reply_error(conn_id, &format!("保存失败: {err}")).await,
        }
    }

    async fn reply_ok(&self, conn_id: &str, content: &str) {
        self.reply(conn_id, ChunkType::Content, content).await;
    }

    async fn reply_error(&self, conn_id: &str, content: &str) {
        self.reply(conn_id, ChunkType::Error, content).await;
    }

    async fn reply(&self, conn_id: &str, chunk_type: ChunkType, content: &str) {
        let chunk = StreamChunk {
            connection_id: conn_id.to_string(),
            sequence: 0,
            chunk_type,
            content: content.to_string(),
            delivery: Delivery::Tellraw,
            tool_name: None,
            tool_args: None,
            tool_result_preview: None,
        };
        if !self.connections.broker().send_response(conn_id, crate::broker::ResponseItem::GameMessage(chunk)) {
            warn!(conn_id, "dropped a command reply for an unregistered connection");
        }
    }
}
