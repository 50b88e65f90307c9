// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-connection system prompt templates and variable substitution (§4.8).

use chrono::Local;
use std::collections::HashMap;

pub const DEFAULT_TEMPLATE_NAME: &str = "default";

const TOOL_USAGE_GUIDANCE: &str = "可用工具：`run_minecraft_command` 可通过 /scriptevent 或 tellraw 在游戏内执行命令。\
仅在明确需要影响游戏世界或回应玩家指令时调用，不要为了确认而反复调用。";

fn default_template_content() -> String {
    "你是 Minecraft 基岩版服务器中的 AI 助手，通过游戏内聊天与玩家 {player_name} 对话。\n\
     连接: {connection_id} | 模型提供方: {provider} | 模型: {model}\n\
     当前服务器时间: {server_time} | 上下文窗口: {context_length} tokens\n\n\
     {tool_usage}\n\n\
     请使用简洁自然的中文或玩家所用的语言回复，回复会直接显示在游戏内聊天栏中。"
        .to_string()
}

/// A named, reusable prompt body with `{placeholder}` substitution points.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub name: String,
    pub description: String,
    pub content: String,
    /// Declared placeholder names this template expects (informational —
    /// substitution itself works on any `{name}` found in `content`).
    pub variables: Vec<String>,
}

impl PromptTemplate {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
        variables: Vec<String>,
    ) -> Self {
        Self { name: name.into(), description: description.into(), content: content.into(), variables }
    }
}

/// Per-connection template selection and custom variable bindings.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPromptState {
    pub template_name: String,
    pub variable_map: HashMap<String, String>,
}

/// C8: maintains named templates and per-connection `(template_name,
/// variable_map)` state, producing the final system prompt string for a run.
#[derive(Debug)]
pub struct PromptManager {
    templates: HashMap<String, PromptTemplate>,
    connections: HashMap<String, ConnectionPromptState>,
}

impl Default for PromptManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptManager {
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            DEFAULT_TEMPLATE_NAME.to_string(),
            PromptTemplate::new(
                DEFAULT_TEMPLATE_NAME,
                "内置默认提示词模板",
                default_template_content(),
                vec![
                    "player_name".into(),
                    "connection_id".into(),
                    "provider".into(),
                    "model".into(),
                    "server_time".into(),
                    "context_length".into(),
                    "tool_usage".into(),
                ],
            ),
        );
        Self { templates, connections: HashMap::new() }
    }

    pub fn register_template(&mut self, template: PromptTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn template(&self, name: &str) -> Option<&PromptTemplate> {
        self.templates.get(name)
    }

    pub fn template_names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    /// Switch a connection to a named template. Falls back to the default
    /// template at build time if `name` turns out not to be registered.
    pub fn set_connection_template(&mut self, conn_id: &str, template_name: impl Into<String>) {
        self.connections.entry(conn_id.to_string()).or_default().template_name = template_name.into();
    }

    pub fn set_custom_variable(&mut self, conn_id: &str, key: impl Into<String>, value: impl Into<String>) {
        self.connections
            .entry(conn_id.to_string())
            .or_default()
            .variable_map
            .insert(key.into(), value.into());
    }

    pub fn clear_connection(&mut self, conn_id: &str) {
        self.connections.remove(conn_id);
    }

    /// Build the system prompt for `conn_id`, substituting built-in
    /// placeholders plus any custom-prefixed variables bound to this
    /// connection. Variables with no matching placeholder in the template are
    /// appended as a readable "--- 自定义变量 ---" section.
    pub fn build_system_prompt(
        &self,
        conn_id: &str,
        player_name: Option<&str>,
        provider: &str,
        model: &str,
        context_length: usize,
    ) -> String {
        let state = self.connections.get(conn_id);
        let template_name = state.map(|s| s.template_name.as_str()).unwrap_or(DEFAULT_TEMPLATE_NAME);
        let template = self
            .templates
            .get(template_name)
            .or_else(|| self.templates.get(DEFAULT_TEMPLATE_NAME))
            .expect("default template is always registered");

        let empty = HashMap::new();
        let custom_vars = state.map(|s| &s.variable_map).unwrap_or(&empty);

        let mut content = template.content.clone();
        let connection_id_prefix: String = conn_id.chars().take(8).collect();
        let built_ins: [(&str, String); 6] = [
            ("{player_name}", player_name.unwrap_or("玩家").to_string()),
            ("{connection_id}", connection_id_prefix),
            ("{provider}", provider.to_string()),
            ("{model}", model.to_string()),
            ("{server_time}", Local::now().format("%Y-%m-%d %H:%M:%S").to_string()),
            ("{context_length}", context_length.to_string()),
        ];
        for (placeholder, value) in &built_ins {
            content = content.replace(placeholder, value);
        }
        content = content.replace("{tool_usage}", TOOL_USAGE_GUIDANCE);

        let mut unplaced: Vec<(&str, &str)> = Vec::new();
        let mut custom_keys: Vec<&String> = custom_vars.keys().collect();
        custom_keys.sort();
        for key in custom_keys {
            let value = &custom_vars[key];
            let placeholder = format!("{{{key}}}");
            if content.contains(&placeholder) {
                content = content.replace(&placeholder, value);
            } else {
                unplaced.push((key.as_str(), value.as_str()));
            }
        }

        if !unplaced.is_empty() {
            content.push_str("\n\n--- 自定义变量 ---");
            for (key, value) in unplaced {
                let display_key = key.strip_prefix("custom_").unwrap_or(key);
                content.push_str(&format!("\n{display_key}: {value}"));
            }
        }

        content
    }
}
