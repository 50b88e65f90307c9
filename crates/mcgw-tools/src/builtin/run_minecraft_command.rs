// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolOutput};

/// Callback the gateway binds per-connection: dispatches a raw MCBE command
/// and resolves once the matching `commandResponse` frame arrives (or the
/// gateway's own RPC timeout elapses).
pub type RunCommandFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = String> + Send>> + Send + Sync>;

/// The one tool exposed to the model: run a single Minecraft command on the
/// connected client and report back what happened.
///
/// Constructed fresh per request, closing over the connection's RPC
/// callback, so concurrent runs on different connections never share state.
pub struct RunMinecraftCommandTool {
    run_command: RunCommandFn,
}

impl RunMinecraftCommandTool {
    pub fn new(run_command: RunCommandFn) -> Self {
        Self { run_command }
    }
}

#[async_trait]
impl Tool for RunMinecraftCommandTool {
    fn name(&self) -> &str {
        "run_minecraft_command"
    }

    fn description(&self) -> &str {
        "Run a single Minecraft Bedrock command on the player's client, e.g. \
         `give @s diamond` or `tp @s 0 100 0`. Do not include the leading \
         slash. Returns the status message reported by the game."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Minecraft command without the leading slash"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let command = match call.args.get("command").and_then(Value::as_str) {
            Some(c) if !c.trim().is_empty() => c.trim().to_string(),
            _ => return ToolOutput::err(&call.id, "missing required argument: command"),
        };
        let result = (self.run_command)(command).await;
        ToolOutput::ok(&call.id, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echoing_tool() -> RunMinecraftCommandTool {
        RunMinecraftCommandTool::new(Arc::new(|cmd: String| {
            Box::pin(async move { format!("ran: {cmd}") })
        }))
    }

    #[tokio::test]
    async fn executes_command_via_callback() {
        let tool = echoing_tool();
        let call = ToolCall {
            id: "1".into(),
            name: "run_minecraft_command".into(),
            args: json!({ "command": "give @s diamond" }),
        };
        let out = tool.execute(&call).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "ran: give @s diamond");
    }

    #[tokio::test]
    async fn missing_command_is_error() {
        let tool = echoing_tool();
        let call = ToolCall {
            id: "2".into(),
            name: "run_minecraft_command".into(),
            args: json!({}),
        };
        let out = tool.execute(&call).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing required argument"));
    }

    #[tokio::test]
    async fn blank_command_is_error() {
        let tool = echoing_tool();
        let call = ToolCall {
            id: "3".into(),
            name: "run_minecraft_command".into(),
            args: json!({ "command": "   " }),
        };
        let out = tool.execute(&call).await;
        assert!(out.is_error);
    }

    #[test]
    fn name_and_schema_are_stable() {
        let tool = echoing_tool();
        assert_eq!(tool.name(), "run_minecraft_command");
        assert!(tool.parameters_schema()["required"]
            .as_array()
            .unwrap()
            .contains(&json!("command")));
    }
}
