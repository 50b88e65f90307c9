// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Named provider configurations, looked up by name when a connection
    /// issues `#切换模型 <name>` or `switch_model`.
    ///
    /// ```yaml
    /// providers:
    ///   my_ollama:
    ///     provider: openai        # uses the OpenAI-compatible wire format
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2          # default model for this provider
    ///   work_anthropic:
    ///     provider: anthropic
    ///     api_key_env: WORK_ANTHROPIC_KEY
    ///     name: claude-opus-4-5
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier. See `mcgw_model::registry::list_drivers()` for the
    /// full list. Common values: "openai" | "anthropic" | "google" | "azure" |
    /// "aws" | "groq" | "openrouter" | "ollama" | "mistral" | "deepseek" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies, LiteLLM, or Cloudflare.
    /// For most hosted providers the correct default is auto-selected.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Per-provider HTTP timeout in seconds. Part of the provider cache key.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    // ── Azure OpenAI ─────────────────────────────────────────────────────────
    /// Azure resource name (the subdomain of `.openai.azure.com`).
    /// Required when provider = "azure" and base_url is not set.
    pub azure_resource: Option<String>,
    /// Azure deployment name.  Defaults to `model.name` when not set.
    pub azure_deployment: Option<String>,
    /// Azure REST API version string, e.g. `"2024-02-01"`.
    pub azure_api_version: Option<String>,

    // ── AWS Bedrock ───────────────────────────────────────────────────────────
    /// AWS region override (also honoured via AWS_DEFAULT_REGION env var).
    pub aws_region: Option<String>,

    // ── Prompt caching ────────────────────────────────────────────────────────
    /// Attach an explicit cache-control marker to the system message.
    ///
    /// **Anthropic**: adds `"cache_control": {"type": "ephemeral"}` to the
    /// system block. **Other providers**: no effect.
    #[serde(default = "default_true")]
    pub cache_system_prompt: bool,
    /// Use the extended (1-hour) cache TTL instead of the default 5-minute
    /// window. Anthropic only.
    #[serde(default)]
    pub extended_cache_time: bool,
    /// Cache tool definitions (Anthropic only).
    #[serde(default = "default_true")]
    pub cache_tools: bool,
    /// Cache conversation history up to the last message (Anthropic only).
    #[serde(default = "default_true")]
    pub cache_conversation: bool,
    /// Cache image content blocks in conversation history (Anthropic only).
    #[serde(default = "default_true")]
    pub cache_images: bool,
    /// Cache large tool results in conversation history (Anthropic only).
    #[serde(default = "default_true")]
    pub cache_tool_results: bool,

    // ── Provider-specific extras ──────────────────────────────────────────────
    /// Free-form provider-specific options forwarded as-is to the driver.
    #[serde(default)]
    pub driver_options: serde_json::Value,

    // ── Mock provider ─────────────────────────────────────────────────────────
    /// Path to YAML mock-responses file (used when provider = "mock").
    pub mock_responses_file: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            timeout_secs: default_timeout_secs(),
            azure_resource: None,
            azure_deployment: None,
            azure_api_version: None,
            aws_region: None,
            cache_system_prompt: true,
            extended_cache_time: false,
            cache_tools: true,
            cache_conversation: true,
            cache_images: true,
            cache_tool_results: true,
            driver_options: serde_json::Value::Null,
            mock_responses_file: None,
        }
    }
}

// ─── Gateway configuration ───────────────────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_queue_max_size() -> usize {
    256
}
fn default_llm_worker_count() -> usize {
    4
}
fn default_default_provider() -> String {
    "openai".into()
}
fn default_max_history_turns() -> usize {
    20
}

/// Gateway-wide runtime configuration: listener, queueing, and per-connection
/// defaults (section 6 of the configuration surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// WebSocket listener bind address
    #[serde(default = "default_host")]
    pub host: String,
    /// WebSocket listener port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Priority request queue capacity; enqueue past this fails with `QueueFull`
    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,
    /// Number of concurrent agent workers consuming the request queue
    #[serde(default = "default_llm_worker_count")]
    pub llm_worker_count: usize,
    /// Provider name used when a connection has not switched explicitly
    #[serde(default = "default_default_provider")]
    pub default_provider: String,
    /// `N` for conversation trimming; auto-compress threshold is `floor(0.8*N)`
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    /// `true` = stream sentence-by-sentence; `false` = batch after completion
    #[serde(default = "default_true")]
    pub stream_sentence_mode: bool,
    /// Whether `tool_result` chunks are forwarded to the game client
    #[serde(default)]
    pub tool_response_verbose: bool,
    /// Drop `PlayerMessage` events whose sender is the literal `外部`
    #[serde(default = "default_true")]
    pub dedup_external_messages: bool,
    /// Bypass the login gate; for local debugging only
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            queue_max_size: default_queue_max_size(),
            llm_worker_count: default_llm_worker_count(),
            default_provider: default_default_provider(),
            max_history_turns: default_max_history_turns(),
            stream_sentence_mode: true,
            tool_response_verbose: false,
            dedup_external_messages: true,
            dev_mode: false,
            websocket: WebSocketConfig::default(),
        }
    }
}

fn default_ping_interval_secs() -> u64 {
    20
}
fn default_ping_timeout_secs() -> u64 {
    10
}
fn default_close_timeout_secs() -> u64 {
    5
}
fn default_max_size_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_max_queue() -> usize {
    512
}

/// Transport tuning for the WebSocket listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
    /// Maximum accepted frame size in bytes
    #[serde(default = "default_max_size_bytes")]
    pub max_size: usize,
    /// Maximum outstanding frames queued per connection before backpressure
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            close_timeout_secs: default_close_timeout_secs(),
            max_size: default_max_size_bytes(),
            max_queue: default_max_queue(),
        }
    }
}

fn default_jwt_expiration_secs() -> u64 {
    24 * 3600
}
fn default_jwt_secret() -> String {
    "change-me-in-production".into()
}

/// Login/auth collaborator configuration (§C7 login command).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_jwt_expiration_secs")]
    pub jwt_expiration_secs: u64,
    /// Shared password connections present via `#登录 <password>`
    pub default_password: Option<String>,
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_expiration_secs: default_jwt_expiration_secs(),
            default_password: None,
            jwt_secret: default_jwt_secret(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_model_provider_is_openai() {
        let c = Config::default();
        assert_eq!(c.model.provider, "openai");
    }

    #[test]
    fn config_default_model_name_is_gpt4o() {
        let c = Config::default();
        assert_eq!(c.model.name, "gpt-4o");
    }

    #[test]
    fn config_default_api_key_env_is_none() {
        let c = Config::default();
        assert!(c.model.api_key_env.is_none());
    }

    #[test]
    fn config_default_no_explicit_api_key() {
        let c = Config::default();
        assert!(c.model.api_key.is_none());
    }

    #[test]
    fn config_default_gateway_host_port() {
        let c = Config::default();
        assert_eq!(c.gateway.host, "0.0.0.0");
        assert_eq!(c.gateway.port, 8080);
    }

    #[test]
    fn config_default_max_history_turns_positive() {
        let c = Config::default();
        assert!(c.gateway.max_history_turns > 0);
    }

    #[test]
    fn config_default_stream_sentence_mode_is_true() {
        let c = Config::default();
        assert!(c.gateway.stream_sentence_mode);
    }

    #[test]
    fn config_default_dev_mode_is_false() {
        let c = Config::default();
        assert!(!c.gateway.dev_mode);
    }

    #[test]
    fn config_default_dedup_external_messages_is_true() {
        let c = Config::default();
        assert!(c.gateway.dedup_external_messages);
    }

    #[test]
    fn config_default_websocket_max_queue_positive() {
        let c = Config::default();
        assert!(c.gateway.websocket.max_queue > 0);
    }

    #[test]
    fn config_default_auth_jwt_secret_present() {
        let c = Config::default();
        assert!(!c.auth.jwt_secret.is_empty());
    }

    #[test]
    fn config_cache_system_prompt_can_be_disabled_via_yaml() {
        let yaml_str = "model:\n  provider: anthropic\n  name: claude-sonnet-4-5\n  \
                        cache_system_prompt: false\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert!(!c.model.cache_system_prompt);
    }

    #[test]
    fn config_cache_system_prompt_omitted_yaml_uses_default() {
        let yaml_str = "model:\n  provider: anthropic\n  name: claude-sonnet-4-5\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert!(c.model.cache_system_prompt);
    }

    #[test]
    fn config_default_caching_enabled_except_extended_ttl() {
        let c = Config::default();
        assert!(c.model.cache_tools);
        assert!(c.model.cache_conversation);
        assert!(c.model.cache_images);
        assert!(c.model.cache_tool_results);
        assert!(!c.model.extended_cache_time);
    }

    #[test]
    fn config_serialises_to_valid_yaml() {
        let c = Config::default();
        let yaml_str = serde_yaml::to_string(&c).unwrap();
        assert!(yaml_str.contains("provider"));
        assert!(yaml_str.contains("openai"));
    }

    #[test]
    fn config_deserialises_from_yaml() {
        let yaml_str =
            "model:\n  provider: anthropic\n  name: claude-opus-4-5\n  max_tokens: 8192\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(c.model.provider, "anthropic");
        assert_eq!(c.model.name, "claude-opus-4-5");
        assert_eq!(c.model.max_tokens, Some(8192));
    }

    #[test]
    fn config_partial_yaml_fills_in_defaults() {
        let yaml_str = "model:\n  name: gpt-4o-mini\n  provider: openai\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(c.model.name, "gpt-4o-mini");
        assert_eq!(
            c.gateway.llm_worker_count,
            GatewayConfig::default().llm_worker_count
        );
    }

    #[test]
    fn gateway_yaml_round_trip() {
        let yaml_str = "gateway:\n  port: 19132\n  queue_max_size: 8\n  dev_mode: true\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(c.gateway.port, 19132);
        assert_eq!(c.gateway.queue_max_size, 8);
        assert!(c.gateway.dev_mode);
        let back_yaml = serde_yaml::to_string(&c).unwrap();
        let back: Config = serde_yaml::from_str(&back_yaml).unwrap();
        assert_eq!(back.gateway.port, 19132);
    }

    // ── providers map ─────────────────────────────────────────────────────────

    #[test]
    fn config_default_providers_is_empty() {
        let c = Config::default();
        assert!(c.providers.is_empty(), "providers must be empty by default");
    }

    #[test]
    fn config_providers_deserialised_from_yaml() {
        let yaml = r#"
providers:
  my_ollama:
    provider: openai
    base_url: http://localhost:11434/v1
    name: llama3.2
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.providers.len(), 1);
        let p = c.providers.get("my_ollama").unwrap();
        assert_eq!(p.provider, "openai");
        assert_eq!(p.base_url.as_deref(), Some("http://localhost:11434/v1"));
        assert_eq!(p.name, "llama3.2");
    }

    #[test]
    fn config_providers_round_trip_yaml() {
        let yaml = r#"
providers:
  local:
    provider: openai
    base_url: http://127.0.0.1:8080/v1
    name: phi-3
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        let serialised = serde_yaml::to_string(&c).unwrap();
        let back: Config = serde_yaml::from_str(&serialised).unwrap();
        let p = back.providers.get("local").unwrap();
        assert_eq!(p.name, "phi-3");
        assert_eq!(p.base_url.as_deref(), Some("http://127.0.0.1:8080/v1"));
    }

    #[test]
    fn config_providers_absent_in_yaml_uses_empty_default() {
        let yaml = "model:\n  provider: openai\n  name: gpt-4o\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(c.providers.is_empty());
    }
}
