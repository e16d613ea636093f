// =============================================================================
// AI Subsystem — provider-agnostic chat completion pipeline
// =============================================================================
//
// The trader hands a prompt to [`AiClient::call`] and gets back the raw
// assistant text. Provider differences (URL shape, auth header, payload
// schema, response extraction, retry classification) are captured by the
// [`Provider`] hook set in `provider.rs`; the retry pipeline in `client.rs`
// is shared by every provider.
// =============================================================================

mod client;
mod provider;

pub use client::{AiCallError, AiClient};
pub use provider::{AnthropicProvider, AttemptFailure, OpenAiProvider, Provider};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

// =============================================================================
// Messages
// =============================================================================

/// Conversation role, OpenAI-chat wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of the conversation sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A tool the model may call, described by JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the tool parameters.
    pub parameters: serde_json::Value,
}

// =============================================================================
// Request
// =============================================================================

/// Full request form carried through the provider hooks.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub stop: Vec<String>,
    pub tools: Vec<ToolSpec>,
    /// Tool-choice policy, e.g. "auto" / "none" / a specific tool name.
    pub tool_choice: Option<String>,
}

impl ChatRequest {
    /// Legacy two-argument form: a system prompt and a user prompt become a
    /// two-message conversation.
    pub fn from_prompts(system_prompt: &str, user_prompt: &str) -> Self {
        Self {
            messages: vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(user_prompt),
            ],
            ..Self::default()
        }
    }
}

// =============================================================================
// Model configuration (db-referenced)
// =============================================================================

/// Persisted AI-model configuration referenced by a trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiModelConfig {
    pub id: String,
    pub user_id: String,
    /// Provider identifier, e.g. "openai", "anthropic", "deepseek".
    pub provider: String,
    /// Opaque credential; never logged in full.
    pub api_key: String,
    pub base_url: Option<String>,
    pub model_name: Option<String>,
    pub enabled: bool,
}

/// Build the provider hook set for a persisted model configuration.
///
/// Unknown providers fall back to OpenAI-compatible behaviour, which is what
/// most aggregator endpoints speak.
pub fn build_provider(cfg: &AiModelConfig) -> Arc<dyn Provider> {
    match cfg.provider.to_ascii_lowercase().as_str() {
        "anthropic" => Arc::new(AnthropicProvider::new(
            cfg.api_key.clone(),
            cfg.base_url.clone(),
            cfg.model_name.clone(),
        )),
        _ => Arc::new(OpenAiProvider::new(
            cfg.api_key.clone(),
            cfg.base_url.clone(),
            cfg.model_name.clone(),
        )),
    }
}

// =============================================================================
// Credential redaction
// =============================================================================

/// Render a credential for logs: at most the first four characters.
pub fn redact_key(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    if key.chars().count() > 4 {
        format!("{prefix}***")
    } else {
        prefix
    }
}
