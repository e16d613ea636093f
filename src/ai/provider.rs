// =============================================================================
// Provider Hooks — per-provider variation points for the AI pipeline
// =============================================================================
//
// Every hook has an OpenAI-compatible default; a provider implementation
// overrides only the steps that differ. The retry pipeline in `client.rs`
// drives these hooks and never special-cases a provider.
// =============================================================================

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{ChatRequest, Role};

/// Why a single call attempt failed. Fed to [`Provider::is_retryable`].
#[derive(Debug)]
pub enum AttemptFailure {
    /// Connection-level failure (DNS, refused, reset).
    Transport(String),
    /// The per-call deadline expired; the in-flight request was cancelled.
    Timeout,
    /// The endpoint answered with a non-success status.
    Http { status: StatusCode, body: String },
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Timeout => write!(f, "deadline expired"),
            Self::Http { status, body } => write!(f, "HTTP {status}: {body}"),
        }
    }
}

/// Hook set capturing provider variation. Defaults are OpenAI-compatible.
pub trait Provider: Send + Sync {
    /// Endpoint base, without a trailing slash.
    fn base_url(&self) -> &str;

    /// Credential used by [`Provider::set_auth`].
    fn api_key(&self) -> &str;

    /// Model identifier placed in the request payload.
    fn model(&self) -> &str;

    /// Assemble the structured request payload.
    fn build_request_body(&self, req: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.model(),
            "messages": req.messages,
        });
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(m) = req.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if let Some(p) = req.presence_penalty {
            body["presence_penalty"] = json!(p);
        }
        if let Some(p) = req.frequency_penalty {
            body["frequency_penalty"] = json!(p);
        }
        if !req.stop.is_empty() {
            body["stop"] = json!(req.stop);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(choice) = &req.tool_choice {
            body["tool_choice"] = json!(choice);
        }
        body
    }

    /// Serialise the payload to wire bytes.
    fn marshal(&self, body: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(body).context("failed to marshal request body")
    }

    /// Full request URL.
    fn build_url(&self) -> String {
        format!("{}/chat/completions", self.base_url())
    }

    /// Attach auth (and any provider-specific) headers.
    fn set_auth(&self, headers: &mut HeaderMap) {
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {}", self.api_key())) {
            headers.insert(reqwest::header::AUTHORIZATION, val);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    /// Extract the assistant message content from response bytes.
    fn parse_response(&self, bytes: &[u8]) -> Result<String> {
        let value: Value =
            serde_json::from_slice(bytes).context("response is not valid JSON")?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .context("response missing choices[0].message.content")?;
        Ok(content.to_string())
    }

    /// Whether a failed attempt is worth retrying.
    fn is_retryable(&self, failure: &AttemptFailure) -> bool {
        match failure {
            AttemptFailure::Transport(_) | AttemptFailure::Timeout => true,
            AttemptFailure::Http { status, .. } => {
                *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || status.is_server_error()
            }
        }
    }
}

// =============================================================================
// OpenAI-compatible provider (the default behaviour, unmodified)
// =============================================================================

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";

pub struct OpenAiProvider {
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>, model_name: Option<String>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or_else(|| OPENAI_DEFAULT_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model_name.unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string()),
        }
    }
}

impl Provider for OpenAiProvider {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_key(&self) -> &str {
        &self.api_key
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// =============================================================================
// Anthropic provider — overrides URL, auth, payload and extraction
// =============================================================================

const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>, model_name: Option<String>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model_name.unwrap_or_else(|| ANTHROPIC_DEFAULT_MODEL.to_string()),
        }
    }
}

impl Provider for AnthropicProvider {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_key(&self) -> &str {
        &self.api_key
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn build_url(&self) -> String {
        format!("{}/v1/messages", self.base_url())
    }

    fn set_auth(&self, headers: &mut HeaderMap) {
        if let Ok(val) = HeaderValue::from_str(self.api_key()) {
            headers.insert("x-api-key", val);
        }
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    /// Anthropic keeps the system prompt out of the message list and requires
    /// `max_tokens`.
    fn build_request_body(&self, req: &ChatRequest) -> Value {
        let system: Vec<&str> = req
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let messages: Vec<Value> = req
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::Assistant => "assistant",
                        _ => "user",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model(),
            "max_tokens": req.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        if !req.stop.is_empty() {
            body["stop_sequences"] = json!(req.stop);
        }
        body
    }

    fn parse_response(&self, bytes: &[u8]) -> Result<String> {
        let value: Value =
            serde_json::from_slice(bytes).context("response is not valid JSON")?;
        let content = value["content"][0]["text"]
            .as_str()
            .context("response missing content[0].text")?;
        Ok(content.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ChatMessage, ToolSpec};

    fn sample_request() -> ChatRequest {
        ChatRequest {
            messages: vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("go long?"),
            ],
            temperature: Some(0.3),
            max_tokens: Some(512),
            ..ChatRequest::default()
        }
    }

    #[test]
    fn openai_body_has_chat_completions_shape() {
        let p = OpenAiProvider::new("k".into(), None, Some("gpt-4o-mini".into()));
        let body = p.build_request_body(&sample_request());

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "go long?");
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["max_tokens"], 512);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn openai_body_carries_tools_when_present() {
        let mut req = sample_request();
        req.tools.push(ToolSpec {
            name: "submit_decision".into(),
            description: "final trading decision".into(),
            parameters: serde_json::json!({"type": "object"}),
        });
        req.tool_choice = Some("auto".into());

        let p = OpenAiProvider::new("k".into(), None, None);
        let body = p.build_request_body(&req);
        assert_eq!(body["tools"][0]["function"]["name"], "submit_decision");
        assert_eq!(body["tool_choice"], "auto");
    }

    #[test]
    fn openai_url_appends_chat_completions() {
        let p = OpenAiProvider::new("k".into(), Some("https://proxy.example.com/v1/".into()), None);
        assert_eq!(p.build_url(), "https://proxy.example.com/v1/chat/completions");
    }

    #[test]
    fn openai_parses_choices_content() {
        let p = OpenAiProvider::new("k".into(), None, None);
        let raw = br#"{"choices":[{"message":{"role":"assistant","content":"hold"}}]}"#;
        assert_eq!(p.parse_response(raw).unwrap(), "hold");
    }

    #[test]
    fn openai_rejects_malformed_response() {
        let p = OpenAiProvider::new("k".into(), None, None);
        assert!(p.parse_response(br#"{"choices":[]}"#).is_err());
        assert!(p.parse_response(b"not json").is_err());
    }

    #[test]
    fn anthropic_overrides_url_and_payload() {
        let p = AnthropicProvider::new("k".into(), None, Some("claude-x".into()));
        assert_eq!(p.build_url(), "https://api.anthropic.com/v1/messages");

        let body = p.build_request_body(&sample_request());
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn anthropic_maps_assistant_role() {
        let p = AnthropicProvider::new("k".into(), None, None);
        let mut req = sample_request();
        req.messages.push(ChatMessage::assistant("noted, staying flat"));
        let body = p.build_request_body(&req);
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["messages"][1]["content"], "noted, staying flat");
    }

    #[test]
    fn anthropic_auth_uses_api_key_header() {
        let p = AnthropicProvider::new("secret".into(), None, None);
        let mut headers = HeaderMap::new();
        p.set_auth(&mut headers);
        assert_eq!(headers.get("x-api-key").unwrap(), "secret");
        assert!(headers.get("anthropic-version").is_some());
        assert!(headers.get(reqwest::header::AUTHORIZATION).is_none());
    }

    #[test]
    fn anthropic_parses_content_text() {
        let p = AnthropicProvider::new("k".into(), None, None);
        let raw = br#"{"content":[{"type":"text","text":"wait"}]}"#;
        assert_eq!(p.parse_response(raw).unwrap(), "wait");
    }

    #[test]
    fn retry_classification_defaults() {
        let p = OpenAiProvider::new("k".into(), None, None);
        assert!(p.is_retryable(&AttemptFailure::Transport("reset".into())));
        assert!(p.is_retryable(&AttemptFailure::Timeout));
        assert!(p.is_retryable(&AttemptFailure::Http {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        }));
        assert!(p.is_retryable(&AttemptFailure::Http {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        }));
        assert!(!p.is_retryable(&AttemptFailure::Http {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        }));
        assert!(!p.is_retryable(&AttemptFailure::Http {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        }));
    }
}
