// =============================================================================
// AI Client — retryable request pipeline over the provider hook set
// =============================================================================
//
// One attempt = build body -> marshal -> POST with deadline -> classify.
// Authentication rejections (401/403) are terminal on first sight; anything
// the provider classifies as retryable gets a fixed bounded wait, up to
// `max_retries` retries after the initial attempt. A deadline expiry counts
// as one attempt.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::provider::{AttemptFailure, Provider};
use super::{redact_key, ChatRequest};

/// Default per-call deadline.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Default fixed wait between attempts.
const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(2);
/// Default number of retries after the initial attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Terminal outcome of a call, after retries.
#[derive(Debug, thiserror::Error)]
pub enum AiCallError {
    #[error("authentication rejected with HTTP {status}")]
    AuthRejected { status: StatusCode },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("model response unusable: {0}")]
    InvalidResponse(String),

    #[error("request could not be built: {0}")]
    BadRequest(String),
}

/// Provider-agnostic chat client.
pub struct AiClient {
    provider: Arc<dyn Provider>,
    http: reqwest::Client,
    max_retries: u32,
    retry_wait: Duration,
    call_timeout: Duration,
}

impl AiClient {
    /// Create a client with a default HTTP client.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("failed to build reqwest client for AiClient");
        Self::with_client(provider, http)
    }

    /// Create a client that re-uses an existing HTTP client.
    pub fn with_client(provider: Arc<dyn Provider>, http: reqwest::Client) -> Self {
        debug!(
            url = %provider.build_url(),
            model = provider.model(),
            api_key = %redact_key(provider.api_key()),
            "AiClient initialised"
        );
        Self {
            provider,
            http,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_wait: DEFAULT_RETRY_WAIT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Number of retries after the initial attempt. Zero means a single
    /// attempt with any error terminal.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = wait;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    /// Legacy two-argument form: system prompt + user prompt.
    pub async fn call(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, AiCallError> {
        self.call_request(&ChatRequest::from_prompts(system_prompt, user_prompt))
            .await
    }

    /// Full request form. Returns the assistant message text.
    pub async fn call_request(&self, req: &ChatRequest) -> Result<String, AiCallError> {
        let total_attempts = self.max_retries + 1;
        let mut last_failure = String::from("no attempts made");

        for attempt in 1..=total_attempts {
            match self.attempt(req).await {
                Ok(text) => {
                    debug!(attempt, chars = text.len(), "model call succeeded");
                    return Ok(text);
                }
                Err(AttemptOutcome::Terminal(err)) => return Err(err),
                Err(AttemptOutcome::Failed(failure)) => {
                    let retryable = self.provider.is_retryable(&failure);
                    warn!(
                        attempt,
                        total_attempts,
                        retryable,
                        failure = %failure,
                        "model call attempt failed"
                    );
                    last_failure = failure.to_string();
                    if !retryable {
                        break;
                    }
                    if attempt < total_attempts {
                        tokio::time::sleep(self.retry_wait).await;
                    }
                }
            }
        }

        Err(AiCallError::RetriesExhausted {
            attempts: total_attempts,
            last: last_failure,
        })
    }

    // -------------------------------------------------------------------------
    // Single attempt
    // -------------------------------------------------------------------------

    async fn attempt(&self, req: &ChatRequest) -> Result<String, AttemptOutcome> {
        let body = self.provider.build_request_body(req);
        let bytes = self
            .provider
            .marshal(&body)
            .map_err(|e| AttemptOutcome::Terminal(AiCallError::BadRequest(e.to_string())))?;

        let mut headers = HeaderMap::new();
        self.provider.set_auth(&mut headers);

        let response = self
            .http
            .post(self.provider.build_url())
            .headers(headers)
            .body(bytes)
            .timeout(self.call_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AttemptOutcome::Failed(AttemptFailure::Timeout)
                } else {
                    AttemptOutcome::Failed(AttemptFailure::Transport(e.to_string()))
                }
            })?;

        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(
                status = %status,
                api_key = %redact_key(self.provider.api_key()),
                "model endpoint rejected credentials"
            );
            return Err(AttemptOutcome::Terminal(AiCallError::AuthRejected { status }));
        }

        let raw = response.bytes().await.map_err(|e| {
            AttemptOutcome::Failed(AttemptFailure::Transport(e.to_string()))
        })?;

        if !status.is_success() {
            let body_text = String::from_utf8_lossy(&raw).chars().take(200).collect();
            return Err(AttemptOutcome::Failed(AttemptFailure::Http {
                status,
                body: body_text,
            }));
        }

        self.provider
            .parse_response(&raw)
            .map_err(|e| AttemptOutcome::Terminal(AiCallError::InvalidResponse(e.to_string())))
    }
}

enum AttemptOutcome {
    /// The attempt failed in a way the provider may classify as retryable.
    Failed(AttemptFailure),
    /// The call must not be retried.
    Terminal(AiCallError),
}

impl std::fmt::Debug for AiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiClient")
            .field("url", &self.provider.build_url())
            .field("model", &self.provider.model())
            .field("api_key", &redact_key(self.provider.api_key()))
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

// =============================================================================
// Tests — scripted local HTTP endpoint, no real network
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::OpenAiProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Read until the request head and its content-length body are complete.
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
            let text = String::from_utf8_lossy(&buf);
            let Some(head_end) = text.find("\r\n\r\n") else {
                continue;
            };
            let content_length = text
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + content_length {
                return;
            }
        }
    }

    /// Serve one scripted HTTP/1.1 response per connection, counting requests.
    async fn scripted_server(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                read_request(&mut socket).await;
                hits_clone.fetch_add(1, Ordering::SeqCst);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}"), hits)
    }

    fn http_503() -> String {
        "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
            .to_string()
    }

    fn http_401() -> String {
        "HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string()
    }

    fn http_200_completion(content: &str) -> String {
        let body = format!(
            r#"{{"choices":[{{"message":{{"role":"assistant","content":"{content}"}}}}]}}"#
        );
        format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    fn client_for(base: &str, max_retries: u32) -> AiClient {
        let provider = Arc::new(OpenAiProvider::new(
            "sk-test-key".into(),
            Some(base.to_string()),
            Some("test-model".into()),
        ));
        AiClient::new(provider)
            .with_max_retries(max_retries)
            .with_retry_wait(Duration::from_millis(1))
            .with_call_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn three_503s_then_200_succeeds_with_three_retries() {
        let (base, hits) = scripted_server(vec![
            http_503(),
            http_503(),
            http_503(),
            http_200_completion("open_long"),
        ])
        .await;

        let client = client_for(&base, 3);
        let text = client.call("sys", "user").await.unwrap();
        assert_eq!(text, "open_long");
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn three_503s_exhaust_two_retries() {
        let (base, hits) = scripted_server(vec![
            http_503(),
            http_503(),
            http_503(),
            http_200_completion("never reached"),
        ])
        .await;

        let client = client_for(&base, 2);
        let err = client.call("sys", "user").await.unwrap_err();
        assert!(err.to_string().contains("retries exhausted"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let (base, hits) = scripted_server(vec![http_503(), http_200_completion("x")]).await;

        let client = client_for(&base, 0);
        let err = client.call("sys", "user").await.unwrap_err();
        assert!(matches!(err, AiCallError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_failure_is_terminal_without_retry() {
        let (base, hits) =
            scripted_server(vec![http_401(), http_200_completion("never reached")]).await;

        let client = client_for(&base, 3);
        let err = client.call("sys", "user").await.unwrap_err();
        assert!(matches!(err, AiCallError::AuthRejected { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_success_body_is_invalid_response() {
        let body = r#"{"unexpected":true}"#;
        let resp = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let (base, _) = scripted_server(vec![resp]).await;

        let client = client_for(&base, 3);
        let err = client.call("sys", "user").await.unwrap_err();
        assert!(matches!(err, AiCallError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn connection_refused_is_retried_then_exhausted() {
        // Nothing listens on the discard port.
        let client = client_for("http://127.0.0.1:1", 1);
        let err = client.call("sys", "user").await.unwrap_err();
        assert!(matches!(err, AiCallError::RetriesExhausted { attempts: 2, .. }));
    }
}
