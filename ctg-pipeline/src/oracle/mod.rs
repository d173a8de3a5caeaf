//! Analysis oracle client
//!
//! The oracle is an opaque request/response service: the pipeline hands it
//! prompts and receives text bodies back. This module owns the transport
//! concerns: a global in-process concurrency cap (FIFO semaphore), a hard
//! per-call timeout, retry with backoff on transient failures, and a
//! response-size ceiling.

pub mod prompts;
pub mod response;

use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 8192;
/// Responses above this are truncated and the job fails non-retryably.
const DEFAULT_MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// Oracle client errors
#[derive(Debug, Error)]
pub enum OracleError {
    /// Connection-level failure (reset, DNS, refused)
    #[error("Network error: {0}")]
    Network(String),

    /// Hard per-call timeout elapsed
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// HTTP error response from the API
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Response body exceeded the configured ceiling
    #[error("Response exceeded {0} bytes")]
    ResponseTooLarge(usize),

    /// Body arrived but its structure was not usable
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl OracleError {
    /// 5xx, 429, timeouts, and connection errors are worth retrying; 4xx
    /// and oversized responses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            OracleError::Network(_) | OracleError::Timeout(_) => true,
            OracleError::Api { status, .. } => *status == 429 || *status >= 500,
            OracleError::ResponseTooLarge(_) | OracleError::InvalidResponse(_) => false,
        }
    }
}

/// One oracle request: a system framing plus the user payload.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub system: String,
    pub user: String,
}

/// Token accounting reported by the API
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct OracleUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Oracle reply body plus usage
#[derive(Debug, Clone)]
pub struct OracleResponse {
    pub body: String,
    pub usage: OracleUsage,
}

/// Request/response seam for the analysis workers.
///
/// Production uses [`AnthropicOracle`]; tests substitute scripted
/// implementations.
#[async_trait::async_trait]
pub trait Oracle: Send + Sync {
    async fn call(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError>;
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: OracleUsage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Anthropic Messages API client
pub struct AnthropicOracle {
    http: reqwest::Client,
    api_key: String,
    model: String,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    max_retries: u32,
    max_response_bytes: usize,
}

impl AnthropicOracle {
    pub fn new(
        api_key: String,
        max_concurrent: usize,
        timeout_ms: u64,
        max_retries: u32,
    ) -> Result<Self, OracleError> {
        // The hard timeout is enforced around the whole call; keep the
        // transport timeout slightly wider so ours fires first
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms + 5_000))
            .build()
            .map_err(|e| OracleError::Network(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            timeout: Duration::from_millis(timeout_ms),
            max_retries,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        })
    }

    async fn attempt(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "system": request.system,
            "messages": [{"role": "user", "content": request.user}],
        });

        let send = async {
            let response = self
                .http
                .post(ANTHROPIC_BASE_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        OracleError::Timeout(self.timeout.as_millis() as u64)
                    } else {
                        OracleError::Network(e.to_string())
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(OracleError::Api {
                    status: status.as_u16(),
                    message: message.chars().take(500).collect(),
                });
            }

            let text = response
                .text()
                .await
                .map_err(|e| OracleError::Network(e.to_string()))?;
            if text.len() > self.max_response_bytes {
                return Err(OracleError::ResponseTooLarge(self.max_response_bytes));
            }

            let parsed: MessagesResponse = serde_json::from_str(&text)
                .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;

            let body: String = parsed
                .content
                .iter()
                .filter(|block| block.kind == "text")
                .map(|block| block.text.as_str())
                .collect();
            if body.is_empty() {
                return Err(OracleError::InvalidResponse(
                    "no text content blocks in response".to_string(),
                ));
            }

            Ok(OracleResponse {
                body,
                usage: parsed.usage,
            })
        };

        match tokio::time::timeout(self.timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

#[async_trait::async_trait]
impl Oracle for AnthropicOracle {
    async fn call(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        // FIFO admission: callers past the cap queue here
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| OracleError::Network("oracle client shut down".to_string()))?;

        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.attempt(request).await {
                Ok(response) => {
                    debug!(
                        attempt,
                        input_tokens = response.usage.input_tokens,
                        output_tokens = response.usage.output_tokens,
                        "Oracle call succeeded"
                    );
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay_ms =
                        500u64.saturating_mul(1 << attempt.min(6)) + rand::thread_rng().gen_range(0..250);
                    warn!(attempt, error = %err, delay_ms, "Oracle call failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error
            .unwrap_or_else(|| OracleError::Network("retry budget exhausted".to_string())))
    }
}
