//! LLM gateway: text and JSON completions with retry, refusal detection,
//! and JSON salvage.
//!
//! The gateway is split into a thin `LlmTransport` (one wire round-trip,
//! OpenAI-compatible chat completions) and the `LlmClient` policy layer that
//! owns retries, backoff, the policy preamble, and response validation.
//! Stages never talk to a transport directly.

use crate::error::{truncate_response, LlmError};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum characters of the last raw response carried in errors.
const ERROR_RESPONSE_MAX_CHARS: usize = 500;

/// How far into a response refusal patterns are searched.
const REFUSAL_SCAN_CHARS: usize = 160;

/// Process-wide policy preamble, prepended when `include_policy` is set.
///
/// Threaded through the client options at construction; never a global
/// mutable variable.
const POLICY_PREAMBLE: &str = "\
Ground every answer in the sources provided in the prompt. Do not refuse \
or hedge because of your training cutoff; the provided material is current. \
When JSON is requested, return raw JSON only, with no surrounding prose or \
code fences.";

/// A single chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
}

/// Transport-level failure classification.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Authentication failures are surfaced immediately, never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Anything else (network, 5xx, timeouts) is retryable.
    #[error("transient transport failure: {0}")]
    Transient(String),
}

/// One wire round-trip to an LLM provider.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// Send a chat request and return the assistant message text.
    async fn send(&self, request: &ChatRequest) -> Result<String, TransportError>;
}

/// OpenAI-compatible `/chat/completions` transport.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    fn build_body(request: &ChatRequest) -> Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = Value::from(max_tokens);
        }
        if request.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        body
    }
}

#[async_trait]
impl LlmTransport for HttpTransport {
    async fn send(&self, request: &ChatRequest) -> Result<String, TransportError> {
        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let body = Self::build_body(request);

        debug!(model = request.model.as_str(), "Sending chat completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Transient(format!("body read failed: {e}")))?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TransportError::Auth(format!("HTTP {status}: {text}")));
        }
        if !status.is_success() {
            return Err(TransportError::Transient(format!("HTTP {status}: {text}")));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| TransportError::Transient(format!("invalid response JSON: {e}")))?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        Ok(content)
    }
}

/// Options governing gateway behavior, immutable after construction.
#[derive(Debug, Clone)]
pub struct LlmOptions {
    pub max_retries: u32,
    pub include_policy: bool,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            include_policy: true,
        }
    }
}

/// The LLM gateway used by every pipeline stage.
#[derive(Clone)]
pub struct LlmClient {
    transport: Arc<dyn LlmTransport>,
    options: LlmOptions,
}

fn refusal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(I cannot|I can't|I'm unable to|I am unable to|as an AI)\b")
            .expect("refusal pattern compiles")
    })
}

impl LlmClient {
    pub fn new(transport: Arc<dyn LlmTransport>, options: LlmOptions) -> Self {
        Self { transport, options }
    }

    /// Build a client over the OpenAI-compatible HTTP transport.
    pub fn over_http(endpoint: &str, api_key: &str, options: LlmOptions) -> Self {
        Self::new(Arc::new(HttpTransport::new(endpoint, api_key)), options)
    }

    /// Generate a plain-text completion.
    pub async fn complete_text(
        &self,
        prompt: &str,
        model: &str,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        self.complete_with(prompt, model, temperature, max_tokens, false, |raw| {
            Ok(raw.to_string())
        })
        .await
    }

    /// Generate a completion parsed as a JSON value.
    ///
    /// Parse failures go through the salvage ladder and, when still invalid,
    /// count as a retryable failure.
    pub async fn complete_json(
        &self,
        prompt: &str,
        model: &str,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<Value, LlmError> {
        self.complete_with(prompt, model, temperature, max_tokens, true, salvage_json)
            .await
    }

    /// Shared retry loop: send, validate, back off, repeat.
    async fn complete_with<T>(
        &self,
        prompt: &str,
        model: &str,
        temperature: f64,
        max_tokens: Option<u32>,
        json_mode: bool,
        validate: impl Fn(&str) -> Result<T, String>,
    ) -> Result<T, LlmError> {
        let full_prompt = if self.options.include_policy {
            format!("{POLICY_PREAMBLE}\n\n{prompt}")
        } else {
            prompt.to_string()
        };
        let request = ChatRequest {
            model: model.to_string(),
            prompt: full_prompt,
            temperature,
            max_tokens,
            json_mode,
        };

        let max_attempts = self.options.max_retries.max(1);
        let mut last_response = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let backoff = Duration::from_secs(1 << (attempt - 2));
                debug!(attempt, backoff_secs = backoff.as_secs(), "Backing off before retry");
                tokio::time::sleep(backoff).await;
            }

            let raw = match self.transport.send(&request).await {
                Ok(raw) => raw,
                Err(TransportError::Auth(message)) => {
                    return Err(LlmError::AuthFailed { message });
                }
                Err(TransportError::Transient(message)) => {
                    warn!(attempt, error = message.as_str(), "LLM request failed");
                    last_response = message;
                    continue;
                }
            };

            if raw.trim().is_empty() {
                warn!(attempt, model, "Empty LLM response");
                last_response = raw;
                continue;
            }

            if is_refusal(&raw) {
                warn!(attempt, model, "LLM refusal detected; retrying");
                last_response = raw;
                continue;
            }

            match validate(&raw) {
                Ok(value) => return Ok(value),
                Err(reason) => {
                    warn!(attempt, model, reason = reason.as_str(), "Response validation failed");
                    last_response = raw;
                }
            }
        }

        Err(LlmError::Unavailable {
            attempts: max_attempts,
            last_response: truncate_response(&last_response, ERROR_RESPONSE_MAX_CHARS),
        })
    }
}

/// Whether a response opens with a refusal pattern.
fn is_refusal(raw: &str) -> bool {
    let head: String = raw.trim_start().chars().take(REFUSAL_SCAN_CHARS).collect();
    refusal_regex().is_match(&head)
}

/// Parse JSON out of a raw model response.
///
/// Salvage order: raw parse; strip a single fenced block; largest balanced
/// `{...}` or `[...]` substring.
fn salvage_json(raw: &str) -> Result<Value, String> {
    let trimmed = raw.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(inner) = strip_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(inner) {
            return Ok(value);
        }
    }

    if let Some(candidate) = largest_balanced_region(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Ok(value);
        }
    }

    Err("no parseable JSON found in response".to_string())
}

/// Extract the body of a single ```-fenced block, tolerating a language tag.
fn strip_fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// Find the largest balanced `{...}` or `[...]` region in the text.
///
/// Tracks string literals and escapes so that braces inside strings do not
/// affect the depth count.
fn largest_balanced_region(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;

    let mut index = 0;
    while index < bytes.len() {
        let open = bytes[index];
        if open != b'{' && open != b'[' {
            index += 1;
            continue;
        }
        let close = if open == b'{' { b'}' } else { b']' };

        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;
        for (offset, &byte) in bytes[index..].iter().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match byte {
                b'\\' if in_string => escaped = true,
                b'"' => in_string = !in_string,
                _ if in_string => {}
                b if b == open => depth += 1,
                b if b == close => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(index + offset + 1);
                        break;
                    }
                }
                _ => {}
            }
        }

        if let Some(end) = end {
            let len = end - index;
            if best.map(|(s, e)| e - s).unwrap_or(0) < len {
                best = Some((index, end));
            }
            index = end;
        } else {
            index += 1;
        }
    }

    best.map(|(start, end)| &text[start..end])
}
