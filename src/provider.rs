use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{FinishReason, NormalizedRequest, NormalizedResponse, TokenUsage};

const MAX_ERROR_BODY_BYTES: usize = 16 * 1024;

/// Credential used for one outbound call. `Byok` carries the user's own
/// decrypted secret and must never outlive the call path.
#[derive(Clone, Copy)]
pub enum ProviderAuth<'a> {
    /// Platform credentials configured into the adapter.
    Platform,
    Byok(&'a str),
}

impl std::fmt::Debug for ProviderAuth<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderAuth::Platform => f.write_str("Platform"),
            ProviderAuth::Byok(_) => f.write_str("Byok(<redacted>)"),
        }
    }
}

/// Classified provider failure. Transient errors advance the fallback
/// loop; fatal errors abort it, since retrying a malformed or
/// unauthorized request elsewhere will not help.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider error: {message}")]
    Transient { message: String },
    #[error("provider call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("fatal provider error: {message}")]
    Fatal { message: String },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderError::Fatal { .. })
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("status {status}: {body}");
        if status.as_u16() == 408
            || status.as_u16() == 429
            || status.is_server_error()
        {
            ProviderError::Transient { message }
        } else {
            ProviderError::Fatal { message }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProbeReport {
    pub latency_ms: u64,
}

/// One adapter per provider family. The router and health monitor depend
/// only on this interface.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    async fn call(
        &self,
        request: &NormalizedRequest,
        auth: ProviderAuth<'_>,
    ) -> Result<NormalizedResponse, ProviderError>;

    /// Lightweight liveness check used by the health monitor and by BYOK
    /// key validation. Must be cheap and must not consume user quota.
    async fn probe(&self, auth: ProviderAuth<'_>) -> Result<ProbeReport, ProviderError>;
}

/// HTTP adapter for OpenAI-compatible chat endpoints.
#[derive(Clone)]
pub struct HttpProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    headers: BTreeMap<String, String>,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("headers", &"<redacted>")
            .finish()
    }
}

impl HttpProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProviderError::Fatal {
                message: format!("http client init failed: {err}"),
            })?;
        Ok(Self {
            id: id.into(),
            base_url: base_url.into(),
            api_key,
            client,
            headers: BTreeMap::new(),
        })
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn bearer<'a>(&'a self, auth: ProviderAuth<'a>) -> Option<&'a str> {
        match auth {
            ProviderAuth::Byok(secret) => Some(secret),
            ProviderAuth::Platform => self.api_key.as_deref(),
        }
    }

    fn map_send_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout { timeout_ms: 0 }
        } else if err.is_connect() || err.is_request() {
            ProviderError::Transient {
                message: format!("request failed: {err}"),
            }
        } else {
            ProviderError::Transient {
                message: format!("http error: {err}"),
            }
        }
    }
}

#[derive(serde::Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [crate::types::Message],
    max_tokens: u32,
}

#[derive(serde::Deserialize)]
struct ChatCompletionReply {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(serde::Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(serde::Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn parse_finish_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn call(
        &self,
        request: &NormalizedRequest,
        auth: ProviderAuth<'_>,
    ) -> Result<NormalizedResponse, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = ChatCompletionBody {
            model: &request.model_id,
            messages: &request.messages,
            max_tokens: request.max_tokens,
        };

        let mut req = self.client.post(&url).json(&body);
        if let Some(token) = self.bearer(auth) {
            req = req.bearer_auth(token);
        }
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }

        let response = req.send().await.map_err(Self::map_send_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = truncate(&body, MAX_ERROR_BODY_BYTES);
            return Err(ProviderError::from_status(status, body));
        }

        let reply: ChatCompletionReply =
            response.json().await.map_err(|err| ProviderError::Fatal {
                message: format!("response decode error: {err}"),
            })?;

        let choice = reply.choices.into_iter().next().ok_or(ProviderError::Fatal {
            message: "response contained no choices".to_string(),
        })?;
        let usage = reply.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });

        Ok(NormalizedResponse {
            content: choice.message.content,
            usage: usage.unwrap_or_default(),
            finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
        })
    }

    async fn probe(&self, auth: ProviderAuth<'_>) -> Result<ProbeReport, ProviderError> {
        let url = format!("{}/v1/models", self.base_url.trim_end_matches('/'));
        let mut req = self.client.get(&url);
        if let Some(token) = self.bearer(auth) {
            req = req.bearer_auth(token);
        }

        let started = std::time::Instant::now();
        let response = req.send().await.map_err(Self::map_send_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = truncate(&body, MAX_ERROR_BODY_BYTES);
            return Err(ProviderError::from_status(status, body));
        }

        Ok(ProbeReport {
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn truncate(body: &str, max_bytes: usize) -> &str {
    if body.len() <= max_bytes {
        return body;
    }
    let mut end = max_bytes;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
