//! `LLMClient`: the boundary between the Check Generator (§4.6) and a
//! language model backend. Generation, retries-on-5xx, and token budgets
//! all live behind this trait so the generator's prompt/response logic
//! never depends on a specific vendor's wire format.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMRequest {
    pub prompt: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

impl LLMRequest {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model_id: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop_sequences: Vec::new(),
        }
    }
}

/// Token accounting returned alongside a completion, used by the
/// orchestrator's §4.7 metrics and by prompt-log capture (§4.11).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: String,
    pub model_id: String,
    #[serde(default)]
    pub usage: LLMUsage,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// A language-model backend. Implementations own their own retry/backoff
/// policy for transport-level failures; `generate` returning `Ok` means a
/// completion was received, not that it parses as a valid Check (that's
/// the generator's job).
pub trait LLMClient: Send + Sync {
    /// # Errors
    ///
    /// Returns [`LLMError`] for transport failures, timeouts, or a
    /// provider-reported error response.
    fn generate(&self, request: &LLMRequest) -> Result<LLMResponse, LLMError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("llm request timed out after {0:?}")]
    Timeout(Duration),

    #[error("llm transport error: {0}")]
    Transport(String),

    #[error("llm provider returned an error: {0}")]
    ProviderError(String),

    #[error("llm response could not be decoded: {0}")]
    Decode(String),
}

/// Default ambient HTTP-backed [`LLMClient`], speaking a generic
/// completions-style JSON contract over a blocking `reqwest::Client`. Hosts
/// that need a vendor-specific wire format provide their own
/// implementation; this one exists so the crate has a working client
/// out of the box.
pub struct HttpLLMClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: Option<String>,
    default_model_id: String,
}

impl HttpLLMClient {
    /// # Errors
    ///
    /// Returns [`LLMError::Transport`] if the underlying HTTP client cannot
    /// be constructed (e.g. TLS backend initialisation failure).
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, default_model_id: impl Into<String>, timeout: Duration) -> Result<Self, LLMError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LLMError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            default_model_id: default_model_id.into(),
        })
    }
}

#[derive(Serialize)]
struct CompletionRequestBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: &'a [String],
}

#[derive(Deserialize)]
struct CompletionResponseBody {
    content: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<CompletionUsageBody>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct CompletionUsageBody {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl LLMClient for HttpLLMClient {
    fn generate(&self, request: &LLMRequest) -> Result<LLMResponse, LLMError> {
        let body = CompletionRequestBody {
            model: request.model_id.as_deref().unwrap_or(&self.default_model_id),
            prompt: &request.prompt,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop: &request.stop_sequences,
        };

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().map_err(|e| {
            if e.is_timeout() {
                LLMError::Timeout(Duration::default())
            } else {
                LLMError::Transport(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().unwrap_or_default();
            return Err(LLMError::ProviderError(format!("{status}: {text}")));
        }

        let parsed: CompletionResponseBody = response.json().map_err(|e| LLMError::Decode(e.to_string()))?;
        Ok(LLMResponse {
            content: parsed.content,
            model_id: parsed.model.unwrap_or_else(|| self.default_model_id.clone()),
            usage: LLMUsage {
                prompt_tokens: parsed.usage.as_ref().map_or(0, |u| u.prompt_tokens),
                completion_tokens: parsed.usage.as_ref().map_or(0, |u| u.completion_tokens),
            },
            stop_reason: parsed.stop_reason,
        })
    }
}

/// A scripted, in-memory [`LLMClient`] for generator/orchestrator tests.
/// Returns successive fixed responses, cycling if more requests arrive
/// than responses were configured — never performs network I/O.
pub struct StubLLMClient {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<LLMResponse, LLMError>>>,
    fallback: LLMResponse,
}

impl StubLLMClient {
    #[must_use]
    pub fn new(responses: Vec<Result<LLMResponse, LLMError>>) -> Self {
        let fallback = LLMResponse {
            content: String::new(),
            model_id: "stub".to_owned(),
            usage: LLMUsage::default(),
            stop_reason: None,
        };
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            fallback,
        }
    }

    #[must_use]
    pub fn with_content(contents: Vec<&str>) -> Self {
        Self::new(
            contents
                .into_iter()
                .map(|c| {
                    Ok(LLMResponse {
                        content: c.to_owned(),
                        model_id: "stub".to_owned(),
                        usage: LLMUsage::default(),
                        stop_reason: Some("stop".to_owned()),
                    })
                })
                .collect(),
        )
    }
}

impl LLMClient for StubLLMClient {
    fn generate(&self, _request: &LLMRequest) -> Result<LLMResponse, LLMError> {
        let mut queue = self.responses.lock().expect("stub llm mutex poisoned");
        match queue.pop_front() {
            Some(result) => result,
            None => Ok(self.fallback.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_client_returns_scripted_responses_in_order() {
        let client = StubLLMClient::with_content(vec!["first", "second"]);
        let req = LLMRequest::new("prompt");
        assert_eq!(client.generate(&req).unwrap().content, "first");
        assert_eq!(client.generate(&req).unwrap().content, "second");
    }

    #[test]
    fn test_stub_client_falls_back_to_empty_when_exhausted() {
        let client = StubLLMClient::with_content(vec!["only"]);
        let req = LLMRequest::new("prompt");
        client.generate(&req).unwrap();
        let fallback = client.generate(&req).unwrap();
        assert_eq!(fallback.content, "");
    }

    #[test]
    fn test_stub_client_can_script_an_error() {
        let client = StubLLMClient::new(vec![Err(LLMError::ProviderError("rate limited".into()))]);
        let req = LLMRequest::new("prompt");
        assert!(client.generate(&req).is_err());
    }
}
