//! Concrete `LlmPort` implementation, talking to the Anthropic Messages API
//! over HTTP.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::LLMUnavailable;
use crate::prompt::LlmPort;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    system: &'a str,
    max_tokens: u32,
    messages: Vec<RequestMessage<'a>>,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Talks to the Anthropic Messages API. One client is shared across every
/// template invocation; `model_id`/`system_role` come from the template
/// being rendered, not from this struct.
#[derive(Clone)]
pub struct AnthropicLlmClient {
    http: reqwest::Client,
    api_key: String,
}

impl AnthropicLlmClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()?,
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl LlmPort for AnthropicLlmClient {
    async fn complete(&self, model_id: &str, system_role: &str, prompt: &str) -> Result<String, LLMUnavailable> {
        let request = MessageRequest {
            model: model_id,
            system: system_role,
            max_tokens: DEFAULT_MAX_TOKENS,
            messages: vec![RequestMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .http
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| LLMUnavailable {
                provider_status: "request_failed".to_string(),
                retry_hint: Some("check network connectivity to the LLM provider".to_string()),
                diagnostic_id: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(LLMUnavailable {
                provider_status: status.to_string(),
                retry_hint: if status.as_u16() == 429 || status.is_server_error() {
                    Some("retry with backoff".to_string())
                } else {
                    None
                },
                diagnostic_id: reason,
            });
        }

        let parsed: MessageResponse = response.json().await.map_err(|e| LLMUnavailable {
            provider_status: "invalid_response_body".to_string(),
            retry_hint: None,
            diagnostic_id: e.to_string(),
        })?;

        let text = parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| LLMUnavailable {
                provider_status: "empty_response".to_string(),
                retry_hint: None,
                diagnostic_id: "no text content block in the LLM response".to_string(),
            })?;

        Ok(text)
    }
}
