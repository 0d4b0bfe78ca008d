//! Generic OpenAI-compatible provider.
//! Any backend that speaks `/chat/completions` (OpenAI, Azure-style gateways,
//! local servers) works through this single implementation.

use crate::providers::error::ProviderError;
use crate::providers::traits::{ChatMessage, GenerationOptions, Provider};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A provider that speaks the OpenAI-compatible chat completions API.
pub struct OpenAiCompatibleProvider {
    pub(crate) name: String,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    timeout: Duration,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: &str, base_url: &str, api_key: Option<&str>) -> Self {
        Self::with_timeout(name, base_url, api_key, DEFAULT_REQUEST_TIMEOUT)
    }

    /// `timeout` bounds the whole request; expiry is reported as a transient failure.
    pub fn with_timeout(
        name: &str,
        base_url: &str,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(ToString::to_string),
            timeout,
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(CONNECT_TIMEOUT.min(timeout))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the full URL for chat completions, detecting if base_url already includes the path.
    fn chat_completions_url(&self) -> String {
        let has_full_endpoint = reqwest::Url::parse(&self.base_url)
            .map(|url| {
                url.path()
                    .trim_end_matches('/')
                    .ends_with("/chat/completions")
            })
            .unwrap_or_else(|_| self.base_url.ends_with("/chat/completions"));

        if has_full_endpoint {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    fn models_url(&self) -> String {
        let base = self
            .base_url
            .strip_suffix("/chat/completions")
            .unwrap_or(&self.base_url);
        format!("{base}/models")
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

fn first_choice_text(response: ApiChatResponse) -> Option<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|text| !text.trim().is_empty())
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String, ProviderError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            ProviderError::authentication(
                &self.name,
                "API key not set. Set OPENAI_API_KEY or api_key in config.toml.",
            )
        })?;

        let request = ChatRequest {
            model: &options.model,
            messages: messages
                .iter()
                .map(|m| Message {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let response = self
            .client
            .post(self.chat_completions_url())
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read provider error body>".to_string());
            return Err(ProviderError::from_status(
                &self.name,
                status,
                &super::sanitize_api_error(&body),
            ));
        }

        let chat_response: ApiChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(&self.name, e))?;

        first_choice_text(chat_response).ok_or_else(|| {
            ProviderError::unknown(
                &self.name,
                anyhow::anyhow!("No completion text in response from {}", self.name),
            )
        })
    }

    async fn health_check(&self) -> bool {
        let Some(api_key) = self.api_key.as_ref() else {
            return false;
        };
        self.client
            .get(self.models_url())
            .bearer_auth(api_key)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
