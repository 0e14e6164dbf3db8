//! OpenAI-compatible provider adapter.
//!
//! Talks to any endpoint implementing the OpenAI chat-completions and
//! moderations APIs. Every call is bounded by the request timeout.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{
    ChatProvider, ChatRequest, Completion, DEFAULT_TIMEOUT, Moderation, ProviderError,
    ProviderResult,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODERATION_MODEL: &str = "omni-moderation-latest";

/// OpenAI-compatible chat and moderation provider.
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    moderation_model: String,
}

impl OpenAiProvider {
    /// Creates a provider against the default OpenAI base URL.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Creates a provider against a custom base URL (proxies, compatible
    /// endpoints, test servers).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            moderation_model: DEFAULT_MODERATION_MODEL.to_string(),
        }
    }

    /// Overrides the moderation model.
    pub fn with_moderation_model(mut self, model: impl Into<String>) -> Self {
        self.moderation_model = model.into();
        self
    }

    async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> ProviderResult<R> {
        let url = format!("{}{path}", self.base_url);

        let send = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send();

        let response = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| ProviderError::Timeout {
                provider: self.name().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| ProviderError::Transport {
                provider: self.name().to_string(),
                source: e,
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Auth {
                provider: self.name().to_string(),
                message: "Invalid API key".to_string(),
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(ProviderError::RateLimited {
                provider: self.name().to_string(),
                retry_after,
            });
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::Api {
                provider: self.name().to_string(),
                status: status.as_u16(),
                message,
            });
        }

        response.json().await.map_err(|e| ProviderError::Parse {
            provider: self.name().to_string(),
            message: e.to_string(),
        })
    }
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [super::ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    model: String,
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct ModerationBody<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Deserialize)]
struct ModerationResult {
    flagged: bool,
    #[serde(default)]
    categories: HashMap<String, bool>,
    #[serde(default)]
    category_scores: HashMap<String, Option<f64>>,
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    #[tracing::instrument(skip(self, request), fields(provider = "openai", model = %request.model))]
    async fn complete(&self, request: &ChatRequest) -> ProviderResult<Completion> {
        let body = CompletionBody {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let api_response: CompletionResponse = self
            .post_json("/chat/completions", &body, request.timeout)
            .await?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Parse {
                provider: self.name().to_string(),
                message: "response contained no choices".to_string(),
            })?;

        let usage = api_response
            .usage
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(k, v)| v.as_u64().map(|n| (k, n)))
            .collect();

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            model: api_response.model,
            usage,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    #[tracing::instrument(skip(self, content), fields(provider = "openai", content_len = content.len()))]
    async fn moderate(&self, content: &str) -> ProviderResult<Moderation> {
        let body = ModerationBody {
            input: content,
            model: &self.moderation_model,
        };

        let api_response: ModerationResponse = self
            .post_json("/moderations", &body, DEFAULT_TIMEOUT)
            .await?;

        let result = api_response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Parse {
                provider: self.name().to_string(),
                message: "moderation response contained no results".to_string(),
            })?;

        let category_scores = result
            .category_scores
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or(0.0)))
            .collect();

        Ok(Moderation {
            flagged: result.flagged,
            categories: result.categories,
            category_scores,
        })
    }
}
