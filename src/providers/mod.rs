//! LLM provider adapters.
//!
//! The [`ChatProvider`] trait is deliberately narrow: a chat completion and
//! a moderation call. Detectors depend only on this trait, so alternate
//! providers can be swapped behind the same interface and tests can inject
//! a scriptable [`stub::StubProvider`].

pub mod openai;
pub mod stub;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use openai::OpenAiProvider;
pub use stub::StubProvider;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default analysis model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors from provider calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed for provider {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("Rate limit exceeded for provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("Provider {provider} timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("Provider {provider} returned {status}: {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Transport error for provider {provider}: {source}")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to parse {provider} response: {message}")]
    Parse { provider: String, message: String },
}

impl ProviderError {
    /// True when a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout { .. } | ProviderError::RateLimited { .. } => true,
            ProviderError::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// One message in a chat exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl ChatRequest {
    /// Request with defaults tuned for fast, deterministic analysis calls.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.1,
            max_tokens: 500,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A chat completion reply.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub usage: HashMap<String, u64>,
    pub finish_reason: String,
}

/// A moderation verdict.
#[derive(Debug, Clone, Default)]
pub struct Moderation {
    pub flagged: bool,
    pub categories: HashMap<String, bool>,
    pub category_scores: HashMap<String, f64>,
}

impl Moderation {
    /// Highest category score, 0.0 when empty.
    pub fn max_score(&self) -> f64 {
        self.category_scores.values().copied().fold(0.0, f64::max)
    }
}

/// Provider availability report.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub available: bool,
    pub error: Option<String>,
    pub latency_ms: Option<u64>,
}

/// Narrow interface over a chat/moderation provider.
///
/// `complete` and `moderate` are I/O-bounded and may suspend; both are
/// bounded by the request timeout and must be safe to cancel.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name for logs and error messages.
    fn name(&self) -> &str;

    /// Generates a chat completion.
    async fn complete(&self, request: &ChatRequest) -> ProviderResult<Completion>;

    /// Evaluates content against the provider's moderation endpoint.
    async fn moderate(&self, content: &str) -> ProviderResult<Moderation>;

    /// Probes availability with a tiny completion.
    async fn health_check(&self) -> ProviderHealth {
        let start = std::time::Instant::now();
        let request = ChatRequest::new(vec![ChatMessage::user("ping")]).with_max_tokens(5);
        match self.complete(&request).await {
            Ok(_) => ProviderHealth {
                available: true,
                error: None,
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            Err(e) => ProviderHealth {
                available: false,
                error: Some(e.to_string()),
                latency_ms: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_defaults() {
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);
        assert_eq!(request.model, DEFAULT_MODEL);
        assert_eq!(request.max_tokens, 500);
        assert_eq!(request.timeout, DEFAULT_TIMEOUT);
        assert!((request.temperature - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn test_moderation_max_score() {
        let mut moderation = Moderation::default();
        assert_eq!(moderation.max_score(), 0.0);
        moderation.category_scores.insert("hate".to_string(), 0.3);
        moderation.category_scores.insert("violence".to_string(), 0.8);
        assert!((moderation.max_score() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Timeout {
            provider: "p".to_string(),
            timeout_ms: 30_000
        }
        .is_retryable());
        assert!(ProviderError::RateLimited {
            provider: "p".to_string(),
            retry_after: None
        }
        .is_retryable());
        assert!(!ProviderError::Auth {
            provider: "p".to_string(),
            message: "bad key".to_string()
        }
        .is_retryable());
        assert!(ProviderError::Api {
            provider: "p".to_string(),
            status: 503,
            message: "unavailable".to_string()
        }
        .is_retryable());
        assert!(!ProviderError::Api {
            provider: "p".to_string(),
            status: 400,
            message: "bad request".to_string()
        }
        .is_retryable());
    }
}
