//! Scriptable in-memory provider for tests and offline development.
//!
//! Queue completions, errors, or moderation verdicts; calls pop them in
//! order. An exhausted queue falls back to the configured default reply.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ChatProvider, ChatRequest, Completion, Moderation, ProviderError, ProviderResult,
};

enum ScriptedCompletion {
    Reply(String),
    Error(String),
}

enum ScriptedModeration {
    Verdict(Moderation),
    Error(String),
}

/// A deterministic [`ChatProvider`] with scripted replies.
#[derive(Default)]
pub struct StubProvider {
    completions: Mutex<VecDeque<ScriptedCompletion>>,
    moderations: Mutex<VecDeque<ScriptedModeration>>,
    default_completion: Mutex<Option<String>>,
    completion_calls: AtomicUsize,
    moderation_calls: AtomicUsize,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a completion reply (builder-style).
    pub fn with_completion(self, content: impl Into<String>) -> Self {
        self.push_completion(content);
        self
    }

    /// Queues a completion failure (builder-style).
    pub fn with_completion_error(self, message: impl Into<String>) -> Self {
        self.completions
            .lock()
            .push_back(ScriptedCompletion::Error(message.into()));
        self
    }

    /// Sets the reply returned once the queue is exhausted.
    pub fn with_default_completion(self, content: impl Into<String>) -> Self {
        *self.default_completion.lock() = Some(content.into());
        self
    }

    /// Queues a moderation verdict (builder-style).
    pub fn with_moderation(self, moderation: Moderation) -> Self {
        self.moderations
            .lock()
            .push_back(ScriptedModeration::Verdict(moderation));
        self
    }

    /// Queues a moderation failure (builder-style).
    pub fn with_moderation_error(self, message: impl Into<String>) -> Self {
        self.moderations
            .lock()
            .push_back(ScriptedModeration::Error(message.into()));
        self
    }

    /// Queues a completion reply on an existing stub.
    pub fn push_completion(&self, content: impl Into<String>) {
        self.completions
            .lock()
            .push_back(ScriptedCompletion::Reply(content.into()));
    }

    /// Number of `complete` calls made so far.
    pub fn completion_calls(&self) -> usize {
        self.completion_calls.load(Ordering::Relaxed)
    }

    /// Number of `moderate` calls made so far.
    pub fn moderation_calls(&self) -> usize {
        self.moderation_calls.load(Ordering::Relaxed)
    }

    fn api_error(&self, message: String) -> ProviderError {
        ProviderError::Api {
            provider: self.name().to_string(),
            status: 500,
            message,
        }
    }
}

#[async_trait]
impl ChatProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: &ChatRequest) -> ProviderResult<Completion> {
        self.completion_calls.fetch_add(1, Ordering::Relaxed);

        let scripted = self.completions.lock().pop_front();
        let content = match scripted {
            Some(ScriptedCompletion::Reply(content)) => content,
            Some(ScriptedCompletion::Error(message)) => return Err(self.api_error(message)),
            None => match self.default_completion.lock().clone() {
                Some(content) => content,
                None => return Err(self.api_error("stub provider has no scripted reply".to_string())),
            },
        };

        Ok(Completion {
            content,
            model: request.model.clone(),
            usage: Default::default(),
            finish_reason: "stop".to_string(),
        })
    }

    async fn moderate(&self, _content: &str) -> ProviderResult<Moderation> {
        self.moderation_calls.fetch_add(1, Ordering::Relaxed);

        match self.moderations.lock().pop_front() {
            Some(ScriptedModeration::Verdict(moderation)) => Ok(moderation),
            Some(ScriptedModeration::Error(message)) => Err(self.api_error(message)),
            None => Ok(Moderation::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatMessage;

    #[tokio::test]
    async fn test_scripted_replies_pop_in_order() {
        let stub = StubProvider::new()
            .with_completion("first")
            .with_completion("second");

        let request = ChatRequest::new(vec![ChatMessage::user("x")]);
        assert_eq!(stub.complete(&request).await.unwrap().content, "first");
        assert_eq!(stub.complete(&request).await.unwrap().content, "second");
        assert!(stub.complete(&request).await.is_err());
        assert_eq!(stub.completion_calls(), 3);
    }

    #[tokio::test]
    async fn test_default_completion_after_queue_drained() {
        let stub = StubProvider::new()
            .with_completion("scripted")
            .with_default_completion("fallback");

        let request = ChatRequest::new(vec![ChatMessage::user("x")]);
        assert_eq!(stub.complete(&request).await.unwrap().content, "scripted");
        assert_eq!(stub.complete(&request).await.unwrap().content, "fallback");
        assert_eq!(stub.complete(&request).await.unwrap().content, "fallback");
    }

    #[tokio::test]
    async fn test_scripted_error() {
        let stub = StubProvider::new().with_completion_error("connection reset");
        let request = ChatRequest::new(vec![ChatMessage::user("x")]);
        let err = stub.complete(&request).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_moderation_defaults_clean() {
        let stub = StubProvider::new();
        let moderation = stub.moderate("anything").await.unwrap();
        assert!(!moderation.flagged);
        assert_eq!(stub.moderation_calls(), 1);
    }
}
