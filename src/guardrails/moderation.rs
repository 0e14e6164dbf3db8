//! Content moderation via a provider moderation endpoint.
//!
//! Maps per-category scores from the provider onto configured block and
//! warn category lists; scores at or above `confidence_threshold` trigger
//! the category's action. Provider unavailability follows `on_error`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::config::{GuardrailSpec, OnError, RuleKind, ValidationRule, validator};
use crate::conversation::Conversation;
use crate::error::Result;
use crate::providers::ChatProvider;
use crate::sanitize;

use super::{Guardrail, GuardrailError, GuardrailResult, GuardrailType, RiskLevel};

fn default_block_categories() -> Vec<String> {
    ["hate", "harassment", "self_harm", "sexual", "violence"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub struct ContentModerationGuardrail {
    name: String,
    enabled: AtomicBool,
    confidence_threshold: f64,
    block_categories: Vec<String>,
    warn_categories: Vec<String>,
    on_error: OnError,
    provider: Option<Arc<dyn ChatProvider>>,
}

impl ContentModerationGuardrail {
    pub fn new(
        name: &str,
        spec: &GuardrailSpec,
        provider: Option<Arc<dyn ChatProvider>>,
    ) -> Result<Self> {
        let mut rules = validator::common_rules();
        rules.push(ValidationRule::optional("block_categories", RuleKind::StrList));
        rules.push(ValidationRule::optional("warn_categories", RuleKind::StrList));
        validator::ConfigValidator::new(rules).validate(&spec.config)?;

        Ok(Self {
            name: name.to_string(),
            enabled: AtomicBool::new(spec.enabled),
            confidence_threshold: spec.config_f64("confidence_threshold").unwrap_or(0.7),
            block_categories: spec
                .config_str_list("block_categories")
                .unwrap_or_else(default_block_categories),
            warn_categories: spec.config_str_list("warn_categories").unwrap_or_default(),
            on_error: spec.on_error.unwrap_or(OnError::Allow),
            provider,
        })
    }

    /// Moderation-provider categories use slashes and hyphens
    /// (`self-harm/intent`); config categories use snake case.
    fn normalize_category(category: &str) -> String {
        category
            .split('/')
            .next()
            .unwrap_or(category)
            .replace('-', "_")
    }

    fn policy_result(&self, reason_suffix: &str, error_detail: &str) -> GuardrailResult {
        let (blocked, reason) = match self.on_error {
            OnError::Block => (true, format!("Content moderation {reason_suffix} - blocking for safety")),
            OnError::Warn => (
                false,
                format!("Content moderation {reason_suffix} - allowing with warning"),
            ),
            OnError::Allow => (false, format!("Content moderation {reason_suffix} - allowing")),
        };

        let result = if blocked {
            GuardrailResult::blocked(&self.name, self.kind(), reason).with_confidence(0.0)
        } else {
            GuardrailResult::allow(&self.name, self.kind(), reason)
        };
        result.with_detail("error", json!(error_detail))
    }
}

#[async_trait]
impl Guardrail for ContentModerationGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GuardrailType {
        GuardrailType::ContentModeration
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    fn config(&self) -> Value {
        json!({
            "name": self.name,
            "type": self.kind().as_str(),
            "enabled": self.is_enabled(),
            "confidence_threshold": self.confidence_threshold,
            "block_categories": self.block_categories,
            "warn_categories": self.warn_categories,
            "on_error": self.on_error.to_string(),
            "available": self.is_available(),
        })
    }

    fn update_config(&mut self, config: &Map<String, Value>) -> std::result::Result<(), GuardrailError> {
        let as_list = |value: &Value| -> Option<Vec<String>> {
            value.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
        };
        if let Some(threshold) = config.get("confidence_threshold").and_then(Value::as_f64) {
            self.confidence_threshold = threshold;
        }
        if let Some(categories) = config.get("block_categories").and_then(|v| as_list(v)) {
            self.block_categories = categories;
        }
        if let Some(categories) = config.get("warn_categories").and_then(|v| as_list(v)) {
            self.warn_categories = categories;
        }
        if let Some(enabled) = config.get("enabled").and_then(Value::as_bool) {
            self.set_enabled(enabled);
        }
        Ok(())
    }

    fn validation_rules(&self) -> Vec<ValidationRule> {
        let mut rules = validator::common_rules();
        rules.push(ValidationRule::optional("block_categories", RuleKind::StrList));
        rules.push(ValidationRule::optional("warn_categories", RuleKind::StrList));
        rules
    }

    #[tracing::instrument(skip(self, content, _conversation), fields(guardrail = %self.name))]
    async fn analyze(
        &self,
        content: &str,
        _conversation: Option<&Conversation>,
    ) -> std::result::Result<GuardrailResult, GuardrailError> {
        if !self.is_enabled() {
            return Ok(GuardrailResult::allow(&self.name, self.kind(), "Guardrail disabled")
                .with_detail("enabled", json!(false)));
        }

        let Some(provider) = &self.provider else {
            return Ok(self.policy_result("unavailable", "API unavailable"));
        };

        let moderation = match provider.moderate(content).await {
            Ok(moderation) => moderation,
            Err(e) => {
                let safe = sanitize::sanitize_message(&e.to_string());
                tracing::error!(guardrail = %self.name, error = %safe, "moderation call failed");
                return Ok(self.policy_result("error", &safe));
            }
        };

        let mut blocked_categories = Vec::new();
        let mut warned_categories = Vec::new();
        let mut max_score: f64 = 0.0;

        for (category, score) in &moderation.category_scores {
            let normalized = Self::normalize_category(category);
            max_score = max_score.max(*score);

            if *score >= self.confidence_threshold {
                if self.block_categories.contains(&normalized) {
                    if !blocked_categories.contains(&normalized) {
                        blocked_categories.push(normalized);
                    }
                } else if self.warn_categories.contains(&normalized)
                    && !warned_categories.contains(&normalized)
                {
                    warned_categories.push(normalized);
                }
            }
        }
        blocked_categories.sort();
        warned_categories.sort();

        let should_block = !blocked_categories.is_empty();
        let reason = if should_block {
            format!(
                "Content blocked due to {} (confidence: {max_score:.2})",
                blocked_categories.join(", ")
            )
        } else if !warned_categories.is_empty() {
            format!(
                "Content flagged for {} (confidence: {max_score:.2})",
                warned_categories.join(", ")
            )
        } else {
            "Content passed moderation checks".to_string()
        };

        let result = GuardrailResult {
            blocked: should_block,
            confidence: max_score,
            reason,
            details: Map::new(),
            guardrail_name: self.name.clone(),
            guardrail_type: self.kind(),
            risk_level: should_block.then_some(RiskLevel::High),
            indicators: None,
        };
        Ok(result
            .with_detail(
                "moderation_result",
                json!({
                    "flagged": moderation.flagged,
                    "categories": moderation.categories,
                    "category_scores": moderation.category_scores,
                }),
            )
            .with_detail("blocked_categories", json!(blocked_categories))
            .with_detail("warned_categories", json!(warned_categories))
            .with_detail("confidence_threshold", json!(self.confidence_threshold)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Moderation, StubProvider};

    fn moderation_with(scores: &[(&str, f64)]) -> Moderation {
        Moderation {
            flagged: scores.iter().any(|(_, s)| *s > 0.5),
            categories: scores.iter().map(|(c, s)| (c.to_string(), *s > 0.5)).collect(),
            category_scores: scores.iter().map(|(c, s)| (c.to_string(), *s)).collect(),
        }
    }

    fn guardrail(provider: Option<Arc<dyn ChatProvider>>, spec: GuardrailSpec) -> ContentModerationGuardrail {
        ContentModerationGuardrail::new("mod", &spec, provider).unwrap()
    }

    fn base_spec() -> GuardrailSpec {
        GuardrailSpec::new("mod", "content_moderation")
    }

    #[tokio::test]
    async fn test_block_category_above_threshold() {
        let stub = StubProvider::new().with_moderation(moderation_with(&[("hate", 0.92), ("violence", 0.1)]));
        let g = guardrail(Some(Arc::new(stub)), base_spec());

        let result = g.analyze("hateful text", None).await.unwrap();
        assert!(result.blocked);
        assert!(result.reason.contains("hate"));
        assert_eq!(result.details["blocked_categories"], json!(["hate"]));
    }

    #[tokio::test]
    async fn test_below_threshold_passes() {
        let stub = StubProvider::new().with_moderation(moderation_with(&[("hate", 0.3)]));
        let g = guardrail(Some(Arc::new(stub)), base_spec());

        let result = g.analyze("borderline text", None).await.unwrap();
        assert!(!result.blocked);
        assert_eq!(result.reason, "Content passed moderation checks");
    }

    #[tokio::test]
    async fn test_warn_categories() {
        let spec = base_spec()
            .with_config("block_categories", json!(["hate"]))
            .with_config("warn_categories", json!(["violence"]));
        let stub = StubProvider::new().with_moderation(moderation_with(&[("violence", 0.85)]));
        let g = guardrail(Some(Arc::new(stub)), spec);

        let result = g.analyze("violent text", None).await.unwrap();
        assert!(!result.blocked);
        assert!(result.reason.contains("flagged for violence"));
        assert_eq!(result.details["warned_categories"], json!(["violence"]));
    }

    #[tokio::test]
    async fn test_provider_category_names_normalized() {
        // OpenAI reports "self-harm/intent"; config uses "self_harm".
        let stub = StubProvider::new().with_moderation(moderation_with(&[("self-harm/intent", 0.95)]));
        let g = guardrail(Some(Arc::new(stub)), base_spec());

        let result = g.analyze("concerning text", None).await.unwrap();
        assert!(result.blocked);
        assert_eq!(result.details["blocked_categories"], json!(["self_harm"]));
    }

    #[tokio::test]
    async fn test_provider_error_applies_on_error_policy() {
        let stub = StubProvider::new().with_moderation_error("service down");
        let g = guardrail(
            Some(Arc::new(stub)),
            base_spec().with_on_error(OnError::Block),
        );
        let result = g.analyze("text", None).await.unwrap();
        assert!(result.blocked);
        assert!(result.reason.contains("blocking for safety"));

        let stub = StubProvider::new().with_moderation_error("service down");
        let g = guardrail(
            Some(Arc::new(stub)),
            base_spec().with_on_error(OnError::Allow),
        );
        let result = g.analyze("text", None).await.unwrap();
        assert!(!result.blocked);
    }

    #[tokio::test]
    async fn test_unavailable_without_provider() {
        let g = guardrail(None, base_spec().with_on_error(OnError::Warn));
        let result = g.analyze("text", None).await.unwrap();
        assert!(!result.blocked);
        assert!(result.reason.contains("unavailable"));
        assert!(!g.is_available());
    }
}
