//! AI-backed detectors with deterministic regex fallback.
//!
//! One [`AiDetector`] implementation covers the PII, toxicity, and
//! code-generation variants; [`AiDetectionKind`] supplies the prompt
//! template, response field names, and the simple detector used when the
//! provider is unavailable or returns something unparseable. AI failure is
//! never hidden: fallback results carry `details.fallback = true` and a
//! reason prefixed with `"AI failed"`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::config::{GuardrailSpec, OnError, ValidationRule, validator};
use crate::conversation::Conversation;
use crate::error::Result;
use crate::providers::{ChatMessage, ChatProvider, ChatRequest};
use crate::sanitize;

use super::code_gen::CodeGenerationGuardrail;
use super::pii::PiiGuardrail;
use super::toxicity::ToxicityGuardrail;
use super::{Guardrail, GuardrailError, GuardrailResult, GuardrailType};

const PII_PROMPT: &str = r#"You are a data privacy specialist. Analyze the following text and identify any Personally Identifiable Information (PII).

PII includes:
- Social Security Numbers (SSN)
- Credit card numbers
- Email addresses
- Phone numbers
- IP addresses
- Driver's license numbers
- Passport numbers
- Bank account numbers

Respond with a JSON object containing:
- "detected": boolean (true if PII detected)
- "pii_types": array of strings (types of PII found)
- "confidence": float (0.0 to 1.0)
- "details": string (brief explanation)

Text to analyze: {content}"#;

const TOXICITY_PROMPT: &str = r#"You are a content safety specialist. Analyze the following text for toxic content.

Toxic content includes:
- Hate speech and discrimination
- Harassment and bullying
- Threats of violence
- Sexual harassment
- Graphic violence

Respond with a JSON object containing:
- "detected": boolean (true if toxic content detected)
- "toxicity_types": array of strings (categories found)
- "confidence": float (0.0 to 1.0)
- "details": string (brief explanation)

Text to analyze: {content}"#;

const CODE_PROMPT: &str = r#"You are a security analyst specializing in code injection detection. Analyze the following text and determine if it contains code generation or injection attempts.

Code generation/injection includes:
- Programming code blocks
- Code snippets and functions
- System commands and scripts
- Database queries
- File operations
- Code execution attempts

Respond with a JSON object containing:
- "detected": boolean (true if code generation detected)
- "code_types": array of strings (types of code found)
- "confidence": float (0.0 to 1.0)
- "details": string (brief explanation)

Text to analyze: {content}"#;

/// Which detection an [`AiDetector`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiDetectionKind {
    Pii,
    Toxicity,
    CodeGeneration,
}

impl AiDetectionKind {
    pub fn guardrail_type(&self) -> GuardrailType {
        match self {
            AiDetectionKind::Pii => GuardrailType::AiPiiDetection,
            AiDetectionKind::Toxicity => GuardrailType::AiToxicityDetection,
            AiDetectionKind::CodeGeneration => GuardrailType::AiCodeGeneration,
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            AiDetectionKind::Pii => "PII",
            AiDetectionKind::Toxicity => "Toxic content",
            AiDetectionKind::CodeGeneration => "Code generation",
        }
    }

    fn categories_field(&self) -> &'static str {
        match self {
            AiDetectionKind::Pii => "pii_types",
            AiDetectionKind::Toxicity => "toxicity_types",
            AiDetectionKind::CodeGeneration => "code_types",
        }
    }

    fn details_key(&self) -> &'static str {
        match self {
            AiDetectionKind::Pii => "detected_pii",
            AiDetectionKind::Toxicity => "detected_toxicity",
            AiDetectionKind::CodeGeneration => "detected_code",
        }
    }

    fn prompt_template(&self) -> &'static str {
        match self {
            AiDetectionKind::Pii => PII_PROMPT,
            AiDetectionKind::Toxicity => TOXICITY_PROMPT,
            AiDetectionKind::CodeGeneration => CODE_PROMPT,
        }
    }

    fn default_threshold(&self) -> f64 {
        match self {
            AiDetectionKind::Pii => 0.8,
            AiDetectionKind::Toxicity => 0.7,
            AiDetectionKind::CodeGeneration => 0.6,
        }
    }

    fn default_on_error(&self) -> OnError {
        match self {
            AiDetectionKind::Pii | AiDetectionKind::Toxicity => OnError::Allow,
            AiDetectionKind::CodeGeneration => OnError::Warn,
        }
    }

    /// Builds the simple detector used as the regex fallback.
    fn build_fallback(
        &self,
        name: &str,
        confidence_threshold: f64,
        on_error: OnError,
    ) -> Result<Box<dyn Guardrail>> {
        let spec = GuardrailSpec::new(name, self.guardrail_type().as_str())
            .with_config("confidence_threshold", json!(confidence_threshold))
            .with_on_error(on_error);
        Ok(match self {
            AiDetectionKind::Pii => Box::new(PiiGuardrail::new(name, &spec)?),
            AiDetectionKind::Toxicity => Box::new(ToxicityGuardrail::new(name, &spec)?),
            AiDetectionKind::CodeGeneration => Box::new(CodeGenerationGuardrail::new(name, &spec)?),
        })
    }
}

/// AI-backed detector that degrades to regex detection when the provider
/// is unavailable or misbehaves.
pub struct AiDetector {
    name: String,
    kind: AiDetectionKind,
    enabled: AtomicBool,
    confidence_threshold: f64,
    on_error: OnError,
    model: String,
    provider: Option<Arc<dyn ChatProvider>>,
}

impl AiDetector {
    pub fn new(
        name: &str,
        kind: AiDetectionKind,
        spec: &GuardrailSpec,
        provider: Option<Arc<dyn ChatProvider>>,
    ) -> Result<Self> {
        validator::ConfigValidator::new(validator::ai_guardrail_rules()).validate(&spec.config)?;

        if provider.is_none() {
            tracing::warn!(
                guardrail = name,
                kind = %kind.guardrail_type(),
                "no provider configured; detector will apply its on_error policy"
            );
        }

        Ok(Self {
            name: name.to_string(),
            kind,
            enabled: AtomicBool::new(spec.enabled),
            confidence_threshold: spec
                .config_f64("confidence_threshold")
                .unwrap_or_else(|| kind.default_threshold()),
            on_error: spec.on_error.unwrap_or_else(|| kind.default_on_error()),
            model: spec
                .config_str("model")
                .unwrap_or(crate::providers::DEFAULT_MODEL)
                .to_string(),
            provider,
        })
    }

    /// Strips markdown code fences that models wrap JSON replies in.
    fn strip_fences(reply: &str) -> &str {
        let trimmed = reply.trim();
        let trimmed = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .unwrap_or(trimmed);
        trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
    }

    fn parse_reply(&self, reply: &str) -> std::result::Result<(bool, Vec<String>, f64), GuardrailError> {
        let value: Value = serde_json::from_str(Self::strip_fences(reply))
            .map_err(|_| GuardrailError::parse("invalid JSON in AI response"))?;

        let detected = value.get("detected").and_then(Value::as_bool).unwrap_or(false);
        let categories = value
            .get(self.kind.categories_field())
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let confidence = value.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);

        Ok((detected, categories, confidence))
    }

    /// Falls back to regex detection, marking the result so callers always
    /// see that AI failed.
    async fn fallback_result(&self, content: &str, error: &str) -> GuardrailResult {
        let sanitized = sanitize::sanitize_message(error);

        let fallback =
            match self
                .kind
                .build_fallback(&self.name, self.confidence_threshold, self.on_error)
            {
                Ok(fallback) => fallback,
                Err(build_err) => {
                    return self.fallback_failed(error, &build_err.to_string());
                }
            };

        match fallback.analyze(content, None).await {
            Ok(mut result) => {
                result.guardrail_type = self.kind.guardrail_type();
                result.reason = format!(
                    "AI failed ({sanitized}), using regex fallback: {}",
                    result.reason
                );
                result
                    .details
                    .insert("fallback".to_string(), json!(true));
                result
                    .details
                    .insert("fallback_reason".to_string(), json!(sanitized));
                result
            }
            Err(fallback_err) => self.fallback_failed(error, &fallback_err.to_string()),
        }
    }

    fn fallback_failed(&self, error: &str, fallback_error: &str) -> GuardrailResult {
        let blocked = self.on_error == OnError::Block;
        let sanitized = sanitize::sanitize_message(error);
        let sanitized_fallback = sanitize::sanitize_message(fallback_error);
        tracing::error!(
            guardrail = %self.name,
            error = %sanitized,
            fallback_error = %sanitized_fallback,
            "AI detection and regex fallback both failed"
        );

        GuardrailResult {
            blocked,
            confidence: 0.0,
            reason: format!(
                "{} detection failed: {sanitized}, fallback failed: {sanitized_fallback}",
                self.kind.display_name()
            ),
            details: Map::new(),
            guardrail_name: self.name.clone(),
            guardrail_type: self.kind.guardrail_type(),
            risk_level: None,
            indicators: None,
        }
        .with_detail("error", json!(sanitized))
        .with_detail("fallback_error", json!(sanitized_fallback))
        .with_detail("method", json!("ai_fallback_failed"))
    }
}

#[async_trait]
impl Guardrail for AiDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GuardrailType {
        self.kind.guardrail_type()
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
            "on_error": self.on_error.to_string(),
            "model": self.model,
            "available": self.is_available(),
        })
    }

    fn update_config(&mut self, config: &Map<String, Value>) -> std::result::Result<(), GuardrailError> {
        if let Some(threshold) = config.get("confidence_threshold").and_then(Value::as_f64) {
            self.confidence_threshold = threshold;
        }
        if let Some(on_error) = config.get("on_error").and_then(Value::as_str) {
            self.on_error = serde_json::from_value(json!(on_error))
                .map_err(|_| GuardrailError::config(format!("invalid on_error '{on_error}'")))?;
        }
        if let Some(enabled) = config.get("enabled").and_then(Value::as_bool) {
            self.set_enabled(enabled);
        }
        Ok(())
    }

    fn validation_rules(&self) -> Vec<ValidationRule> {
        validator::ai_guardrail_rules()
    }

    #[tracing::instrument(skip(self, content, _conversation), fields(guardrail = %self.name))]
    async fn analyze(
        &self,
        content: &str,
        _conversation: Option<&Conversation>,
    ) -> std::result::Result<GuardrailResult, GuardrailError> {
        if !self.is_enabled() {
            return Ok(GuardrailResult::allow(&self.name, self.kind(), "Guardrail disabled")
                .with_detail("method", json!("ai"))
                .with_detail("enabled", json!(false)));
        }

        let Some(provider) = &self.provider else {
            return Ok(GuardrailResult::allow(
                &self.name,
                self.kind(),
                format!("AI {} detection unavailable - no API key", self.kind.display_name()),
            )
            .with_detail("error", json!("no_api_key"))
            .with_detail("method", json!("ai"))
            .with_detail("model", json!("none")));
        };

        let prompt = self.kind.prompt_template().replace("{content}", content);
        let request = ChatRequest::new(vec![
            ChatMessage::system("You are a content safety analyst. Respond only with valid JSON."),
            ChatMessage::user(prompt),
        ])
        .with_model(&self.model);

        let reply = match provider.complete(&request).await {
            Ok(completion) if completion.content.trim().is_empty() => {
                return Ok(self.fallback_result(content, "Empty response from AI model").await);
            }
            Ok(completion) => completion,
            Err(e) => {
                return Ok(self.fallback_result(content, &e.to_string()).await);
            }
        };

        let (detected, categories, confidence) = match self.parse_reply(&reply.content) {
            Ok(parsed) => parsed,
            Err(_) => {
                return Ok(self.fallback_result(content, "Invalid JSON response").await);
            }
        };

        let blocked = detected && confidence >= self.confidence_threshold;
        let reason = if detected {
            let list = if categories.is_empty() {
                "unspecified".to_string()
            } else {
                categories.join(", ")
            };
            format!("{} detected (AI): {list}", self.kind.display_name())
        } else {
            format!("No {} detected (AI)", self.kind.display_name().to_lowercase())
        };

        Ok(GuardrailResult {
            blocked,
            confidence,
            reason,
            details: Map::new(),
            guardrail_name: self.name.clone(),
            guardrail_type: self.kind(),
            risk_level: None,
            indicators: None,
        }
        .with_detail(self.kind.details_key(), json!(categories))
        .with_detail("confidence", json!(confidence))
        .with_detail("method", json!("ai"))
        .with_detail("model", json!(reply.model)))
    }
}
