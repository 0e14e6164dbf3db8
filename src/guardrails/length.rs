//! Content length guardrail.
//!
//! Enforces `min_length` and/or `max_length` on the byte length of the
//! UTF-8 encoding.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::config::{GuardrailSpec, OnError, RuleKind, ValidationRule, validator};
use crate::conversation::Conversation;
use crate::error::Result;

use super::{Guardrail, GuardrailError, GuardrailResult, GuardrailType, RiskLevel};

pub struct LengthGuardrail {
    name: String,
    enabled: AtomicBool,
    min_length: Option<usize>,
    max_length: Option<usize>,
    on_error: OnError,
}

impl LengthGuardrail {
    pub fn new(name: &str, spec: &GuardrailSpec) -> Result<Self> {
        let mut rules = validator::common_rules();
        rules.push(ValidationRule::optional(
            "min_length",
            RuleKind::Int { min: Some(0), max: None },
        ));
        rules.push(ValidationRule::optional(
            "max_length",
            RuleKind::Int { min: Some(0), max: None },
        ));
        validator::ConfigValidator::new(rules).validate(&spec.config)?;

        Ok(Self {
            name: name.to_string(),
            enabled: AtomicBool::new(spec.enabled),
            min_length: spec.config_u64("min_length").map(|n| n as usize),
            max_length: spec.config_u64("max_length").map(|n| n as usize),
            on_error: spec.on_error.unwrap_or(OnError::Warn),
        })
    }
}

#[async_trait]
impl Guardrail for LengthGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GuardrailType {
        GuardrailType::Length
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn config(&self) -> Value {
        json!({
            "name": self.name,
            "type": GuardrailType::Length.as_str(),
            "enabled": self.is_enabled(),
            "min_length": self.min_length,
            "max_length": self.max_length,
            "on_error": self.on_error.to_string(),
        })
    }

    fn update_config(&mut self, config: &Map<String, Value>) -> std::result::Result<(), GuardrailError> {
        if let Some(min) = config.get("min_length").and_then(Value::as_u64) {
            self.min_length = Some(min as usize);
        }
        if let Some(max) = config.get("max_length").and_then(Value::as_u64) {
            self.max_length = Some(max as usize);
        }
        if let Some(enabled) = config.get("enabled").and_then(Value::as_bool) {
            self.set_enabled(enabled);
        }
        Ok(())
    }

    fn validation_rules(&self) -> Vec<ValidationRule> {
        let mut rules = validator::common_rules();
        rules.push(ValidationRule::optional(
            "min_length",
            RuleKind::Int { min: Some(0), max: None },
        ));
        rules.push(ValidationRule::optional(
            "max_length",
            RuleKind::Int { min: Some(0), max: None },
        ));
        rules
    }

    async fn analyze(
        &self,
        content: &str,
        _conversation: Option<&Conversation>,
    ) -> std::result::Result<GuardrailResult, GuardrailError> {
        if !self.is_enabled() {
            return Ok(GuardrailResult::allow(&self.name, self.kind(), "Guardrail disabled")
                .with_detail("enabled", json!(false)));
        }

        let length = content.len();

        if let Some(max) = self.max_length
            && length > max
        {
            return Ok(GuardrailResult::blocked(
                &self.name,
                self.kind(),
                format!("Content too long: {length} bytes > {max} bytes"),
            )
            .with_detail("length", json!(length))
            .with_detail("max_length", json!(max))
            .with_risk_level(RiskLevel::Medium));
        }

        if let Some(min) = self.min_length
            && length < min
        {
            return Ok(GuardrailResult::blocked(
                &self.name,
                self.kind(),
                format!("Content too short: {length} bytes < {min} bytes"),
            )
            .with_detail("length", json!(length))
            .with_detail("min_length", json!(min))
            .with_risk_level(RiskLevel::Low));
        }

        Ok(GuardrailResult::allow(&self.name, self.kind(), "Content length within limits")
            .with_detail("length", json!(length)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrail(min: Option<u64>, max: Option<u64>) -> LengthGuardrail {
        let mut spec = GuardrailSpec::new("len", "length");
        if let Some(min) = min {
            spec = spec.with_config("min_length", json!(min));
        }
        if let Some(max) = max {
            spec = spec.with_config("max_length", json!(max));
        }
        LengthGuardrail::new("len", &spec).unwrap()
    }

    #[tokio::test]
    async fn test_within_limits() {
        let g = guardrail(Some(1), Some(100));
        assert!(!g.analyze("hello", None).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_too_long() {
        let g = guardrail(None, Some(5));
        let result = g.analyze("this is too long", None).await.unwrap();
        assert!(result.blocked);
        assert!(result.reason.contains("too long"));
    }

    #[tokio::test]
    async fn test_too_short() {
        let g = guardrail(Some(10), None);
        let result = g.analyze("tiny", None).await.unwrap();
        assert!(result.blocked);
        assert!(result.reason.contains("too short"));
    }

    #[tokio::test]
    async fn test_byte_length_not_char_count() {
        // "héllo" is 5 chars but 6 bytes.
        let g = guardrail(None, Some(5));
        assert!(g.analyze("héllo", None).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_boundary_values_pass() {
        let g = guardrail(Some(5), Some(5));
        assert!(!g.analyze("exact", None).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_no_limits_configured() {
        let g = guardrail(None, None);
        assert!(!g.analyze("anything goes", None).await.unwrap().blocked);
    }
}
