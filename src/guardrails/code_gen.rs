//! Regex-based code generation detection.
//!
//! Flags content that contains or solicits executable code: code blocks,
//! language constructs, shell commands, and SQL. Used directly as
//! `simple_code_generation` and as the fallback for `ai_code_generation`.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value, json};

use crate::config::{GuardrailSpec, OnError, RuleKind, ValidationRule, validator};
use crate::conversation::Conversation;
use crate::error::Result;

use super::{Guardrail, GuardrailError, GuardrailResult, GuardrailType, RiskLevel};

struct CodeCategory {
    name: &'static str,
    patterns: &'static [&'static str],
}

static CATEGORIES: [CodeCategory; 5] = [
    CodeCategory {
        name: "code_blocks",
        patterns: &[r"```[a-zA-Z]*", r"<script\b", r"</script>"],
    },
    CodeCategory {
        name: "python",
        patterns: &[
            r"\bdef\s+\w+\s*\(",
            r"\bimport\s+(os|sys|subprocess|socket)\b",
            r"\b(eval|exec)\s*\(",
            r"\blambda\s+\w+\s*:",
        ],
    },
    CodeCategory {
        name: "javascript",
        patterns: &[
            r"\bfunction\s+\w+\s*\(",
            r"\b(const|let|var)\s+\w+\s*=",
            r"\brequire\s*\(\s*['\x22]",
            r"=>\s*\{",
        ],
    },
    CodeCategory {
        name: "shell",
        patterns: &[
            r"\brm\s+-rf\b",
            r"\b(curl|wget)\s+https?://",
            r"\bchmod\s+\+?[0-7x]+\b",
            r"\bsudo\s+\w+",
        ],
    },
    CodeCategory {
        name: "sql",
        patterns: &[
            r"(?i)\bselect\s+.+\s+from\s+\w+",
            r"(?i)\bdrop\s+table\b",
            r"(?i)\binsert\s+into\b",
            r"(?i)\bunion\s+select\b",
        ],
    },
];

static COMPILED: Lazy<Vec<(&'static str, Vec<Regex>)>> = Lazy::new(|| {
    CATEGORIES
        .iter()
        .map(|category| {
            let patterns = category
                .patterns
                .iter()
                .map(|p| {
                    RegexBuilder::new(p)
                        .case_insensitive(false)
                        .build()
                        .expect("curated code patterns compile")
                })
                .collect();
            (category.name, patterns)
        })
        .collect()
});

/// Regex-based code generation detection guardrail.
pub struct CodeGenerationGuardrail {
    name: String,
    enabled: AtomicBool,
    enabled_categories: Vec<String>,
    confidence_threshold: f64,
    on_error: OnError,
}

impl CodeGenerationGuardrail {
    pub fn new(name: &str, spec: &GuardrailSpec) -> Result<Self> {
        let mut rules = validator::common_rules();
        rules.push(ValidationRule::optional("categories", RuleKind::StrList));
        validator::ConfigValidator::new(rules).validate(&spec.config)?;

        let known: Vec<&str> = CATEGORIES.iter().map(|c| c.name).collect();
        let requested = spec
            .config_str_list("categories")
            .unwrap_or_else(|| known.iter().map(|s| s.to_string()).collect());

        let mut enabled_categories = Vec::new();
        for category in requested {
            if known.contains(&category.as_str()) {
                enabled_categories.push(category);
            } else {
                tracing::warn!(
                    guardrail = name,
                    category = %category,
                    "unknown code category dropped"
                );
            }
        }

        Ok(Self {
            name: name.to_string(),
            enabled: AtomicBool::new(spec.enabled),
            enabled_categories,
            confidence_threshold: spec.config_f64("confidence_threshold").unwrap_or(0.6),
            on_error: spec.on_error.unwrap_or(OnError::Block),
        })
    }
}

#[async_trait]
impl Guardrail for CodeGenerationGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GuardrailType {
        GuardrailType::SimpleCodeGeneration
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
            "type": self.kind().as_str(),
            "enabled": self.is_enabled(),
            "categories": self.enabled_categories,
            "confidence_threshold": self.confidence_threshold,
            "on_error": self.on_error.to_string(),
        })
    }

    fn update_config(&mut self, config: &Map<String, Value>) -> std::result::Result<(), GuardrailError> {
        if let Some(categories) = config.get("categories").and_then(Value::as_array) {
            self.enabled_categories = categories
                .iter()
                .filter_map(Value::as_str)
                .filter(|c| CATEGORIES.iter().any(|known| known.name == *c))
                .map(str::to_string)
                .collect();
        }
        if let Some(threshold) = config.get("confidence_threshold").and_then(Value::as_f64) {
            self.confidence_threshold = threshold;
        }
        if let Some(enabled) = config.get("enabled").and_then(Value::as_bool) {
            self.set_enabled(enabled);
        }
        Ok(())
    }

    fn validation_rules(&self) -> Vec<ValidationRule> {
        let mut rules = validator::common_rules();
        rules.push(ValidationRule::optional("categories", RuleKind::StrList));
        rules
    }

    async fn analyze(
        &self,
        content: &str,
        _conversation: Option<&Conversation>,
    ) -> std::result::Result<GuardrailResult, GuardrailError> {
        if !self.is_enabled() {
            return Ok(GuardrailResult::allow(&self.name, self.kind(), "Guardrail disabled")
                .with_detail("method", json!("regex"))
                .with_detail("enabled", json!(false)));
        }

        let mut detected = Vec::new();
        let mut confidence_scores = Map::new();

        for (category, patterns) in COMPILED
            .iter()
            .filter(|(name, _)| self.enabled_categories.iter().any(|c| c == name))
        {
            let matches: usize = patterns.iter().map(|p| p.find_iter(content).count()).sum();
            if matches > 0 {
                detected.push(category.to_string());
                confidence_scores.insert(
                    category.to_string(),
                    json!((0.4 + matches as f64 * 0.2).min(0.95)),
                );
            }
        }

        if detected.is_empty() {
            return Ok(GuardrailResult::allow(
                &self.name,
                self.kind(),
                "No code generation detected (regex)",
            )
            .with_detail("detected_code", json!([]))
            .with_detail("confidence_scores", json!({}))
            .with_detail("method", json!("regex")));
        }

        let max_confidence = confidence_scores
            .values()
            .filter_map(Value::as_f64)
            .fold(0.0, f64::max);
        let blocked = max_confidence >= self.confidence_threshold;

        let result = GuardrailResult {
            blocked,
            confidence: max_confidence,
            reason: format!("Code generation detected (regex): {}", detected.join(", ")),
            details: Map::new(),
            guardrail_name: self.name.clone(),
            guardrail_type: self.kind(),
            risk_level: Some(if blocked { RiskLevel::High } else { RiskLevel::Medium }),
            indicators: None,
        };
        Ok(result
            .with_detail("detected_code", json!(detected))
            .with_detail("confidence_scores", Value::Object(confidence_scores))
            .with_detail("method", json!("regex")))
    }
}
