//! Regex-based toxicity detection.
//!
//! Curated pattern lists per category. Confidence grows with match count;
//! blocking happens when the highest per-category confidence crosses the
//! threshold.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value, json};

use crate::config::{GuardrailSpec, OnError, RuleKind, ValidationRule, validator};
use crate::conversation::Conversation;
use crate::error::Result;

use super::{Guardrail, GuardrailError, GuardrailResult, GuardrailType, RiskLevel};

struct ToxicityCategory {
    name: &'static str,
    patterns: &'static [&'static str],
}

static CATEGORIES: [ToxicityCategory; 5] = [
    ToxicityCategory {
        name: "hate_speech",
        patterns: &[
            r"\b(nazi|fascist|racist|bigot)\b",
            r"\b(kill\s+all|exterminate|genocide|ethnic\s+cleansing)\b",
            r"\b(white\s+supremacy|master\s+race)\b",
        ],
    },
    ToxicityCategory {
        name: "harassment",
        patterns: &[
            r"\b(stalk|harass|bully|intimidate)\b",
            r"\byou\s+suck\b",
            r"\byou('|’)?re\s+(stupid|worthless|ugly|pathetic)\b",
            r"\b(go\s+die|kill\s+yourself)\b",
        ],
    },
    ToxicityCategory {
        name: "threats",
        patterns: &[
            r"\bi\s+(will|am\s+going\s+to)\s+(kill|hurt|destroy)\b",
            r"\byou\s+will\s+(die|pay|regret)\b",
            r"\bi\s+(hope\s+you\s+die|wish\s+you\s+were\s+dead)\b",
        ],
    },
    ToxicityCategory {
        name: "sexual_harassment",
        patterns: &[
            r"\b(rape|molest|grope)\b",
            r"\bsend\s+(me\s+)?(nudes|pics)\b",
            r"\b(sexual|explicit)\b.*\b(harass|assault|abuse)\b",
        ],
    },
    ToxicityCategory {
        name: "violence",
        patterns: &[
            r"\b(punch|beat\s+up|attack)\s+(him|her|them|you)\b",
            r"\b(shoot|bomb|explode)\b",
            r"\b(murder|assassinate|execute|lynch)\b",
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
                        .case_insensitive(true)
                        .build()
                        .expect("curated toxicity patterns compile")
                })
                .collect();
            (category.name, patterns)
        })
        .collect()
});

/// Regex-based toxicity detection guardrail.
pub struct ToxicityGuardrail {
    name: String,
    enabled: AtomicBool,
    enabled_categories: Vec<String>,
    confidence_threshold: f64,
    on_error: OnError,
}

impl ToxicityGuardrail {
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
                    "unknown toxicity category dropped"
                );
            }
        }

        Ok(Self {
            name: name.to_string(),
            enabled: AtomicBool::new(spec.enabled),
            enabled_categories,
            confidence_threshold: spec.config_f64("confidence_threshold").unwrap_or(0.7),
            on_error: spec.on_error.unwrap_or(OnError::Block),
        })
    }
}

#[async_trait]
impl Guardrail for ToxicityGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GuardrailType {
        GuardrailType::SimpleToxicityDetection
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
                    json!((0.3 + matches as f64 * 0.2).min(0.95)),
                );
            }
        }

        if detected.is_empty() {
            return Ok(GuardrailResult::allow(
                &self.name,
                self.kind(),
                "No toxic content detected (regex)",
            )
            .with_detail("detected_toxicity", json!([]))
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
            reason: format!("Toxic content detected (regex): {}", detected.join(", ")),
            details: Map::new(),
            guardrail_name: self.name.clone(),
            guardrail_type: self.kind(),
            risk_level: Some(if blocked { RiskLevel::High } else { RiskLevel::Medium }),
            indicators: None,
        };
        Ok(result
            .with_detail("detected_toxicity", json!(detected))
            .with_detail("confidence_scores", Value::Object(confidence_scores))
            .with_detail("method", json!("regex")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrail(threshold: f64) -> ToxicityGuardrail {
        let spec = GuardrailSpec::new("tox", "simple_toxicity_detection")
            .with_config("confidence_threshold", json!(threshold));
        ToxicityGuardrail::new("tox", &spec).unwrap()
    }

    #[tokio::test]
    async fn test_threat_detected() {
        let g = guardrail(0.4);
        let result = g.analyze("I will kill you", None).await.unwrap();
        assert!(result.blocked);
        assert!(result.reason.contains("threats"));
    }

    #[tokio::test]
    async fn test_harassment_detected() {
        let g = guardrail(0.4);
        let result = g.analyze("you're worthless, go die", None).await.unwrap();
        assert!(result.blocked);
        let detected = result.details["detected_toxicity"].as_array().unwrap();
        assert!(detected.contains(&json!("harassment")));
    }

    #[tokio::test]
    async fn test_multiple_matches_raise_confidence() {
        let g = guardrail(0.4);
        let single = g.analyze("they might attack you", None).await.unwrap();
        let multiple = g
            .analyze("shoot first, then bomb, then murder", None)
            .await
            .unwrap();
        assert!(multiple.confidence > single.confidence);
    }

    #[tokio::test]
    async fn test_clean_content_allowed() {
        let g = guardrail(0.4);
        let result = g.analyze("what a lovely day for a walk", None).await.unwrap();
        assert!(!result.blocked);
        assert_eq!(result.reason, "No toxic content detected (regex)");
    }

    #[tokio::test]
    async fn test_category_subset() {
        let spec = GuardrailSpec::new("tox", "simple_toxicity_detection")
            .with_config("categories", json!(["threats"]))
            .with_config("confidence_threshold", json!(0.4));
        let g = ToxicityGuardrail::new("tox", &spec).unwrap();

        // Violence category is disabled; only threats fire.
        let result = g.analyze("murder mystery novel", None).await.unwrap();
        assert!(!result.blocked);

        let result = g.analyze("you will pay for this", None).await.unwrap();
        assert!(result.blocked);
    }

    #[tokio::test]
    async fn test_unknown_category_dropped() {
        let spec = GuardrailSpec::new("tox", "simple_toxicity_detection")
            .with_config("categories", json!(["threats", "bad_vibes"]));
        let g = ToxicityGuardrail::new("tox", &spec).unwrap();
        assert_eq!(g.enabled_categories, vec!["threats"]);
    }

    #[tokio::test]
    async fn test_threshold_gates_blocking() {
        let g = guardrail(0.9);
        // One match scores 0.5, under the 0.9 threshold.
        let result = g.analyze("they might attack you", None).await.unwrap();
        assert!(!result.blocked);
        assert!(result.confidence > 0.0);
    }
}
