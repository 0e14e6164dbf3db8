//! Regex-based PII detection.
//!
//! Detects a closed set of PII categories with curated patterns. High-signal
//! categories (SSN, credit card, email, phone) score higher than ambiguous
//! ones; credit cards are Luhn-validated and SSNs structurally validated to
//! cut false positives.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::config::{GuardrailSpec, OnError, RuleKind, ValidationRule, validator};
use crate::conversation::Conversation;
use crate::error::Result;

use super::{Guardrail, GuardrailError, GuardrailResult, GuardrailType, RiskLevel};

/// One PII category: pattern plus optional structural validator.
struct PiiPattern {
    category: &'static str,
    regex: &'static Lazy<Regex>,
    validator: Option<fn(&str) -> bool>,
    /// High-signal categories use a steeper confidence curve.
    strong: bool,
}

static SSN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-?\d{2}-?\d{4}\b").expect("valid regex"));
static CREDIT_CARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b").expect("valid regex"));
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("valid regex")
});
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\+\d{1,2}\s?)?\(?\d{3}\)?[\s.-]\d{3}[\s.-]?\d{4}\b").expect("valid regex")
});
static IP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1\d{2}|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d{2}|[1-9]?\d)\b")
        .expect("valid regex")
});
static DRIVER_LICENSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]{1,2}\d{6,8}\b").expect("valid regex"));
static PASSPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]{1,2}\d{6,9}\b").expect("valid regex"));
static BANK_ACCOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{8,17}\b").expect("valid regex"));

static PII_PATTERNS: [PiiPattern; 8] = [
    PiiPattern {
        category: "ssn",
        regex: &SSN_RE,
        validator: Some(validate_ssn),
        strong: true,
    },
    PiiPattern {
        category: "credit_card",
        regex: &CREDIT_CARD_RE,
        validator: Some(validate_luhn),
        strong: true,
    },
    PiiPattern {
        category: "email",
        regex: &EMAIL_RE,
        validator: None,
        strong: true,
    },
    PiiPattern {
        category: "phone",
        regex: &PHONE_RE,
        validator: None,
        strong: true,
    },
    PiiPattern {
        category: "ip_address",
        regex: &IP_RE,
        validator: None,
        strong: false,
    },
    PiiPattern {
        category: "driver_license",
        regex: &DRIVER_LICENSE_RE,
        validator: None,
        strong: false,
    },
    PiiPattern {
        category: "passport",
        regex: &PASSPORT_RE,
        validator: None,
        strong: false,
    },
    PiiPattern {
        category: "bank_account",
        regex: &BANK_ACCOUNT_RE,
        validator: None,
        strong: false,
    },
];

/// Luhn check over the digits of a candidate card number.
fn validate_luhn(number: &str) -> bool {
    let digits: Vec<u32> = number.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }

    let mut sum = 0;
    let mut double = false;
    for &digit in digits.iter().rev() {
        let mut digit = digit;
        if double {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
        double = !double;
    }
    sum % 10 == 0
}

/// Structural SSN validation: area not 000/666/900+, group not 00, serial
/// not 0000.
fn validate_ssn(ssn: &str) -> bool {
    let digits: String = ssn.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 9 {
        return false;
    }
    let area: u32 = digits[0..3].parse().unwrap_or(0);
    if area == 0 || area == 666 || area >= 900 {
        return false;
    }
    let group: u32 = digits[3..5].parse().unwrap_or(0);
    if group == 0 {
        return false;
    }
    let serial: u32 = digits[5..9].parse().unwrap_or(0);
    serial != 0
}

/// Regex-based PII detection guardrail.
pub struct PiiGuardrail {
    name: String,
    enabled: AtomicBool,
    enabled_categories: Vec<String>,
    confidence_threshold: f64,
    on_error: OnError,
}

impl PiiGuardrail {
    pub fn new(name: &str, spec: &GuardrailSpec) -> Result<Self> {
        let mut rules = validator::common_rules();
        rules.push(ValidationRule::optional("patterns", RuleKind::StrList));
        validator::ConfigValidator::new(rules).validate(&spec.config)?;

        let known: Vec<&str> = PII_PATTERNS.iter().map(|p| p.category).collect();
        let requested = spec
            .config_str_list("patterns")
            .unwrap_or_else(|| known.iter().map(|s| s.to_string()).collect());

        // Unknown categories are dropped with a warning, never fatal.
        let mut enabled_categories = Vec::new();
        for category in requested {
            if known.contains(&category.as_str()) {
                enabled_categories.push(category);
            } else {
                tracing::warn!(
                    guardrail = name,
                    category = %category,
                    "unknown PII category dropped"
                );
            }
        }

        Ok(Self {
            name: name.to_string(),
            enabled: AtomicBool::new(spec.enabled),
            enabled_categories,
            confidence_threshold: spec.config_f64("confidence_threshold").unwrap_or(0.8),
            on_error: spec.on_error.unwrap_or(OnError::Block),
        })
    }

    fn category_confidence(strong: bool, matches: usize) -> f64 {
        if strong {
            (0.8 + matches as f64 * 0.05).min(0.95)
        } else {
            (0.5 + matches as f64 * 0.1).min(0.9)
        }
    }
}

#[async_trait]
impl Guardrail for PiiGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GuardrailType {
        GuardrailType::SimplePiiDetection
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
            "patterns": self.enabled_categories,
            "confidence_threshold": self.confidence_threshold,
            "on_error": self.on_error.to_string(),
        })
    }

    fn update_config(&mut self, config: &Map<String, Value>) -> std::result::Result<(), GuardrailError> {
        if let Some(patterns) = config.get("patterns").and_then(Value::as_array) {
            self.enabled_categories = patterns
                .iter()
                .filter_map(Value::as_str)
                .filter(|c| PII_PATTERNS.iter().any(|p| p.category == *c))
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
        rules.push(ValidationRule::optional("patterns", RuleKind::StrList));
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

        for pattern in PII_PATTERNS
            .iter()
            .filter(|p| self.enabled_categories.iter().any(|c| c == p.category))
        {
            let matches = pattern
                .regex
                .find_iter(content)
                .filter(|m| pattern.validator.is_none_or(|v| v(m.as_str())))
                .count();
            if matches > 0 {
                detected.push(pattern.category.to_string());
                confidence_scores.insert(
                    pattern.category.to_string(),
                    json!(Self::category_confidence(pattern.strong, matches)),
                );
            }
        }

        if detected.is_empty() {
            return Ok(
                GuardrailResult::allow(&self.name, self.kind(), "No PII detected (regex)")
                    .with_detail("detected_pii", json!([]))
                    .with_detail("confidence_scores", json!({}))
                    .with_detail("method", json!("regex")),
            );
        }

        let max_confidence = confidence_scores
            .values()
            .filter_map(Value::as_f64)
            .fold(0.0, f64::max);
        let blocked = max_confidence >= self.confidence_threshold;

        let result = GuardrailResult {
            blocked,
            confidence: max_confidence,
            reason: format!("PII detected (regex): {}", detected.join(", ")),
            details: Map::new(),
            guardrail_name: self.name.clone(),
            guardrail_type: self.kind(),
            risk_level: Some(if blocked { RiskLevel::High } else { RiskLevel::Medium }),
            indicators: None,
        };
        Ok(result
            .with_detail("detected_pii", json!(detected))
            .with_detail("confidence_scores", Value::Object(confidence_scores))
            .with_detail("method", json!("regex")))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn guardrail_with_threshold(threshold: f64) -> PiiGuardrail {
        let spec = GuardrailSpec::new("pii", "simple_pii_detection")
            .with_config("confidence_threshold", json!(threshold));
        PiiGuardrail::new("pii", &spec).unwrap()
    }

    #[tokio::test]
    async fn test_ssn_detected_and_blocked() {
        let spec = GuardrailSpec::new("pii", "simple_pii_detection")
            .with_config("patterns", json!(["ssn", "credit_card", "email"]))
            .with_config("confidence_threshold", json!(0.6));
        let g = PiiGuardrail::new("pii", &spec).unwrap();

        let result = g.analyze("My SSN is 123-45-6789", None).await.unwrap();
        assert!(result.blocked);
        assert_eq!(result.reason, "PII detected (regex): ssn");
        assert!(result.confidence >= 0.6);
        assert_eq!(result.details["method"], json!("regex"));
        assert_eq!(result.details["detected_pii"], json!(["ssn"]));
    }

    #[rstest]
    #[case("mail me at user@example.com", "email")]
    #[case("call (555) 123-4567 today", "phone")]
    #[case("server at 192.168.1.10 is down", "ip_address")]
    #[case("card 4111 1111 1111 1111 on file", "credit_card")]
    fn test_categories_detected(#[case] content: &str, #[case] category: &str) {
        let g = guardrail_with_threshold(0.5);
        let result = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(g.analyze(content, None))
            .unwrap();
        let detected: Vec<String> = result.details["detected_pii"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(detected.contains(&category.to_string()), "content: {content}");
    }

    #[tokio::test]
    async fn test_invalid_ssn_not_detected() {
        let g = guardrail_with_threshold(0.5);
        // Area 000 fails structural validation.
        let result = g.analyze("number 000-12-3456 here", None).await.unwrap();
        let detected = result.details["detected_pii"].as_array().unwrap();
        assert!(!detected.contains(&json!("ssn")));
    }

    #[tokio::test]
    async fn test_failed_luhn_not_a_credit_card() {
        let spec = GuardrailSpec::new("pii", "simple_pii_detection")
            .with_config("patterns", json!(["credit_card"]));
        let g = PiiGuardrail::new("pii", &spec).unwrap();
        let result = g.analyze("fake card 1234-5678-9012-3456", None).await.unwrap();
        assert!(!result.blocked);
    }

    #[tokio::test]
    async fn test_clean_content() {
        let g = guardrail_with_threshold(0.5);
        let result = g.analyze("nothing sensitive here", None).await.unwrap();
        assert!(!result.blocked);
        assert_eq!(result.reason, "No PII detected (regex)");
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_threshold_gates_blocking() {
        // ip_address alone scores 0.6; a 0.99 threshold reports without blocking.
        let spec = GuardrailSpec::new("pii", "simple_pii_detection")
            .with_config("patterns", json!(["ip_address"]))
            .with_config("confidence_threshold", json!(0.99));
        let g = PiiGuardrail::new("pii", &spec).unwrap();

        let result = g.analyze("host 10.0.0.1", None).await.unwrap();
        assert!(!result.blocked);
        assert!(result.confidence > 0.0);
    }

    #[tokio::test]
    async fn test_unknown_category_dropped_with_warning() {
        let spec = GuardrailSpec::new("pii", "simple_pii_detection")
            .with_config("patterns", json!(["ssn", "zodiac_sign"]));
        let g = PiiGuardrail::new("pii", &spec).unwrap();
        // Construction succeeded; only the known category is active.
        assert_eq!(g.enabled_categories, vec!["ssn"]);
    }

    #[test]
    fn test_luhn() {
        assert!(validate_luhn("4111111111111111"));
        assert!(validate_luhn("5500-0000-0000-0004"));
        assert!(!validate_luhn("4111111111111112"));
        assert!(!validate_luhn("12345"));
    }

    #[test]
    fn test_ssn_validation() {
        assert!(validate_ssn("123-45-6789"));
        assert!(!validate_ssn("000-45-6789"));
        assert!(!validate_ssn("666-45-6789"));
        assert!(!validate_ssn("900-45-6789"));
        assert!(!validate_ssn("123-00-6789"));
        assert!(!validate_ssn("123-45-0000"));
    }
}
