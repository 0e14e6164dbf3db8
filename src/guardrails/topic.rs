//! Topic allow/deny guardrail.
//!
//! Gates content on topic lists. `allow` mode requires at least one allow
//! match; `deny` mode blocks on deny matches above the confidence
//! threshold; `both` applies deny priority, then allow gating. Topics are
//! literal substrings unless `use_regex` is set.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value, json};

use crate::config::{GuardrailSpec, OnError, RuleKind, ValidationRule, validator};
use crate::conversation::Conversation;
use crate::error::{Error, Result};

use super::{Guardrail, GuardrailError, GuardrailResult, GuardrailType, RiskLevel};

/// Filter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicMode {
    Allow,
    Deny,
    Both,
}

impl TopicMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(TopicMode::Allow),
            "deny" => Some(TopicMode::Deny),
            "both" => Some(TopicMode::Both),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            TopicMode::Allow => "allow",
            TopicMode::Deny => "deny",
            TopicMode::Both => "both",
        }
    }
}

struct TopicPattern {
    topic: String,
    regex: Regex,
}

pub struct TopicGuardrail {
    name: String,
    enabled: AtomicBool,
    allow: Vec<TopicPattern>,
    deny: Vec<TopicPattern>,
    mode: TopicMode,
    case_sensitive: bool,
    use_regex: bool,
    confidence_threshold: f64,
    on_error: OnError,
}

impl TopicGuardrail {
    pub fn new(name: &str, spec: &GuardrailSpec) -> Result<Self> {
        let mut rules = validator::common_rules();
        rules.push(ValidationRule::optional("allow_topics", RuleKind::StrList));
        rules.push(ValidationRule::optional("deny_topics", RuleKind::StrList));
        rules.push(ValidationRule::optional(
            "mode",
            RuleKind::StrEnum(vec!["allow", "deny", "both"]),
        ));
        rules.push(ValidationRule::optional("case_sensitive", RuleKind::Bool));
        rules.push(ValidationRule::optional("use_regex", RuleKind::Bool));
        validator::ConfigValidator::new(rules).validate(&spec.config)?;

        let mode = TopicMode::parse(spec.config_str("mode").unwrap_or("deny"))
            .expect("mode validated by rule");
        let case_sensitive = spec.config_bool("case_sensitive").unwrap_or(false);
        let use_regex = spec.config_bool("use_regex").unwrap_or(false);

        let compile = |topics: Vec<String>| -> Result<Vec<TopicPattern>> {
            topics
                .into_iter()
                .filter_map(|topic| {
                    let source = if use_regex {
                        topic.clone()
                    } else {
                        regex::escape(&topic)
                    };
                    match RegexBuilder::new(&source)
                        .case_insensitive(!case_sensitive)
                        .build()
                    {
                        Ok(regex) => Some(Ok(TopicPattern { topic, regex })),
                        Err(e) if use_regex => {
                            // Invalid user regexes are dropped with a warning,
                            // matching category-list tolerance elsewhere.
                            tracing::warn!(topic = %topic, error = %e, "invalid topic pattern dropped");
                            None
                        }
                        Err(e) => Some(Err(Error::config(format!(
                            "failed to compile topic '{topic}': {e}"
                        )))),
                    }
                })
                .collect()
        };

        Ok(Self {
            name: name.to_string(),
            enabled: AtomicBool::new(spec.enabled),
            allow: compile(spec.config_str_list("allow_topics").unwrap_or_default())?,
            deny: compile(spec.config_str_list("deny_topics").unwrap_or_default())?,
            mode,
            case_sensitive,
            use_regex,
            confidence_threshold: spec.config_f64("confidence_threshold").unwrap_or(0.5),
            on_error: spec.on_error.unwrap_or(OnError::Block),
        })
    }

    fn find_matches<'a>(patterns: &'a [TopicPattern], content: &str) -> Vec<&'a str> {
        patterns
            .iter()
            .filter(|p| p.regex.is_match(content))
            .map(|p| p.topic.as_str())
            .collect()
    }

    fn match_confidence(matches: usize, list_size: usize) -> f64 {
        if list_size == 0 {
            0.0
        } else {
            (matches as f64 / list_size as f64).min(1.0)
        }
    }
}

#[async_trait]
impl Guardrail for TopicGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GuardrailType {
        GuardrailType::Topic
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
            "type": GuardrailType::Topic.as_str(),
            "enabled": self.is_enabled(),
            "allow_topics": self.allow.iter().map(|p| p.topic.clone()).collect::<Vec<_>>(),
            "deny_topics": self.deny.iter().map(|p| p.topic.clone()).collect::<Vec<_>>(),
            "mode": self.mode.as_str(),
            "case_sensitive": self.case_sensitive,
            "use_regex": self.use_regex,
            "confidence_threshold": self.confidence_threshold,
            "on_error": self.on_error.to_string(),
        })
    }

    fn update_config(&mut self, config: &Map<String, Value>) -> std::result::Result<(), GuardrailError> {
        if let Some(mode) = config.get("mode").and_then(Value::as_str) {
            self.mode = TopicMode::parse(mode)
                .ok_or_else(|| GuardrailError::config(format!("invalid topic mode '{mode}'")))?;
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
        rules.push(ValidationRule::optional("allow_topics", RuleKind::StrList));
        rules.push(ValidationRule::optional("deny_topics", RuleKind::StrList));
        rules.push(ValidationRule::optional(
            "mode",
            RuleKind::StrEnum(vec!["allow", "deny", "both"]),
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

        if content.is_empty() {
            return Ok(GuardrailResult::allow(&self.name, self.kind(), "Empty content"));
        }

        let allow_matches = Self::find_matches(&self.allow, content);
        let deny_matches = Self::find_matches(&self.deny, content);

        let details = |result: GuardrailResult| {
            result
                .with_detail("allow_matches", json!(allow_matches.clone()))
                .with_detail("deny_matches", json!(deny_matches.clone()))
                .with_detail("mode", json!(self.mode.as_str()))
        };

        match self.mode {
            TopicMode::Allow => {
                if allow_matches.is_empty() {
                    Ok(details(
                        GuardrailResult::blocked(
                            &self.name,
                            self.kind(),
                            "Content does not match any allowed topics",
                        )
                        .with_confidence(1.0)
                        .with_risk_level(RiskLevel::Medium),
                    ))
                } else {
                    let confidence =
                        Self::match_confidence(allow_matches.len(), self.allow.len());
                    Ok(details(
                        GuardrailResult::allow(
                            &self.name,
                            self.kind(),
                            format!("Content matches allowed topics: {}", allow_matches.join(", ")),
                        )
                        .with_confidence(confidence),
                    ))
                }
            }
            TopicMode::Deny => {
                if deny_matches.is_empty() {
                    return Ok(details(GuardrailResult::allow(
                        &self.name,
                        self.kind(),
                        "Content does not match any denied topics",
                    )));
                }
                let confidence = Self::match_confidence(deny_matches.len(), self.deny.len());
                if confidence >= self.confidence_threshold {
                    Ok(details(
                        GuardrailResult::blocked(
                            &self.name,
                            self.kind(),
                            format!("Content matches denied topics: {}", deny_matches.join(", ")),
                        )
                        .with_confidence(confidence)
                        .with_risk_level(RiskLevel::Medium),
                    ))
                } else {
                    Ok(details(
                        GuardrailResult::allow(
                            &self.name,
                            self.kind(),
                            format!(
                                "Confidence {confidence:.2} below threshold {}",
                                self.confidence_threshold
                            ),
                        )
                        .with_confidence(confidence),
                    ))
                }
            }
            TopicMode::Both => {
                if !deny_matches.is_empty() {
                    let confidence = Self::match_confidence(deny_matches.len(), self.deny.len());
                    return Ok(details(
                        GuardrailResult::blocked(
                            &self.name,
                            self.kind(),
                            format!("Content matches denied topics: {}", deny_matches.join(", ")),
                        )
                        .with_confidence(confidence)
                        .with_risk_level(RiskLevel::Medium),
                    ));
                }
                if !self.allow.is_empty() && allow_matches.is_empty() {
                    return Ok(details(
                        GuardrailResult::blocked(
                            &self.name,
                            self.kind(),
                            "Content does not match any allowed topics",
                        )
                        .with_confidence(1.0)
                        .with_risk_level(RiskLevel::Medium),
                    ));
                }
                let confidence = Self::match_confidence(allow_matches.len(), self.allow.len());
                Ok(details(
                    GuardrailResult::allow(
                        &self.name,
                        self.kind(),
                        "Content passes both allow and deny checks",
                    )
                    .with_confidence(confidence),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(mode: &str) -> GuardrailSpec {
        GuardrailSpec::new("topics", "topic").with_config("mode", json!(mode))
    }

    #[tokio::test]
    async fn test_deny_mode_blocks_matching_topic() {
        let s = spec("deny").with_config("deny_topics", json!(["gambling"]));
        let g = TopicGuardrail::new("topics", &s).unwrap();

        let result = g.analyze("the best gambling sites", None).await.unwrap();
        assert!(result.blocked);
        assert!(result.reason.contains("gambling"));
    }

    #[tokio::test]
    async fn test_deny_mode_confidence_threshold() {
        let s = spec("deny")
            .with_config("deny_topics", json!(["a", "b", "c", "d"]))
            .with_config("confidence_threshold", json!(0.5));
        let g = TopicGuardrail::new("topics", &s).unwrap();

        // One of four topics matched: confidence 0.25, below 0.5.
        let result = g.analyze("mentions a only", None).await.unwrap();
        assert!(!result.blocked);
        assert!(result.reason.contains("below threshold"));
    }

    #[tokio::test]
    async fn test_allow_mode_requires_match() {
        let s = spec("allow").with_config("allow_topics", json!(["cooking", "baking"]));
        let g = TopicGuardrail::new("topics", &s).unwrap();

        assert!(!g.analyze("my favorite cooking recipe", None).await.unwrap().blocked);
        assert!(g.analyze("sports commentary", None).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_both_mode_deny_priority() {
        let s = spec("both")
            .with_config("allow_topics", json!(["recipes"]))
            .with_config("deny_topics", json!(["alcohol"]));
        let g = TopicGuardrail::new("topics", &s).unwrap();

        // Deny wins even when allow matches too.
        let result = g.analyze("recipes with alcohol", None).await.unwrap();
        assert!(result.blocked);
        assert!(result.reason.contains("alcohol"));

        // Allow gating applies when no deny matches.
        assert!(g.analyze("cocktail hour", None).await.unwrap().blocked);
        assert!(!g.analyze("great recipes here", None).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_regex_topics() {
        let s = spec("deny")
            .with_config("deny_topics", json!([r"crypto(currency)?"]))
            .with_config("use_regex", json!(true))
            .with_config("confidence_threshold", json!(0.0));
        let g = TopicGuardrail::new("topics", &s).unwrap();

        assert!(g.analyze("buy cryptocurrency now", None).await.unwrap().blocked);
        assert!(g.analyze("crypto tips", None).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_invalid_regex_topic_dropped_not_fatal() {
        let s = spec("deny")
            .with_config("deny_topics", json!(["[unclosed", "valid"]))
            .with_config("use_regex", json!(true))
            .with_config("confidence_threshold", json!(0.0));
        let g = TopicGuardrail::new("topics", &s).unwrap();
        assert!(g.analyze("valid topic", None).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_case_insensitive_by_default() {
        let s = spec("deny")
            .with_config("deny_topics", json!(["Weapons"]))
            .with_config("confidence_threshold", json!(0.0));
        let g = TopicGuardrail::new("topics", &s).unwrap();
        assert!(g.analyze("WEAPONS catalog", None).await.unwrap().blocked);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let s = spec("maybe");
        assert!(TopicGuardrail::new("topics", &s).is_err());
    }
}
