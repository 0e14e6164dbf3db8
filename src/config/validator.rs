//! Rule-driven configuration validation.
//!
//! Each guardrail publishes a list of [`ValidationRule`]s; a
//! [`ConfigValidator`] checks a config map against them and aggregates
//! every failure into one error message so callers see all problems at
//! once.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Constraint applied to a single config key.
#[derive(Debug, Clone)]
pub enum RuleKind {
    Bool,
    Str,
    /// Integer with optional inclusive bounds.
    Int {
        min: Option<i64>,
        max: Option<i64>,
    },
    /// Float with optional inclusive bounds.
    Float {
        min: Option<f64>,
        max: Option<f64>,
    },
    List,
    /// List where every element must be a string.
    StrList,
    /// String restricted to a closed set.
    StrEnum(Vec<&'static str>),
    Map,
}

/// Validation rule for one config key.
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub key: String,
    pub required: bool,
    pub kind: RuleKind,
}

impl ValidationRule {
    pub fn required(key: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            key: key.into(),
            required: true,
            kind,
        }
    }

    pub fn optional(key: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            key: key.into(),
            required: false,
            kind,
        }
    }

    fn check(&self, value: &Value) -> std::result::Result<(), String> {
        match &self.kind {
            RuleKind::Bool => {
                if !value.is_boolean() {
                    return Err(format!("'{}' must be a boolean", self.key));
                }
            }
            RuleKind::Str => {
                if !value.is_string() {
                    return Err(format!("'{}' must be a string", self.key));
                }
            }
            RuleKind::Int { min, max } => {
                let Some(n) = value.as_i64() else {
                    return Err(format!("'{}' must be an integer", self.key));
                };
                if let Some(min) = min
                    && n < *min
                {
                    return Err(format!("'{}' must be >= {min} (got {n})", self.key));
                }
                if let Some(max) = max
                    && n > *max
                {
                    return Err(format!("'{}' must be <= {max} (got {n})", self.key));
                }
            }
            RuleKind::Float { min, max } => {
                let Some(n) = value.as_f64() else {
                    return Err(format!("'{}' must be a number", self.key));
                };
                if let Some(min) = min
                    && n < *min
                {
                    return Err(format!("'{}' must be >= {min} (got {n})", self.key));
                }
                if let Some(max) = max
                    && n > *max
                {
                    return Err(format!("'{}' must be <= {max} (got {n})", self.key));
                }
            }
            RuleKind::List => {
                if !value.is_array() {
                    return Err(format!("'{}' must be a list", self.key));
                }
            }
            RuleKind::StrList => {
                let Some(items) = value.as_array() else {
                    return Err(format!("'{}' must be a list of strings", self.key));
                };
                if items.iter().any(|i| !i.is_string()) {
                    return Err(format!("'{}' must contain only strings", self.key));
                }
            }
            RuleKind::StrEnum(allowed) => {
                let Some(s) = value.as_str() else {
                    return Err(format!("'{}' must be a string", self.key));
                };
                if !allowed.contains(&s) {
                    return Err(format!(
                        "'{}' must be one of [{}] (got '{s}')",
                        self.key,
                        allowed.join(", ")
                    ));
                }
            }
            RuleKind::Map => {
                if !value.is_object() {
                    return Err(format!("'{}' must be a map", self.key));
                }
            }
        }
        Ok(())
    }
}

/// Validates a config map against a rule set, aggregating all failures.
#[derive(Debug, Clone, Default)]
pub struct ConfigValidator {
    rules: Vec<ValidationRule>,
}

impl ConfigValidator {
    pub fn new(rules: Vec<ValidationRule>) -> Self {
        Self { rules }
    }

    /// Returns every rule violation. Empty means valid.
    pub fn check(&self, config: &Map<String, Value>) -> Vec<String> {
        let mut errors = Vec::new();
        for rule in &self.rules {
            match config.get(&rule.key) {
                None | Some(Value::Null) => {
                    if rule.required {
                        errors.push(format!("missing required key '{}'", rule.key));
                    }
                }
                Some(value) => {
                    if let Err(message) = rule.check(value) {
                        errors.push(message);
                    }
                }
            }
        }
        errors
    }

    /// Fails fast with an aggregated configuration error.
    pub fn validate(&self, config: &Map<String, Value>) -> Result<()> {
        let errors = self.check(config);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::config(errors.join("; ")))
        }
    }
}

/// Rules shared by every guardrail config.
pub fn common_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule::optional("enabled", RuleKind::Bool),
        ValidationRule::optional("on_error", RuleKind::StrEnum(vec!["allow", "warn", "block"])),
        ValidationRule::optional(
            "confidence_threshold",
            RuleKind::Float {
                min: Some(0.0),
                max: Some(1.0),
            },
        ),
    ]
}

/// Rules shared by AI-backed guardrail configs.
pub fn ai_guardrail_rules() -> Vec<ValidationRule> {
    let mut rules = common_rules();
    rules.push(ValidationRule::optional("model", RuleKind::Str));
    rules.push(ValidationRule::optional(
        "risk_threshold",
        RuleKind::Int {
            min: Some(0),
            max: Some(100),
        },
    ));
    rules.push(ValidationRule::optional("block_levels", RuleKind::StrList));
    rules.push(ValidationRule::optional("warn_levels", RuleKind::StrList));
    rules.push(ValidationRule::optional("legacy_mode", RuleKind::Bool));
    rules.push(ValidationRule::optional("conversation_awareness", RuleKind::Map));
    rules.push(ValidationRule::optional("pattern_detection", RuleKind::Map));
    rules
}

/// Rules for keyword guardrail configs.
pub fn keyword_rules() -> Vec<ValidationRule> {
    let mut rules = common_rules();
    rules.push(ValidationRule::optional("keywords", RuleKind::StrList));
    rules.push(ValidationRule::optional("keyword", RuleKind::Str));
    rules.push(ValidationRule::optional("keywords_file", RuleKind::Str));
    rules.push(ValidationRule::optional("case_sensitive", RuleKind::Bool));
    rules
}
