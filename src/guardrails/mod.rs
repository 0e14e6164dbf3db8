//! Guardrails: pluggable content-safety detectors with a uniform contract.
//!
//! Every detector implements the [`Guardrail`] trait and returns a
//! [`GuardrailResult`]. The pipeline never calls `analyze` directly; it
//! goes through [`Guardrail::analyze_safe`], which is total — input
//! validation failures and detector errors come back as conservative
//! blocked verdicts, never as panics or raw errors.
//!
//! # Architecture
//!
//! ```text
//! Prompt ──► Pipeline(input stage) ──► LLM ──► Pipeline(output stage) ──► Response
//!                 │                                   │
//!           [Guardrail; N]                      [Guardrail; M]
//!            keyword, regex,                     pii, toxicity,
//!            injection, ai_*, ...                moderation, ...
//! ```

pub mod ai;
pub mod code_gen;
pub mod error;
pub mod injection;
pub mod keyword;
pub mod length;
pub mod moderation;
pub mod pass_through;
pub mod pii;
pub mod registry;
pub mod regex_rule;
pub mod topic;
pub mod toxicity;
pub mod url_filter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use error::GuardrailError;
pub use registry::GuardrailRegistry;

use crate::config::{OnError, ValidationRule};
use crate::conversation::Conversation;
use crate::sanitize;
use crate::validation::{ContentKind, validate_input_content};

/// The closed set of guardrail kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailType {
    ContentModeration,
    PromptInjection,
    KeywordBlock,
    KeywordList,
    Regex,
    Length,
    Url,
    PassThrough,
    Topic,
    SimplePiiDetection,
    AiPiiDetection,
    SimpleToxicityDetection,
    AiToxicityDetection,
    SimpleCodeGeneration,
    AiCodeGeneration,
}

impl GuardrailType {
    /// Every type, in declaration order. Used for "valid types" error
    /// messages.
    pub fn all() -> &'static [GuardrailType] {
        &[
            GuardrailType::ContentModeration,
            GuardrailType::PromptInjection,
            GuardrailType::KeywordBlock,
            GuardrailType::KeywordList,
            GuardrailType::Regex,
            GuardrailType::Length,
            GuardrailType::Url,
            GuardrailType::PassThrough,
            GuardrailType::Topic,
            GuardrailType::SimplePiiDetection,
            GuardrailType::AiPiiDetection,
            GuardrailType::SimpleToxicityDetection,
            GuardrailType::AiToxicityDetection,
            GuardrailType::SimpleCodeGeneration,
            GuardrailType::AiCodeGeneration,
        ]
    }

    /// The serialized name, matching config `type` strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailType::ContentModeration => "content_moderation",
            GuardrailType::PromptInjection => "prompt_injection",
            GuardrailType::KeywordBlock => "keyword_block",
            GuardrailType::KeywordList => "keyword_list",
            GuardrailType::Regex => "regex",
            GuardrailType::Length => "length",
            GuardrailType::Url => "url",
            GuardrailType::PassThrough => "pass_through",
            GuardrailType::Topic => "topic",
            GuardrailType::SimplePiiDetection => "simple_pii_detection",
            GuardrailType::AiPiiDetection => "ai_pii_detection",
            GuardrailType::SimpleToxicityDetection => "simple_toxicity_detection",
            GuardrailType::AiToxicityDetection => "ai_toxicity_detection",
            GuardrailType::SimpleCodeGeneration => "simple_code_generation",
            GuardrailType::AiCodeGeneration => "ai_code_generation",
        }
    }
}

impl std::fmt::Display for GuardrailType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GuardrailType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GuardrailType::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or(())
    }
}

/// Risk level attached to results and used by the injection detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

impl RiskLevel {
    /// Parses a risk level string, case-insensitively.
    pub fn parse(s: &str) -> Option<RiskLevel> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

/// Standardized result produced by every guardrail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub blocked: bool,
    /// Confidence in the verdict, 0.0 to 1.0.
    pub confidence: f64,
    pub reason: String,
    pub details: Map<String, Value>,
    pub guardrail_name: String,
    pub guardrail_type: GuardrailType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    /// Evidence strings supporting the verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicators: Option<Vec<String>>,
}

impl GuardrailResult {
    /// Non-blocking result.
    pub fn allow(name: &str, kind: GuardrailType, reason: impl Into<String>) -> Self {
        Self {
            blocked: false,
            confidence: 0.0,
            reason: reason.into(),
            details: Map::new(),
            guardrail_name: name.to_string(),
            guardrail_type: kind,
            risk_level: None,
            indicators: None,
        }
    }

    /// Blocking result.
    pub fn blocked(name: &str, kind: GuardrailType, reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            confidence: 1.0,
            reason: reason.into(),
            details: Map::new(),
            guardrail_name: name.to_string(),
            guardrail_type: kind,
            risk_level: None,
            indicators: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = details;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn with_risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = Some(level);
        self
    }

    pub fn with_indicators(mut self, indicators: Vec<String>) -> Self {
        self.indicators = Some(indicators);
        self
    }

    /// Derives the action for this result from the entry's `on_error`
    /// policy: `Allow` when not blocked; otherwise `Block` (the default).
    /// `warn` demotes a blocking verdict to a warning, and so does
    /// `allow` — an `on_error: allow` entry still runs and is still
    /// recorded, it just never blocks the aggregate.
    pub fn action(&self, on_error: Option<OnError>) -> OnError {
        if !self.blocked {
            OnError::Allow
        } else {
            match on_error {
                Some(OnError::Warn) | Some(OnError::Allow) => OnError::Warn,
                _ => OnError::Block,
            }
        }
    }
}

/// Uniform contract every detector implements.
///
/// `analyze` is the only behavior-bearing operation; it is I/O-bounded for
/// AI-backed detectors and may suspend. Enable state uses interior
/// mutability so shared references can toggle it; config replacement
/// requires exclusive access.
#[async_trait]
pub trait Guardrail: Send + Sync {
    /// Instance name (unique within a registry).
    fn name(&self) -> &str;

    /// The guardrail's kind.
    fn kind(&self) -> GuardrailType;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Whether the guardrail can do useful work right now (e.g. an
    /// AI-backed detector with a provider configured).
    fn is_available(&self) -> bool {
        true
    }

    /// Current configuration, for introspection.
    fn config(&self) -> Value;

    /// Replaces configurable settings. Unknown keys are ignored.
    fn update_config(&mut self, config: &Map<String, Value>) -> Result<(), GuardrailError>;

    /// The validation rules this guardrail's config must satisfy.
    fn validation_rules(&self) -> Vec<ValidationRule>;

    /// Analyzes content, optionally with conversation context.
    async fn analyze(
        &self,
        content: &str,
        conversation: Option<&Conversation>,
    ) -> Result<GuardrailResult, GuardrailError>;

    /// Total wrapper around [`analyze`](Self::analyze): validates input and
    /// converts any failure into a conservative blocked result with a
    /// sanitized message. Never fails.
    async fn analyze_safe(
        &self,
        content: &str,
        conversation: Option<&Conversation>,
    ) -> GuardrailResult {
        if let Err(e) = validate_input_content(content, ContentKind::Input) {
            let safe = sanitize::safe_error_message(&e, &format!("input validation in {}", self.name()));
            return GuardrailResult::blocked(
                self.name(),
                self.kind(),
                format!("Input validation failed: {safe}"),
            )
            .with_risk_level(RiskLevel::High)
            .with_detail("validation_error", Value::String(sanitize::sanitize_message(&e.to_string())));
        }

        match self.analyze(content, conversation).await {
            Ok(result) => result,
            Err(e) => {
                let safe =
                    sanitize::safe_error_message(&e, &format!("guardrail execution in {}", self.name()));
                GuardrailResult::blocked(self.name(), self.kind(), format!("Guardrail error: {safe}"))
                    .with_confidence(0.0)
                    .with_risk_level(RiskLevel::Medium)
                    .with_detail("execution_error", Value::String(sanitize::sanitize_message(&e.to_string())))
                    .with_detail("error_code", Value::String(e.error_code().to_string()))
            }
        }
    }
}
