//! Input validation and resource-exhaustion defenses.
//!
//! Every component routes untrusted content through [`InputValidator`]
//! before doing real work: size caps, per-line caps, null bytes, repetition
//! bombs, conversation growth, pipeline shape, and file/keyword limits.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use thiserror::Error;

/// Per-line length cap, in characters.
const MAX_LINE_LENGTH: usize = 10_000;
/// Individual keyword length cap, in characters.
const MAX_KEYWORD_LENGTH: usize = 1_000;
/// Minimum content length before the repetition heuristic applies.
const REPETITION_MIN_LENGTH: usize = 100;
/// Fraction of content a single code point may occupy.
const REPETITION_THRESHOLD: f64 = 0.8;

/// What kind of content is being validated; selects the applicable cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Generic input (guardrail analysis input).
    Input,
    /// A user prompt.
    Prompt,
    /// A model response.
    Response,
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentKind::Input => write!(f, "input"),
            ContentKind::Prompt => write!(f, "prompt"),
            ContentKind::Response => write!(f, "response"),
        }
    }
}

/// Validation failures. All carry enough context for actionable messages
/// without embedding content.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("{kind} too large: {actual} bytes > {limit} bytes")]
    ContentTooLarge {
        kind: String,
        actual: usize,
        limit: usize,
    },

    #[error("{kind} line {line} too long: {actual} > {limit} characters")]
    LineTooLong {
        kind: String,
        line: usize,
        actual: usize,
        limit: usize,
    },

    #[error("{kind} contains null bytes")]
    NullBytes { kind: String },

    #[error("{kind} contains excessive repetition")]
    ExcessiveRepetition { kind: String },

    #[error("Too many conversation turns: {actual} > {limit}")]
    TooManyTurns { actual: usize, limit: usize },

    #[error("Conversation memory too large: {actual_mb:.1}MB > {limit_mb}MB")]
    ConversationMemoryExceeded { actual_mb: f64, limit_mb: u64 },

    #[error("Conversation too old: {age_hours:.1}h > {limit_hours}h")]
    ConversationTooOld { age_hours: f64, limit_hours: u64 },

    #[error("Too many guardrails: {actual} > {limit}")]
    TooManyGuardrails { actual: usize, limit: usize },

    #[error("Too many regex patterns: {actual} > {limit}")]
    TooManyRegexPatterns { actual: usize, limit: usize },

    #[error("{kind} file not found: {path}")]
    FileNotFound { kind: String, path: String },

    #[error("{kind} file too large: {actual_kb:.1}KB > {limit_kb}KB")]
    FileTooLarge {
        kind: String,
        actual_kb: f64,
        limit_kb: u64,
    },

    #[error("Invalid {kind} file type: {extension}")]
    InvalidFileType { kind: String, extension: String },

    #[error("Too many keywords: {actual} > {limit}")]
    TooManyKeywords { actual: usize, limit: usize },

    #[error("Keyword {index} too long: {actual} > {limit} characters")]
    KeywordTooLong {
        index: usize,
        actual: usize,
        limit: usize,
    },
}

/// Global validation limits. Field names follow the external contract.
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    /// Generic content cap in bytes of the UTF-8 encoding.
    pub max_input_length: usize,
    /// Prompt cap in bytes.
    pub max_prompt_length: usize,
    /// Response cap in bytes.
    pub max_response_length: usize,
    /// Turns per conversation.
    pub max_conversation_turns: usize,
    /// Estimated conversation memory in megabytes.
    pub max_conversation_memory_mb: u64,
    /// Conversation age in hours.
    pub max_conversation_age_hours: u64,
    /// Guardrails per pipeline (input + output).
    pub max_guardrails_per_pipeline: usize,
    /// Total user regex patterns across a pipeline.
    pub max_regex_patterns: usize,
    /// Config/keyword file size in kilobytes.
    pub max_config_file_size_kb: u64,
    /// Keywords per keyword list.
    pub max_keyword_list_size: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_input_length: 100 * 1024,
            max_prompt_length: 50 * 1024,
            max_response_length: 50 * 1024,
            max_conversation_turns: 50,
            max_conversation_memory_mb: 100,
            max_conversation_age_hours: 24,
            max_guardrails_per_pipeline: 20,
            max_regex_patterns: 100,
            max_config_file_size_kb: 1024,
            max_keyword_list_size: 10_000,
        }
    }
}

/// Validates untrusted content and configuration against resource limits.
///
/// System-resource probes (memory delta, CPU%) from the reference design are
/// best-effort and disabled in this build: no measurement dependency is
/// carried, so those checks silently pass.
#[derive(Debug, Clone, Default)]
pub struct InputValidator {
    limits: ValidationLimits,
}

impl InputValidator {
    /// Creates a validator with the given limits.
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    /// Returns the configured limits.
    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Validates content size and shape.
    pub fn validate_content(
        &self,
        content: &str,
        kind: ContentKind,
    ) -> Result<(), ValidationError> {
        let byte_len = content.len();
        let limit = match kind {
            ContentKind::Input => self.limits.max_input_length,
            ContentKind::Prompt => self.limits.max_prompt_length,
            ContentKind::Response => self.limits.max_response_length,
        };
        if byte_len > limit {
            return Err(ValidationError::ContentTooLarge {
                kind: kind.to_string(),
                actual: byte_len,
                limit,
            });
        }

        self.validate_content_safety(content, kind)
    }

    /// Checks for DoS-shaped content: overlong lines, null bytes, and
    /// single-character repetition bombs.
    fn validate_content_safety(
        &self,
        content: &str,
        kind: ContentKind,
    ) -> Result<(), ValidationError> {
        for (i, line) in content.split('\n').enumerate() {
            let chars = line.chars().count();
            if chars > MAX_LINE_LENGTH {
                return Err(ValidationError::LineTooLong {
                    kind: kind.to_string(),
                    line: i,
                    actual: chars,
                    limit: MAX_LINE_LENGTH,
                });
            }
        }

        if content.contains('\0') {
            return Err(ValidationError::NullBytes {
                kind: kind.to_string(),
            });
        }

        if has_excessive_repetition(content) {
            return Err(ValidationError::ExcessiveRepetition {
                kind: kind.to_string(),
            });
        }

        Ok(())
    }

    /// Validates conversation growth against the configured caps.
    pub fn validate_conversation(
        &self,
        turn_count: usize,
        memory_mb: f64,
        created_at: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        if turn_count > self.limits.max_conversation_turns {
            return Err(ValidationError::TooManyTurns {
                actual: turn_count,
                limit: self.limits.max_conversation_turns,
            });
        }

        if memory_mb > self.limits.max_conversation_memory_mb as f64 {
            return Err(ValidationError::ConversationMemoryExceeded {
                actual_mb: memory_mb,
                limit_mb: self.limits.max_conversation_memory_mb,
            });
        }

        let age_hours = (Utc::now() - created_at).num_seconds() as f64 / 3600.0;
        if age_hours > self.limits.max_conversation_age_hours as f64 {
            return Err(ValidationError::ConversationTooOld {
                age_hours,
                limit_hours: self.limits.max_conversation_age_hours,
            });
        }

        Ok(())
    }

    /// Validates the shape of a pipeline: guardrail count and total regex
    /// pattern count.
    pub fn validate_pipeline_shape(
        &self,
        guardrail_count: usize,
        regex_pattern_count: usize,
    ) -> Result<(), ValidationError> {
        if guardrail_count > self.limits.max_guardrails_per_pipeline {
            return Err(ValidationError::TooManyGuardrails {
                actual: guardrail_count,
                limit: self.limits.max_guardrails_per_pipeline,
            });
        }
        if regex_pattern_count > self.limits.max_regex_patterns {
            return Err(ValidationError::TooManyRegexPatterns {
                actual: regex_pattern_count,
                limit: self.limits.max_regex_patterns,
            });
        }
        Ok(())
    }

    /// Validates a configuration or keyword file before reading it.
    pub fn validate_file(
        &self,
        path: &Path,
        kind: &str,
        allowed_extensions: &[&str],
    ) -> Result<(), ValidationError> {
        let metadata = path
            .metadata()
            .map_err(|_| ValidationError::FileNotFound {
                kind: kind.to_string(),
                path: crate::sanitize::sanitize_path(&path.display().to_string()),
            })?;

        let size_kb = metadata.len() as f64 / 1024.0;
        if size_kb > self.limits.max_config_file_size_kb as f64 {
            return Err(ValidationError::FileTooLarge {
                kind: kind.to_string(),
                actual_kb: size_kb,
                limit_kb: self.limits.max_config_file_size_kb,
            });
        }

        if !allowed_extensions.is_empty() {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();
            if !allowed_extensions.contains(&ext.as_str()) {
                return Err(ValidationError::InvalidFileType {
                    kind: kind.to_string(),
                    extension: ext,
                });
            }
        }

        Ok(())
    }

    /// Validates keyword list size and individual keyword lengths.
    pub fn validate_keywords(&self, keywords: &[String]) -> Result<(), ValidationError> {
        if keywords.len() > self.limits.max_keyword_list_size {
            return Err(ValidationError::TooManyKeywords {
                actual: keywords.len(),
                limit: self.limits.max_keyword_list_size,
            });
        }
        for (index, keyword) in keywords.iter().enumerate() {
            let chars = keyword.chars().count();
            if chars > MAX_KEYWORD_LENGTH {
                return Err(ValidationError::KeywordTooLong {
                    index,
                    actual: chars,
                    limit: MAX_KEYWORD_LENGTH,
                });
            }
        }
        Ok(())
    }
}

/// True when any single code point constitutes more than 80% of a
/// 100-or-more character content.
fn has_excessive_repetition(content: &str) -> bool {
    let total = content.chars().count();
    if total < REPETITION_MIN_LENGTH {
        return false;
    }

    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in content.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }

    let max = counts.values().copied().max().unwrap_or(0);
    (max as f64 / total as f64) > REPETITION_THRESHOLD
}

static DEFAULT_VALIDATOR: Lazy<InputValidator> = Lazy::new(InputValidator::default);

/// Process-wide validator with default limits.
pub fn default_validator() -> &'static InputValidator {
    &DEFAULT_VALIDATOR
}

/// Convenience wrapper over the default validator.
pub fn validate_input_content(content: &str, kind: ContentKind) -> Result<(), ValidationError> {
    default_validator().validate_content(content, kind)
}
