//! User-supplied regex pattern guardrail.
//!
//! Patterns are untrusted: each one passes a safety validator that rejects
//! shapes prone to pathological cost (nested quantifiers, excessive
//! alternation, oversized patterns) before compilation, and every scan
//! runs under a time budget. The `regex` crate is linear-time by design,
//! so the budget guards against cost blowup from pattern-by-input size
//! products; scans run over bounded windows and a pattern that exhausts
//! its budget is skipped with a security warning, never fatal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value, json};

use crate::config::{GuardrailSpec, OnError, RuleKind, ValidationRule, validator};
use crate::conversation::Conversation;
use crate::error::{Error, Result};

use super::{Guardrail, GuardrailError, GuardrailResult, GuardrailType, RiskLevel};

/// Per-pattern scan budget.
const SCAN_BUDGET: Duration = Duration::from_millis(100);
/// Scan window size in bytes.
const SCAN_WINDOW: usize = 64 * 1024;
/// Window overlap so matches spanning a boundary are still seen. Matches
/// longer than this may be missed in multi-window scans of very large
/// content.
const SCAN_OVERLAP: usize = 512;
/// Longest accepted pattern.
const MAX_PATTERN_LENGTH: usize = 1000;
/// Most alternation branches accepted in one pattern.
const MAX_ALTERNATIONS: usize = 50;

/// Validates user patterns before compilation.
///
/// A pre-scan heuristic: the `regex` crate cannot backtrack, but nested
/// quantifiers still signal patterns whose compiled automata or scan cost
/// explode, and they are exactly the shapes that take down backtracking
/// engines downstream consumers may feed the same config into.
pub fn validate_pattern_safety(pattern: &str) -> std::result::Result<(), String> {
    if pattern.len() > MAX_PATTERN_LENGTH {
        return Err(format!(
            "pattern too long: {} > {MAX_PATTERN_LENGTH} characters",
            pattern.len()
        ));
    }

    if pattern.matches('|').count() > MAX_ALTERNATIONS {
        return Err(format!(
            "pattern has too many alternations (> {MAX_ALTERNATIONS})"
        ));
    }

    if has_nested_quantifier(pattern) {
        return Err("pattern contains nested quantifiers".to_string());
    }

    Ok(())
}

/// Detects a quantified group whose body itself contains a quantifier,
/// e.g. `(a+)+`, `(a*)*`, `(a{1,5})+`.
fn has_nested_quantifier(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut depth_has_quantifier = vec![false];

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1, // skip escaped character
            b'(' => depth_has_quantifier.push(false),
            b')' => {
                let inner = depth_has_quantifier.pop().unwrap_or(false);
                // Quantifier directly after the closing paren?
                if inner
                    && let Some(&next) = bytes.get(i + 1)
                    && matches!(next, b'+' | b'*' | b'{')
                {
                    return true;
                }
                if let Some(top) = depth_has_quantifier.last_mut() {
                    *top = *top || inner;
                }
            }
            b'+' | b'*' => {
                if let Some(top) = depth_has_quantifier.last_mut() {
                    *top = true;
                }
            }
            b'{' => {
                // Only count {m,n} repetition, not literal braces.
                if bytes[i + 1..].iter().take_while(|&&b| b != b'{').any(|&b| b == b'}')
                    && let Some(top) = depth_has_quantifier.last_mut()
                {
                    *top = true;
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

struct CompiledPattern {
    regex: Regex,
    source: String,
}

/// Regex pattern guardrail.
pub struct RegexGuardrail {
    name: String,
    enabled: AtomicBool,
    patterns: Vec<CompiledPattern>,
    case_sensitive: bool,
    on_error: OnError,
    scan_budget: Duration,
}

impl RegexGuardrail {
    pub fn new(name: &str, spec: &GuardrailSpec) -> Result<Self> {
        let mut rules = validator::common_rules();
        rules.push(ValidationRule::required("patterns", RuleKind::StrList));
        rules.push(ValidationRule::optional("case_sensitive", RuleKind::Bool));
        validator::ConfigValidator::new(rules).validate(&spec.config)?;

        let sources = spec.config_str_list("patterns").unwrap_or_default();
        let case_sensitive = spec.config_bool("case_sensitive").unwrap_or(true);

        let mut patterns = Vec::with_capacity(sources.len());
        for source in sources {
            validate_pattern_safety(&source)
                .map_err(|reason| Error::config(format!("unsafe regex pattern '{source}': {reason}")))?;
            let regex = RegexBuilder::new(&source)
                .case_insensitive(!case_sensitive)
                .size_limit(1 << 20)
                .build()
                .map_err(|e| Error::config(format!("invalid regex pattern '{source}': {e}")))?;
            patterns.push(CompiledPattern { regex, source });
        }

        Ok(Self {
            name: name.to_string(),
            enabled: AtomicBool::new(spec.enabled),
            patterns,
            case_sensitive,
            on_error: spec.on_error.unwrap_or(OnError::Block),
            scan_budget: SCAN_BUDGET,
        })
    }

    /// Searches content in bounded windows under the scan budget.
    ///
    /// Returns `Ok(true)` on a match, `Ok(false)` on none, `Err(())` when
    /// the budget was exhausted and the pattern must be skipped.
    fn bounded_search(&self, regex: &Regex, content: &str) -> std::result::Result<bool, ()> {
        let started = Instant::now();
        let bytes = content.len();

        let mut offset = 0;
        loop {
            if started.elapsed() > self.scan_budget {
                return Err(());
            }

            let end = (offset + SCAN_WINDOW).min(bytes);
            let window_start = floor_char_boundary(content, offset);
            let window_end = floor_char_boundary(content, end);
            if regex.is_match(&content[window_start..window_end]) {
                return Ok(true);
            }

            if end >= bytes {
                return Ok(false);
            }
            offset = end.saturating_sub(SCAN_OVERLAP);
        }
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[async_trait]
impl Guardrail for RegexGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GuardrailType {
        GuardrailType::Regex
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
            "type": GuardrailType::Regex.as_str(),
            "enabled": self.is_enabled(),
            "patterns": self.patterns.iter().map(|p| p.source.clone()).collect::<Vec<_>>(),
            "case_sensitive": self.case_sensitive,
            "on_error": self.on_error.to_string(),
        })
    }

    fn update_config(&mut self, config: &Map<String, Value>) -> std::result::Result<(), GuardrailError> {
        if let Some(case_sensitive) = config.get("case_sensitive").and_then(Value::as_bool) {
            self.case_sensitive = case_sensitive;
        }
        if let Some(sources) = config.get("patterns").and_then(Value::as_array) {
            let mut patterns = Vec::new();
            for source in sources.iter().filter_map(Value::as_str) {
                validate_pattern_safety(source).map_err(|reason| {
                    GuardrailError::config(format!("unsafe regex pattern '{source}': {reason}"))
                })?;
                let regex = RegexBuilder::new(source)
                    .case_insensitive(!self.case_sensitive)
                    .size_limit(1 << 20)
                    .build()
                    .map_err(|e| {
                        GuardrailError::config(format!("invalid regex pattern '{source}': {e}"))
                    })?;
                patterns.push(CompiledPattern {
                    regex,
                    source: source.to_string(),
                });
            }
            self.patterns = patterns;
        }
        if let Some(enabled) = config.get("enabled").and_then(Value::as_bool) {
            self.set_enabled(enabled);
        }
        Ok(())
    }

    fn validation_rules(&self) -> Vec<ValidationRule> {
        let mut rules = validator::common_rules();
        rules.push(ValidationRule::required("patterns", RuleKind::StrList));
        rules.push(ValidationRule::optional("case_sensitive", RuleKind::Bool));
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

        if content.is_empty() || self.patterns.is_empty() {
            return Ok(GuardrailResult::allow(
                &self.name,
                self.kind(),
                "No content or patterns to match",
            )
            .with_detail("patterns_count", json!(self.patterns.len()))
            .with_risk_level(RiskLevel::Low));
        }

        let mut matched = Vec::new();
        let mut skipped = Vec::new();
        for pattern in &self.patterns {
            match self.bounded_search(&pattern.regex, content) {
                Ok(true) => matched.push(pattern.source.clone()),
                Ok(false) => {}
                Err(()) => {
                    tracing::warn!(
                        guardrail = %self.name,
                        pattern = %pattern.source,
                        "regex scan exceeded time budget; pattern skipped"
                    );
                    skipped.push(pattern.source.clone());
                }
            }
        }

        if matched.is_empty() {
            let mut result =
                GuardrailResult::allow(&self.name, self.kind(), "No pattern matches found")
                    .with_detail("matched_patterns", json!([]))
                    .with_detail("total_patterns", json!(self.patterns.len()))
                    .with_risk_level(RiskLevel::Low);
            if !skipped.is_empty() {
                result = result.with_detail("skipped_patterns", json!(skipped));
            }
            return Ok(result);
        }

        let mut result = GuardrailResult::blocked(
            &self.name,
            self.kind(),
            format!("Matched patterns: {}", matched.join(", ")),
        )
        .with_confidence(1.0)
        .with_detail("matched_patterns", json!(matched))
        .with_detail("total_patterns", json!(self.patterns.len()))
        .with_risk_level(RiskLevel::High);
        if !skipped.is_empty() {
            result = result.with_detail("skipped_patterns", json!(skipped));
        }
        Ok(result)
    }
}
