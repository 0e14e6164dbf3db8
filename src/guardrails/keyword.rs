//! Keyword blocking guardrails.
//!
//! `keyword_list` blocks content containing any of a list of keywords;
//! `keyword_block` is the single-keyword variant. Keywords load inline or
//! from a file (one per line, `#` comments) resolved relative to the
//! config file's directory. Matching is substring-based with an optional
//! case-sensitivity flag, after NFKC normalization to defeat Unicode
//! confusable bypasses.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use unicode_normalization::UnicodeNormalization;

use crate::config::{GuardrailSpec, OnError, ValidationRule, validator};
use crate::conversation::Conversation;
use crate::error::Result;
use crate::sanitize;
use crate::validation::default_validator;

use super::{Guardrail, GuardrailError, GuardrailResult, GuardrailType, RiskLevel};

/// Substring keyword guardrail backing both `keyword_list` and
/// `keyword_block`.
pub struct KeywordGuardrail {
    name: String,
    kind: GuardrailType,
    enabled: AtomicBool,
    keywords: Vec<String>,
    case_sensitive: bool,
    keywords_file: Option<String>,
    on_error: OnError,
}

impl KeywordGuardrail {
    pub fn new(name: &str, kind: GuardrailType, spec: &GuardrailSpec) -> Result<Self> {
        let rules = validator::keyword_rules();
        validator::ConfigValidator::new(rules).validate(&spec.config)?;

        let case_sensitive = spec.config_bool("case_sensitive").unwrap_or(false);
        let keywords_file = spec.config_str("keywords_file").map(str::to_string);

        let mut inline: Vec<String> = spec.config_str_list("keywords").unwrap_or_default();
        // keyword_block accepts a single `keyword` key.
        if let Some(single) = spec.config_str("keyword") {
            inline.push(single.to_string());
        }

        let mut keywords = match &keywords_file {
            Some(file) => {
                match load_keywords_file(file, spec.config_dir.as_deref()) {
                    Ok(mut from_file) => {
                        // File keywords take precedence; inline ones fill in.
                        for kw in inline {
                            if !from_file.contains(&kw) {
                                from_file.push(kw);
                            }
                        }
                        from_file
                    }
                    Err(e) => {
                        let safe = sanitize::safe_error_message(
                            &e,
                            &format!("loading keywords file for {name}"),
                        );
                        tracing::warn!("{safe}; using inline keywords");
                        inline
                    }
                }
            }
            None => inline,
        };

        if keywords.is_empty() {
            return Err(crate::error::Error::config(format!(
                "keyword guardrail '{name}' requires either 'keywords' or 'keywords_file'"
            )));
        }

        default_validator().validate_keywords(&keywords)?;

        if !case_sensitive {
            for keyword in &mut keywords {
                *keyword = keyword.to_lowercase();
            }
        }
        // Normalize keywords the same way content is normalized.
        for keyword in &mut keywords {
            *keyword = keyword.nfkc().collect();
        }

        Ok(Self {
            name: name.to_string(),
            kind,
            enabled: AtomicBool::new(spec.enabled),
            keywords,
            case_sensitive,
            keywords_file,
            on_error: spec.on_error.unwrap_or(OnError::Block),
        })
    }

    fn matches(&self, content: &str) -> Vec<String> {
        // NFKC maps visually similar characters to canonical forms, so
        // fullwidth or styled text cannot slip past a plain keyword.
        let normalized: String = content.nfkc().collect();
        let haystack = if self.case_sensitive {
            normalized
        } else {
            normalized.to_lowercase()
        };

        self.keywords
            .iter()
            .filter(|kw| haystack.contains(kw.as_str()))
            .cloned()
            .collect()
    }
}

fn load_keywords_file(file: &str, config_dir: Option<&Path>) -> std::io::Result<Vec<String>> {
    let resolved = match config_dir {
        Some(dir) => dir.join(file),
        None => Path::new(file).to_path_buf(),
    };

    let raw = std::fs::read_to_string(&resolved)?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[async_trait]
impl Guardrail for KeywordGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GuardrailType {
        self.kind
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
            "type": self.kind.as_str(),
            "enabled": self.is_enabled(),
            "keywords": self.keywords,
            "case_sensitive": self.case_sensitive,
            "keywords_file": self.keywords_file,
            "on_error": self.on_error.to_string(),
        })
    }

    fn update_config(&mut self, config: &Map<String, Value>) -> std::result::Result<(), GuardrailError> {
        if let Some(keywords) = config.get("keywords").and_then(Value::as_array) {
            let mut new_keywords: Vec<String> = keywords
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            if new_keywords.is_empty() {
                return Err(GuardrailError::config("'keywords' must not be empty"));
            }
            if !self.case_sensitive {
                for keyword in &mut new_keywords {
                    *keyword = keyword.to_lowercase();
                }
            }
            self.keywords = new_keywords.iter().map(|k| k.nfkc().collect()).collect();
        }
        if let Some(case_sensitive) = config.get("case_sensitive").and_then(Value::as_bool) {
            self.case_sensitive = case_sensitive;
        }
        if let Some(enabled) = config.get("enabled").and_then(Value::as_bool) {
            self.set_enabled(enabled);
        }
        Ok(())
    }

    fn validation_rules(&self) -> Vec<ValidationRule> {
        validator::keyword_rules()
    }

    async fn analyze(
        &self,
        content: &str,
        _conversation: Option<&Conversation>,
    ) -> std::result::Result<GuardrailResult, GuardrailError> {
        if !self.is_enabled() {
            return Ok(GuardrailResult::allow(&self.name, self.kind, "Guardrail disabled")
                .with_detail("enabled", json!(false)));
        }

        if content.is_empty() {
            return Ok(
                GuardrailResult::allow(&self.name, self.kind, "No content to analyze")
                    .with_detail("keywords_count", json!(self.keywords.len()))
                    .with_risk_level(RiskLevel::Low),
            );
        }

        let matched = self.matches(content);
        if matched.is_empty() {
            return Ok(
                GuardrailResult::allow(&self.name, self.kind, "No keyword matches found")
                    .with_detail("matched_keywords", json!([]))
                    .with_detail("total_keywords", json!(self.keywords.len()))
                    .with_risk_level(RiskLevel::Low),
            );
        }

        // The first match drives the reason; every match lands in details.
        let first = matched[0].clone();
        Ok(GuardrailResult::blocked(
            &self.name,
            self.kind,
            format!("Blocked keyword detected: {first}"),
        )
        .with_confidence(1.0)
        .with_detail("matched_keywords", json!(matched))
        .with_detail("total_keywords", json!(self.keywords.len()))
        .with_detail("case_sensitive", json!(self.case_sensitive))
        .with_risk_level(RiskLevel::High))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_keywords(keywords: &[&str]) -> GuardrailSpec {
        GuardrailSpec::new("kw", "keyword_list").with_config("keywords", json!(keywords))
    }

    fn guardrail(keywords: &[&str]) -> KeywordGuardrail {
        KeywordGuardrail::new("kw", GuardrailType::KeywordList, &spec_with_keywords(keywords))
            .unwrap()
    }

    #[tokio::test]
    async fn test_phrase_match_blocks() {
        let g = guardrail(&["shut up", "go away"]);
        let result = g.analyze("Please shut up and listen!", None).await.unwrap();
        assert!(result.blocked);
        assert!(result.reason.contains("shut up"));
        assert_eq!(result.details["matched_keywords"], json!(["shut up"]));
    }

    #[tokio::test]
    async fn test_partial_phrase_does_not_block() {
        let g = guardrail(&["shut up", "go away"]);
        let result = g.analyze("Please shut the door!", None).await.unwrap();
        assert!(!result.blocked);
    }

    #[tokio::test]
    async fn test_case_insensitive_by_default() {
        let g = guardrail(&["Forbidden"]);
        let result = g.analyze("this is FORBIDDEN content", None).await.unwrap();
        assert!(result.blocked);
    }

    #[tokio::test]
    async fn test_case_sensitive_flag() {
        let spec = spec_with_keywords(&["Secret"]).with_config("case_sensitive", json!(true));
        let g = KeywordGuardrail::new("kw", GuardrailType::KeywordList, &spec).unwrap();

        assert!(g.analyze("a Secret thing", None).await.unwrap().blocked);
        assert!(!g.analyze("a secret thing", None).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_empty_content_not_blocked() {
        let g = guardrail(&["bad"]);
        let result = g.analyze("", None).await.unwrap();
        assert!(!result.blocked);
    }

    #[tokio::test]
    async fn test_unicode_confusables_caught() {
        let g = guardrail(&["password"]);
        // Fullwidth characters normalize to ASCII under NFKC.
        let result = g.analyze("my ｐａｓｓｗｏｒｄ is 1234", None).await.unwrap();
        assert!(result.blocked);
    }

    #[tokio::test]
    async fn test_first_match_drives_reason_all_matches_reported() {
        let g = guardrail(&["alpha", "beta"]);
        let result = g.analyze("alpha then beta", None).await.unwrap();
        assert!(result.reason.contains("alpha"));
        assert_eq!(result.details["matched_keywords"], json!(["alpha", "beta"]));
    }

    #[test]
    fn test_empty_config_rejected() {
        let spec = GuardrailSpec::new("kw", "keyword_list");
        assert!(KeywordGuardrail::new("kw", GuardrailType::KeywordList, &spec).is_err());
    }

    #[tokio::test]
    async fn test_keywords_file_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("blocked.txt"),
            "# blocked terms\nfoo\n\n  bar  \n# trailing comment\n",
        )
        .unwrap();

        let mut spec =
            GuardrailSpec::new("kw", "keyword_list").with_config("keywords_file", json!("blocked.txt"));
        spec.config_dir = Some(dir.path().to_path_buf());

        let g = KeywordGuardrail::new("kw", GuardrailType::KeywordList, &spec).unwrap();
        assert!(g.analyze("foo here", None).await.unwrap().blocked);
        assert!(g.analyze("bar here", None).await.unwrap().blocked);
        assert!(!g.analyze("# blocked terms", None).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_inline() {
        let mut spec = GuardrailSpec::new("kw", "keyword_list")
            .with_config("keywords_file", json!("missing.txt"))
            .with_config("keywords", json!(["inline"]));
        spec.config_dir = Some(std::env::temp_dir());

        let g = KeywordGuardrail::new("kw", GuardrailType::KeywordList, &spec).unwrap();
        assert!(g.analyze("inline content", None).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_keyword_block_single_keyword() {
        let spec = GuardrailSpec::new("block", "keyword_block").with_config("keyword", json!("banned"));
        let g = KeywordGuardrail::new("block", GuardrailType::KeywordBlock, &spec).unwrap();
        assert!(g.analyze("this is banned", None).await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_disabled_allows() {
        let g = guardrail(&["bad"]);
        g.set_enabled(false);
        let result = g.analyze("bad content", None).await.unwrap();
        assert!(!result.blocked);
    }

    #[tokio::test]
    async fn test_update_config_reloads_keywords() {
        let mut g = guardrail(&["old"]);
        let mut update = Map::new();
        update.insert("keywords".to_string(), json!(["new"]));
        g.update_config(&update).unwrap();

        assert!(!g.analyze("old content", None).await.unwrap().blocked);
        assert!(g.analyze("new content", None).await.unwrap().blocked);
    }
}
