//! URL filtering guardrail.
//!
//! Extracts URLs (scheme + authority + path), normalizes hosts to
//! lowercase, and applies exact-host block/allow lists. Subdomains are not
//! matched automatically — `evil.example.com` does not match a blocked
//! `example.com` — unless `include_subdomains` is set.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};
use url::Url;

use crate::config::{GuardrailSpec, OnError, RuleKind, ValidationRule, validator};
use crate::conversation::Conversation;
use crate::error::Result;

use super::{Guardrail, GuardrailError, GuardrailResult, GuardrailType, RiskLevel};

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[a-zA-Z][a-zA-Z0-9+.-]*://[^\s<>"'()\[\]]+"#).expect("valid regex"));

pub struct UrlGuardrail {
    name: String,
    enabled: AtomicBool,
    blocked_domains: Vec<String>,
    allowed_domains: Option<Vec<String>>,
    include_subdomains: bool,
    on_error: OnError,
}

impl UrlGuardrail {
    pub fn new(name: &str, spec: &GuardrailSpec) -> Result<Self> {
        let mut rules = validator::common_rules();
        rules.push(ValidationRule::optional("blocked_domains", RuleKind::StrList));
        rules.push(ValidationRule::optional("allowed_domains", RuleKind::StrList));
        rules.push(ValidationRule::optional("include_subdomains", RuleKind::Bool));
        validator::ConfigValidator::new(rules).validate(&spec.config)?;

        let normalize = |domains: Vec<String>| -> Vec<String> {
            domains.into_iter().map(|d| d.to_lowercase()).collect()
        };

        Ok(Self {
            name: name.to_string(),
            enabled: AtomicBool::new(spec.enabled),
            blocked_domains: normalize(spec.config_str_list("blocked_domains").unwrap_or_default()),
            allowed_domains: spec.config_str_list("allowed_domains").map(normalize),
            include_subdomains: spec.config_bool("include_subdomains").unwrap_or(false),
            on_error: spec.on_error.unwrap_or(OnError::Block),
        })
    }

    fn host_matches(&self, host: &str, domain: &str) -> bool {
        host == domain
            || (self.include_subdomains && host.ends_with(&format!(".{domain}")))
    }

    fn extract_hosts(content: &str) -> Vec<(String, String)> {
        URL_RE
            .find_iter(content)
            .filter_map(|m| {
                let url = Url::parse(m.as_str()).ok()?;
                let host = url.host_str()?.to_lowercase();
                Some((m.as_str().to_string(), host))
            })
            .collect()
    }
}

#[async_trait]
impl Guardrail for UrlGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GuardrailType {
        GuardrailType::Url
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
            "type": GuardrailType::Url.as_str(),
            "enabled": self.is_enabled(),
            "blocked_domains": self.blocked_domains,
            "allowed_domains": self.allowed_domains,
            "include_subdomains": self.include_subdomains,
            "on_error": self.on_error.to_string(),
        })
    }

    fn update_config(&mut self, config: &Map<String, Value>) -> std::result::Result<(), GuardrailError> {
        let as_domains = |value: &Value| -> Option<Vec<String>> {
            value.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_lowercase)
                    .collect()
            })
        };
        if let Some(domains) = config.get("blocked_domains").and_then(|v| as_domains(v)) {
            self.blocked_domains = domains;
        }
        if let Some(domains) = config.get("allowed_domains").and_then(|v| as_domains(v)) {
            self.allowed_domains = Some(domains);
        }
        if let Some(include) = config.get("include_subdomains").and_then(Value::as_bool) {
            self.include_subdomains = include;
        }
        if let Some(enabled) = config.get("enabled").and_then(Value::as_bool) {
            self.set_enabled(enabled);
        }
        Ok(())
    }

    fn validation_rules(&self) -> Vec<ValidationRule> {
        let mut rules = validator::common_rules();
        rules.push(ValidationRule::optional("blocked_domains", RuleKind::StrList));
        rules.push(ValidationRule::optional("allowed_domains", RuleKind::StrList));
        rules.push(ValidationRule::optional("include_subdomains", RuleKind::Bool));
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

        let hosts = Self::extract_hosts(content);
        if hosts.is_empty() {
            return Ok(GuardrailResult::allow(&self.name, self.kind(), "No URLs found")
                .with_detail("urls_found", json!(0)));
        }

        let mut blocked_urls = Vec::new();
        for (raw_url, host) in &hosts {
            let denied = self
                .blocked_domains
                .iter()
                .any(|domain| self.host_matches(host, domain));
            let not_allowed = self.allowed_domains.as_ref().is_some_and(|allowed| {
                !allowed.iter().any(|domain| self.host_matches(host, domain))
            });
            if denied || not_allowed {
                blocked_urls.push(json!({"url": raw_url, "host": host}));
            }
        }

        if blocked_urls.is_empty() {
            return Ok(GuardrailResult::allow(&self.name, self.kind(), "All URLs permitted")
                .with_detail("urls_found", json!(hosts.len())));
        }

        let hosts_list: Vec<&str> = blocked_urls
            .iter()
            .filter_map(|u| u["host"].as_str())
            .collect();
        Ok(GuardrailResult::blocked(
            &self.name,
            self.kind(),
            format!("Disallowed URLs: {}", hosts_list.join(", ")),
        )
        .with_confidence(1.0)
        .with_detail("blocked_urls", json!(blocked_urls))
        .with_detail("urls_found", json!(hosts.len()))
        .with_risk_level(RiskLevel::Medium))
    }
}
