//! Preset pipeline configurations for common deployment scenarios.

use serde_json::json;

use super::PipelineConfig;
use crate::error::{Error, Result};

/// Ready-to-use pipeline configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Toxicity, PII, and code-generation checks on both stages.
    Basic,
    /// Social-media style moderation with profanity and length checks.
    ContentModeration,
    /// Support interactions: PII first, relaxed toxicity.
    CustomerService,
    /// Healthcare: strict PII with conservative thresholds.
    Medical,
    /// Financial services: strict PII plus prompt-injection defense.
    Financial,
    /// Educational tools: topic gating plus toxicity checks.
    Educational,
}

impl Preset {
    /// All presets with their names.
    pub fn all() -> &'static [Preset] {
        &[
            Preset::Basic,
            Preset::ContentModeration,
            Preset::CustomerService,
            Preset::Medical,
            Preset::Financial,
            Preset::Educational,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Basic => "basic",
            Preset::ContentModeration => "content_moderation",
            Preset::CustomerService => "customer_service",
            Preset::Medical => "medical",
            Preset::Financial => "financial",
            Preset::Educational => "educational",
        }
    }

    /// One-line description shown in listings.
    pub fn description(&self) -> &'static str {
        match self {
            Preset::Basic => "Toxicity, PII, and code-generation checks on input and output",
            Preset::ContentModeration => "Moderation for user-generated content platforms",
            Preset::CustomerService => "Support interactions with PII protection",
            Preset::Medical => "Healthcare applications with strict PII handling",
            Preset::Financial => "Financial services with injection defense",
            Preset::Educational => "Educational tools with topic gating",
        }
    }

    /// Resolves a preset by name.
    pub fn by_name(name: &str) -> Result<Preset> {
        Preset::all()
            .iter()
            .copied()
            .find(|p| p.name() == name)
            .ok_or_else(|| {
                let valid: Vec<&str> = Preset::all().iter().map(|p| p.name()).collect();
                Error::config(format!(
                    "unknown preset '{name}'; available presets: {}",
                    valid.join(", ")
                ))
            })
    }

    /// The concrete pipeline configuration for this preset.
    pub fn config(&self) -> PipelineConfig {
        let value = match self {
            Preset::Basic => json!({
                "version": "1.0",
                "pipeline": {
                    "input": [
                        {"name": "toxicity_check", "type": "simple_toxicity_detection", "enabled": true, "on_error": "block"},
                        {"name": "pii_check", "type": "simple_pii_detection", "enabled": true, "on_error": "warn"},
                        {"name": "code_generation_check", "type": "simple_code_generation", "enabled": true, "on_error": "block"}
                    ],
                    "output": [
                        {"name": "toxicity_check", "type": "simple_toxicity_detection", "enabled": true, "on_error": "block"},
                        {"name": "pii_check", "type": "simple_pii_detection", "enabled": true, "on_error": "warn"},
                        {"name": "code_generation_check", "type": "simple_code_generation", "enabled": true, "on_error": "block"}
                    ]
                }
            }),
            Preset::ContentModeration => json!({
                "version": "1.0",
                "pipeline": {
                    "input": [
                        {"name": "toxicity_check", "type": "simple_toxicity_detection", "enabled": true, "on_error": "block",
                         "config": {"categories": ["hate_speech", "harassment", "threats", "sexual_harassment"], "confidence_threshold": 0.7}},
                        {"name": "length_check", "type": "length", "enabled": true, "on_error": "warn",
                         "config": {"max_length": 1000, "min_length": 1}}
                    ],
                    "output": [
                        {"name": "toxicity_check", "type": "simple_toxicity_detection", "enabled": true, "on_error": "block"},
                        {"name": "pii_check", "type": "simple_pii_detection", "enabled": true, "on_error": "warn"}
                    ]
                }
            }),
            Preset::CustomerService => json!({
                "version": "1.0",
                "pipeline": {
                    "input": [
                        {"name": "pii_check", "type": "simple_pii_detection", "enabled": true, "on_error": "block",
                         "config": {"confidence_threshold": 0.6}},
                        {"name": "toxicity_check", "type": "simple_toxicity_detection", "enabled": true, "on_error": "warn",
                         "config": {"categories": ["harassment", "threats"], "confidence_threshold": 0.8}},
                        {"name": "length_check", "type": "length", "enabled": true, "on_error": "warn",
                         "config": {"max_length": 2000, "min_length": 1}}
                    ],
                    "output": [
                        {"name": "pii_check", "type": "simple_pii_detection", "enabled": true, "on_error": "block",
                         "config": {"confidence_threshold": 0.6}},
                        {"name": "toxicity_check", "type": "simple_toxicity_detection", "enabled": true, "on_error": "block"}
                    ]
                }
            }),
            Preset::Medical => json!({
                "version": "1.0",
                "pipeline": {
                    "input": [
                        {"name": "pii_check", "type": "simple_pii_detection", "enabled": true, "on_error": "block",
                         "config": {"confidence_threshold": 0.5,
                                    "patterns": ["ssn", "credit_card", "email", "phone", "ip_address", "driver_license", "passport", "bank_account"]}},
                        {"name": "toxicity_check", "type": "simple_toxicity_detection", "enabled": true, "on_error": "block",
                         "config": {"confidence_threshold": 0.6}}
                    ],
                    "output": [
                        {"name": "pii_check", "type": "simple_pii_detection", "enabled": true, "on_error": "block",
                         "config": {"confidence_threshold": 0.5}},
                        {"name": "toxicity_check", "type": "simple_toxicity_detection", "enabled": true, "on_error": "block"}
                    ]
                }
            }),
            Preset::Financial => json!({
                "version": "1.0",
                "pipeline": {
                    "input": [
                        {"name": "pii_check", "type": "simple_pii_detection", "enabled": true, "on_error": "block",
                         "config": {"confidence_threshold": 0.5}},
                        {"name": "injection_check", "type": "prompt_injection", "enabled": true, "on_error": "block",
                         "config": {"risk_threshold": 60, "block_levels": ["medium", "high", "critical"]}},
                        {"name": "code_generation_check", "type": "simple_code_generation", "enabled": true, "on_error": "block"}
                    ],
                    "output": [
                        {"name": "pii_check", "type": "simple_pii_detection", "enabled": true, "on_error": "block",
                         "config": {"confidence_threshold": 0.5}}
                    ]
                }
            }),
            Preset::Educational => json!({
                "version": "1.0",
                "pipeline": {
                    "input": [
                        {"name": "toxicity_check", "type": "simple_toxicity_detection", "enabled": true, "on_error": "block",
                         "config": {"confidence_threshold": 0.6}},
                        {"name": "topic_check", "type": "topic", "enabled": true, "on_error": "warn",
                         "config": {"mode": "deny", "deny_topics": ["gambling", "weapons"], "confidence_threshold": 0.5}},
                        {"name": "length_check", "type": "length", "enabled": true, "on_error": "warn",
                         "config": {"max_length": 5000, "min_length": 1}}
                    ],
                    "output": [
                        {"name": "toxicity_check", "type": "simple_toxicity_detection", "enabled": true, "on_error": "block"},
                        {"name": "pii_check", "type": "simple_pii_detection", "enabled": true, "on_error": "warn"}
                    ]
                }
            }),
        };

        serde_json::from_value(value).expect("preset configs are valid")
    }
}
