//! Multi-turn pattern extraction and combined risk scoring.
//!
//! Fuses the model's per-turn verdict with cross-turn signals: a detected
//! manipulation pattern, the count of manipulation techniques, and the
//! conversation length. The result buckets into a risk level and drives
//! the block/warn decision.

use serde_json::Value;

use crate::guardrails::RiskLevel;

use super::InjectionVerdict;

/// Cross-turn manipulation patterns the detector scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiTurnPattern {
    TrustBuilding,
    RolePlaying,
    ContextManipulation,
    InstructionEvolution,
    None,
}

impl MultiTurnPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            MultiTurnPattern::TrustBuilding => "trust_building",
            MultiTurnPattern::RolePlaying => "role_playing",
            MultiTurnPattern::ContextManipulation => "context_manipulation",
            MultiTurnPattern::InstructionEvolution => "instruction_evolution",
            MultiTurnPattern::None => "none",
        }
    }

    fn parse(s: &str) -> MultiTurnPattern {
        match s {
            "trust_building" => MultiTurnPattern::TrustBuilding,
            "role_playing" => MultiTurnPattern::RolePlaying,
            "context_manipulation" => MultiTurnPattern::ContextManipulation,
            "instruction_evolution" => MultiTurnPattern::InstructionEvolution,
            // emotional_manipulation and unknown labels contribute no
            // pattern boost; their techniques still count.
            _ => MultiTurnPattern::None,
        }
    }

    /// Risk-percent boost contributed by this pattern.
    pub fn risk_boost(&self) -> u32 {
        match self {
            MultiTurnPattern::TrustBuilding => 20,
            MultiTurnPattern::RolePlaying => 15,
            MultiTurnPattern::ContextManipulation => 25,
            MultiTurnPattern::InstructionEvolution => 30,
            MultiTurnPattern::None => 0,
        }
    }

    /// Patterns that force a block regardless of score.
    pub fn forces_block(&self) -> bool {
        matches!(
            self,
            MultiTurnPattern::TrustBuilding | MultiTurnPattern::InstructionEvolution
        )
    }
}

impl std::fmt::Display for MultiTurnPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals extracted from the model's multi-turn analysis.
#[derive(Debug, Clone, Default)]
pub struct MultiTurnSignals {
    pub pattern: Option<MultiTurnPattern>,
    pub techniques: Vec<String>,
    pub trust_indicators: Vec<String>,
    pub escalation: Option<String>,
}

impl MultiTurnSignals {
    pub fn pattern(&self) -> MultiTurnPattern {
        self.pattern.unwrap_or(MultiTurnPattern::None)
    }
}

/// Extracts multi-turn signals from a verdict.
///
/// A machine-parseable `multi_turn_analysis` object is preferred; absent
/// that, the comment string is scanned for pattern keywords.
pub fn extract_signals(verdict: &InjectionVerdict) -> MultiTurnSignals {
    if let Some(analysis) = &verdict.multi_turn_analysis {
        return MultiTurnSignals {
            pattern: Some(MultiTurnPattern::parse(
                analysis
                    .get("pattern_detected")
                    .and_then(Value::as_str)
                    .unwrap_or("none"),
            )),
            techniques: str_list(analysis.get("manipulation_techniques")),
            trust_indicators: str_list(analysis.get("trust_building_indicators")),
            escalation: analysis
                .get("escalation_pattern")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
    }

    signals_from_comment(&verdict.comment)
}

fn str_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Keyword-based signal extraction from the model's comment, for providers
/// that return prose instead of the structured sub-object.
fn signals_from_comment(comment: &str) -> MultiTurnSignals {
    let lowered = comment.to_lowercase();
    let mut signals = MultiTurnSignals::default();

    if ["trust", "friendly", "helpful"].iter().any(|w| lowered.contains(w)) {
        signals.pattern = Some(MultiTurnPattern::TrustBuilding);
        signals.trust_indicators.push("friendly tone".to_string());
    }
    if ["role", "pretend", "act"].iter().any(|w| lowered.contains(w)) {
        signals.pattern = Some(MultiTurnPattern::RolePlaying);
        signals.techniques.push("role_confusion".to_string());
    }
    if ["ignore", "forget", "bypass"].iter().any(|w| lowered.contains(w)) {
        signals.techniques.push("instruction_ignoring".to_string());
    }

    signals
}

/// The fused risk assessment for a multi-turn analysis.
#[derive(Debug, Clone)]
pub struct CombinedRisk {
    pub risk_percent: u32,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub should_block: bool,
    pub should_warn: bool,
    pub indicators: Vec<String>,
    pub pattern: MultiTurnPattern,
    pub base_risk_percent: u32,
    pub pattern_boost: u32,
    pub technique_boost: u32,
    pub exchange_factor: u32,
}

/// Fuses the single-turn verdict with multi-turn signals.
///
/// `combined = min(100, base + pattern_boost + 10 x techniques +
/// min(20, 2 x turns))`, bucketed at 80/60/40 into
/// critical/high/medium/low.
pub fn assess_combined_risk(
    verdict: &InjectionVerdict,
    signals: &MultiTurnSignals,
    turn_count: usize,
    risk_threshold: u32,
    block_levels: &[RiskLevel],
    warn_levels: &[RiskLevel],
) -> CombinedRisk {
    let pattern = signals.pattern();
    let pattern_boost = pattern.risk_boost();
    let technique_boost = signals.techniques.len() as u32 * 10;
    let exchange_factor = (turn_count as u32 * 2).min(20);

    let risk_percent =
        (verdict.risk_percent + pattern_boost + technique_boost + exchange_factor).min(100);

    let risk_level = if risk_percent >= 80 {
        RiskLevel::Critical
    } else if risk_percent >= 60 {
        RiskLevel::High
    } else if risk_percent >= 40 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    let should_block = risk_percent >= risk_threshold
        || block_levels.contains(&risk_level)
        || pattern.forces_block();
    let should_warn =
        !should_block && (warn_levels.contains(&risk_level) || pattern != MultiTurnPattern::None);

    let mut indicators = verdict.indicators.clone();
    if pattern != MultiTurnPattern::None {
        indicators.push(format!("multi_turn_pattern: {pattern}"));
    }
    for technique in &signals.techniques {
        indicators.push(format!("technique: {technique}"));
    }

    CombinedRisk {
        risk_percent,
        risk_level,
        confidence: verdict.confidence,
        should_block,
        should_warn,
        indicators,
        pattern,
        base_risk_percent: verdict.risk_percent,
        pattern_boost,
        technique_boost,
        exchange_factor,
    }
}
