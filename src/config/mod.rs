//! Pipeline configuration: schema, file loading, validation, presets.
//!
//! The canonical config shape (YAML or JSON):
//!
//! ```yaml
//! version: "1.0"
//! pipeline:
//!   input:
//!     - name: pii_check
//!       type: simple_pii_detection
//!       enabled: true
//!       on_error: block
//!       config:
//!         confidence_threshold: 0.6
//!   output: []
//! ```

pub mod presets;
pub mod validator;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use presets::Preset;
pub use validator::{ConfigValidator, RuleKind, ValidationRule};

use crate::error::{Error, Result};
use crate::validation::default_validator;

/// Error policy for a guardrail: what the pipeline does when the guardrail
/// itself fails, and the action a blocking verdict maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    Allow,
    Warn,
    #[default]
    Block,
}

impl std::fmt::Display for OnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnError::Allow => write!(f, "allow"),
            OnError::Warn => write!(f, "warn"),
            OnError::Block => write!(f, "block"),
        }
    }
}

/// One guardrail entry in a pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuardrailSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Unset lets each guardrail type apply its own default policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Directory of the config file this spec was loaded from; used to
    /// resolve relative paths such as `keywords_file`. Not serialized.
    #[serde(skip)]
    pub config_dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

impl GuardrailSpec {
    /// Creates a spec programmatically.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            kind: Some(kind.into()),
            enabled: true,
            on_error: None,
            config: Map::new(),
            config_dir: None,
        }
    }

    /// Sets a config key (builder-style).
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Sets the error policy (builder-style).
    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = Some(on_error);
        self
    }

    /// Disables the entry (builder-style).
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Looks up a key in the type-specific config map.
    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn config_f64(&self, key: &str) -> Option<f64> {
        self.config_value(key).and_then(Value::as_f64)
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config_value(key).and_then(Value::as_u64)
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config_value(key).and_then(Value::as_bool)
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config_value(key).and_then(Value::as_str)
    }

    pub fn config_str_list(&self, key: &str) -> Option<Vec<String>> {
        self.config_value(key).and_then(|v| {
            v.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
        })
    }

    /// Number of user regex patterns this entry contributes, for
    /// pipeline-level limits.
    pub fn regex_pattern_count(&self) -> usize {
        if self.kind.as_deref() == Some("regex") {
            self.config_value("patterns")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0)
        } else {
            0
        }
    }
}

/// The two guardrail stages.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StageSet {
    #[serde(default)]
    pub input: Vec<GuardrailSpec>,
    #[serde(default)]
    pub output: Vec<GuardrailSpec>,
}

/// A full pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub pipeline: StageSet,
}

impl PipelineConfig {
    /// Total guardrail entries across both stages.
    pub fn guardrail_count(&self) -> usize {
        self.pipeline.input.len() + self.pipeline.output.len()
    }

    /// Total user regex patterns across both stages.
    pub fn regex_pattern_count(&self) -> usize {
        self.pipeline
            .input
            .iter()
            .chain(self.pipeline.output.iter())
            .map(GuardrailSpec::regex_pattern_count)
            .sum()
    }

    /// Stamps every spec with the directory its config file lives in.
    fn set_config_dir(&mut self, dir: &Path) {
        for spec in self
            .pipeline
            .input
            .iter_mut()
            .chain(self.pipeline.output.iter_mut())
        {
            spec.config_dir = Some(dir.to_path_buf());
        }
    }
}

/// Loads a pipeline configuration from a YAML or JSON file.
///
/// The file is size- and extension-checked first; parse errors surface as
/// configuration errors with the offending path reduced to a basename in
/// production.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    default_validator().validate_file(path, "config", &["yaml", "yml", "json"])?;

    let raw = std::fs::read_to_string(path)?;
    let mut config: PipelineConfig = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw).map_err(|e| parse_error(path, &e))?,
        _ => serde_yaml::from_str(&raw).map_err(|e| parse_error(path, &e))?,
    };

    if let Some(dir) = path.parent() {
        config.set_config_dir(dir);
    }
    Ok(config)
}

fn parse_error(path: &Path, error: &dyn std::fmt::Display) -> Error {
    let safe_path = crate::sanitize::sanitize_path(&path.display().to_string());
    Error::config(format!("failed to parse config file {safe_path}: {error}"))
}
