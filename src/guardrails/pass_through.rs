//! No-op guardrail. Useful as a pipeline placeholder and in tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::config::{GuardrailSpec, ValidationRule};
use crate::conversation::Conversation;

use super::{Guardrail, GuardrailError, GuardrailResult, GuardrailType};

pub struct PassThroughGuardrail {
    name: String,
    enabled: AtomicBool,
}

impl PassThroughGuardrail {
    pub fn new(name: &str, spec: &GuardrailSpec) -> Self {
        Self {
            name: name.to_string(),
            enabled: AtomicBool::new(spec.enabled),
        }
    }
}

#[async_trait]
impl Guardrail for PassThroughGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GuardrailType {
        GuardrailType::PassThrough
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
            "type": GuardrailType::PassThrough.as_str(),
            "enabled": self.is_enabled(),
        })
    }

    fn update_config(&mut self, config: &Map<String, Value>) -> Result<(), GuardrailError> {
        if let Some(enabled) = config.get("enabled").and_then(Value::as_bool) {
            self.set_enabled(enabled);
        }
        Ok(())
    }

    fn validation_rules(&self) -> Vec<ValidationRule> {
        Vec::new()
    }

    async fn analyze(
        &self,
        _content: &str,
        _conversation: Option<&Conversation>,
    ) -> Result<GuardrailResult, GuardrailError> {
        Ok(GuardrailResult::allow(&self.name, self.kind(), "Pass-through"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_always_allows() {
        let g = PassThroughGuardrail::new("noop", &GuardrailSpec::new("noop", "pass_through"));
        let result = g.analyze("anything at all", None).await.unwrap();
        assert!(!result.blocked);
    }
}
