//! Guardrail registry and factory.
//!
//! The registry maps names to live guardrail instances (unique keys) and
//! guardrail types to factory closures. [`GuardrailRegistry::build_from_spec`]
//! is the single entry point the pipeline uses to turn a config entry into
//! a running guardrail.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::GuardrailSpec;
use crate::error::{Error, Result};
use crate::providers::ChatProvider;

use super::{Guardrail, GuardrailType};

/// Factory signature: build a named guardrail from its config entry.
pub type GuardrailFactory =
    Box<dyn Fn(&str, &GuardrailSpec) -> Result<Box<dyn Guardrail>> + Send + Sync>;

/// Registry of guardrail instances and type factories.
#[derive(Default)]
pub struct GuardrailRegistry {
    guardrails: HashMap<String, Box<dyn Guardrail>>,
    factories: HashMap<GuardrailType, GuardrailFactory>,
}

impl GuardrailRegistry {
    /// Empty registry with no factories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in guardrail factory registered.
    ///
    /// `provider` backs the AI detectors, the prompt-injection detector,
    /// and content moderation; pass `None` to construct them in
    /// unavailable mode (their `on_error` policy then governs results).
    pub fn with_default_factories(provider: Option<Arc<dyn ChatProvider>>) -> Self {
        let mut registry = Self::new();
        registry.register_default_factories(provider);
        registry
    }

    /// Registers all built-in factories, replacing any already present.
    pub fn register_default_factories(&mut self, provider: Option<Arc<dyn ChatProvider>>) {
        use super::ai::{AiDetectionKind, AiDetector};
        use super::code_gen::CodeGenerationGuardrail;
        use super::injection::PromptInjectionGuardrail;
        use super::keyword::KeywordGuardrail;
        use super::length::LengthGuardrail;
        use super::moderation::ContentModerationGuardrail;
        use super::pass_through::PassThroughGuardrail;
        use super::pii::PiiGuardrail;
        use super::regex_rule::RegexGuardrail;
        use super::topic::TopicGuardrail;
        use super::url_filter::UrlGuardrail;

        self.register_factory(
            GuardrailType::KeywordList,
            Box::new(|name, spec| {
                Ok(Box::new(KeywordGuardrail::new(name, GuardrailType::KeywordList, spec)?) as _)
            }),
        );
        self.register_factory(
            GuardrailType::KeywordBlock,
            Box::new(|name, spec| {
                Ok(Box::new(KeywordGuardrail::new(name, GuardrailType::KeywordBlock, spec)?) as _)
            }),
        );
        self.register_factory(
            GuardrailType::Regex,
            Box::new(|name, spec| Ok(Box::new(RegexGuardrail::new(name, spec)?) as _)),
        );
        self.register_factory(
            GuardrailType::Length,
            Box::new(|name, spec| Ok(Box::new(LengthGuardrail::new(name, spec)?) as _)),
        );
        self.register_factory(
            GuardrailType::Url,
            Box::new(|name, spec| Ok(Box::new(UrlGuardrail::new(name, spec)?) as _)),
        );
        self.register_factory(
            GuardrailType::Topic,
            Box::new(|name, spec| Ok(Box::new(TopicGuardrail::new(name, spec)?) as _)),
        );
        self.register_factory(
            GuardrailType::PassThrough,
            Box::new(|name, spec| Ok(Box::new(PassThroughGuardrail::new(name, spec)) as _)),
        );
        self.register_factory(
            GuardrailType::SimplePiiDetection,
            Box::new(|name, spec| Ok(Box::new(PiiGuardrail::new(name, spec)?) as _)),
        );
        self.register_factory(
            GuardrailType::SimpleToxicityDetection,
            Box::new(|name, spec| {
                Ok(Box::new(super::toxicity::ToxicityGuardrail::new(name, spec)?) as _)
            }),
        );
        self.register_factory(
            GuardrailType::SimpleCodeGeneration,
            Box::new(|name, spec| Ok(Box::new(CodeGenerationGuardrail::new(name, spec)?) as _)),
        );

        let p = provider.clone();
        self.register_factory(
            GuardrailType::AiPiiDetection,
            Box::new(move |name, spec| {
                Ok(Box::new(AiDetector::new(name, AiDetectionKind::Pii, spec, p.clone())?) as _)
            }),
        );
        let p = provider.clone();
        self.register_factory(
            GuardrailType::AiToxicityDetection,
            Box::new(move |name, spec| {
                Ok(Box::new(AiDetector::new(name, AiDetectionKind::Toxicity, spec, p.clone())?) as _)
            }),
        );
        let p = provider.clone();
        self.register_factory(
            GuardrailType::AiCodeGeneration,
            Box::new(move |name, spec| {
                Ok(Box::new(AiDetector::new(
                    name,
                    AiDetectionKind::CodeGeneration,
                    spec,
                    p.clone(),
                )?) as _)
            }),
        );
        let p = provider.clone();
        self.register_factory(
            GuardrailType::ContentModeration,
            Box::new(move |name, spec| {
                Ok(Box::new(ContentModerationGuardrail::new(name, spec, p.clone())?) as _)
            }),
        );
        let p = provider;
        self.register_factory(
            GuardrailType::PromptInjection,
            Box::new(move |name, spec| {
                Ok(Box::new(PromptInjectionGuardrail::new(name, spec, p.clone())?) as _)
            }),
        );
    }

    /// Registers (or replaces) a factory for a guardrail type.
    pub fn register_factory(&mut self, kind: GuardrailType, factory: GuardrailFactory) {
        self.factories.insert(kind, factory);
    }

    /// Creates a guardrail via the registered factory.
    ///
    /// Returns `Ok(None)` when no factory exists for the type; factory
    /// errors propagate, never silently swallowed.
    pub fn create_guardrail(
        &self,
        kind: GuardrailType,
        name: &str,
        spec: &GuardrailSpec,
    ) -> Result<Option<Box<dyn Guardrail>>> {
        match self.factories.get(&kind) {
            Some(factory) => match factory(name, spec) {
                Ok(guardrail) => Ok(Some(guardrail)),
                Err(e) => {
                    tracing::error!(
                        guardrail = name,
                        kind = %kind,
                        error = %e,
                        "factory failed to create guardrail"
                    );
                    Err(e)
                }
            },
            None => Ok(None),
        }
    }

    /// Builds a guardrail from a full config entry, validating `name` and
    /// `type` presence and type membership.
    pub fn build_from_spec(&self, spec: &GuardrailSpec) -> Result<Option<Box<dyn Guardrail>>> {
        let (Some(name), Some(kind_str)) = (spec.name.as_deref(), spec.kind.as_deref()) else {
            return Err(Error::config(
                "Guardrail configuration must include 'name' and 'type' fields",
            ));
        };

        let kind: GuardrailType = kind_str.parse().map_err(|_| Error::InvalidGuardrailType {
            requested: kind_str.to_string(),
            valid: GuardrailType::all().iter().map(|t| t.as_str().to_string()).collect(),
        })?;

        self.create_guardrail(kind, name, spec)
    }

    /// Registers a live instance under its name. An existing instance with
    /// the same name is replaced (keys are unique).
    pub fn register_guardrail(&mut self, guardrail: Box<dyn Guardrail>) {
        self.guardrails.insert(guardrail.name().to_string(), guardrail);
    }

    /// Removes an instance by name. Returns whether it existed.
    pub fn unregister_guardrail(&mut self, name: &str) -> bool {
        self.guardrails.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Guardrail> {
        self.guardrails.get(name).map(Box::as_ref)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Guardrail>> {
        self.guardrails.get_mut(name)
    }

    /// Names of all registered instances.
    pub fn names(&self) -> Vec<String> {
        self.guardrails.keys().cloned().collect()
    }

    /// All registered instances of a given type.
    pub fn by_type(&self, kind: GuardrailType) -> Vec<&dyn Guardrail> {
        self.guardrails
            .values()
            .filter(|g| g.kind() == kind)
            .map(Box::as_ref)
            .collect()
    }

    /// Clears all instances and factories.
    pub fn clear(&mut self) {
        self.guardrails.clear();
        self.factories.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::GuardrailSpec;

    fn keyword_spec() -> GuardrailSpec {
        GuardrailSpec::new("kw", "keyword_list").with_config("keywords", json!(["bad"]))
    }

    #[test]
    fn test_build_from_spec() {
        let registry = GuardrailRegistry::with_default_factories(None);
        let guardrail = registry.build_from_spec(&keyword_spec()).unwrap().unwrap();
        assert_eq!(guardrail.name(), "kw");
        assert_eq!(guardrail.kind(), GuardrailType::KeywordList);
    }

    #[test]
    fn test_missing_name_or_type() {
        let registry = GuardrailRegistry::with_default_factories(None);

        let mut spec = keyword_spec();
        spec.name = None;
        assert!(matches!(
            registry.build_from_spec(&spec),
            Err(Error::Config { .. })
        ));

        let mut spec = keyword_spec();
        spec.kind = None;
        assert!(matches!(
            registry.build_from_spec(&spec),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_unknown_type_lists_valid_types() {
        let registry = GuardrailRegistry::with_default_factories(None);
        let mut spec = keyword_spec();
        spec.kind = Some("telepathy".to_string());

        let err = match registry.build_from_spec(&spec) {
            Err(e) => e,
            Ok(_) => panic!("expected build_from_spec to fail"),
        };
        match err {
            Error::InvalidGuardrailType { requested, valid } => {
                assert_eq!(requested, "telepathy");
                assert!(valid.contains(&"keyword_list".to_string()));
                assert!(valid.contains(&"prompt_injection".to_string()));
            }
            other => panic!("expected InvalidGuardrailType, got {other:?}"),
        }
    }

    #[test]
    fn test_no_factory_returns_none() {
        let registry = GuardrailRegistry::new();
        let result = registry
            .create_guardrail(GuardrailType::KeywordList, "kw", &keyword_spec())
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_factory_error_propagates() {
        let registry = GuardrailRegistry::with_default_factories(None);
        // Keyword guardrail with neither keywords nor keywords_file.
        let spec = GuardrailSpec::new("kw", "keyword_list");
        assert!(registry.build_from_spec(&spec).is_err());
    }

    #[test]
    fn test_register_get_unregister() {
        let factory_registry = GuardrailRegistry::with_default_factories(None);
        let guardrail = factory_registry.build_from_spec(&keyword_spec()).unwrap().unwrap();

        let mut registry = GuardrailRegistry::new();
        registry.register_guardrail(guardrail);
        assert!(registry.get("kw").is_some());
        assert_eq!(registry.by_type(GuardrailType::KeywordList).len(), 1);
        assert_eq!(registry.names(), vec!["kw".to_string()]);

        assert!(registry.unregister_guardrail("kw"));
        assert!(!registry.unregister_guardrail("kw"));
        assert!(registry.get("kw").is_none());
    }

    #[test]
    fn test_clear() {
        let mut registry = GuardrailRegistry::with_default_factories(None);
        registry.clear();
        let result = registry
            .create_guardrail(GuardrailType::KeywordList, "kw", &keyword_spec())
            .unwrap();
        assert!(result.is_none());
    }
}
