//! Pipeline executor: ordered, failure-tolerant guardrail evaluation.
//!
//! A [`Pipeline`] owns two guardrail stages built from configuration. Each
//! check validates the content, consults the global and per-conversation
//! rate limiters, runs every enabled guardrail through `analyze_safe`, and
//! aggregates a [`PipelineVerdict`] while the audit trail records the
//! content and every decision.
//!
//! The pipeline never stops on the first block: callers learn every
//! reason. A concurrent variant joins guardrails as they complete;
//! aggregation is order-independent because each verdict is keyed by
//! guardrail name.
//!
//! # Example
//!
//! ```rust,ignore
//! use palisade::pipeline::{CheckContext, Pipeline};
//!
//! let pipeline = Pipeline::from_preset(palisade::config::Preset::CustomerService)?;
//! let verdict = pipeline.check_input("Hello!", &CheckContext::default()).await;
//! if verdict.blocked {
//!     eprintln!("blocked: {:?}", verdict.reasons);
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::audit::{AuditContext, AuditTrail, Decision, global_audit};
use crate::config::{GuardrailSpec, OnError, PipelineConfig, Preset, load_config};
use crate::conversation::{Conversation, RateLimitAction};
use crate::error::{Error, Result};
use crate::guardrails::{Guardrail, GuardrailRegistry, GuardrailResult};
use crate::providers::{ChatProvider, OpenAiProvider};
use crate::rate_limit::{RateLimiter, default_rate_limiter};
use crate::sanitize;
use crate::secrets::ApiKeyManager;
use crate::validation::{ContentKind, InputValidator, ValidationLimits};

/// Which stage a check runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Input,
    Output,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Input => "input",
            StageKind::Output => "output",
        }
    }

    fn content_kind(&self) -> ContentKind {
        match self {
            StageKind::Input => ContentKind::Prompt,
            StageKind::Output => ContentKind::Response,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated verdict returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineVerdict {
    pub blocked: bool,
    pub warnings: Vec<String>,
    pub reasons: Vec<String>,
    /// Every guardrail's result keyed by name, plus rate-limit details.
    pub details: Map<String, Value>,
    pub pipeline_type: String,
}

impl PipelineVerdict {
    fn new(stage: StageKind) -> Self {
        Self {
            blocked: false,
            warnings: Vec::new(),
            reasons: Vec::new(),
            details: Map::new(),
            pipeline_type: stage.as_str().to_string(),
        }
    }
}

/// Per-request correlation and enforcement context.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckContext<'a> {
    pub conversation: Option<&'a Conversation>,
    /// Key for global rate limiting; no key means no global limit check.
    pub api_key: Option<&'a str>,
    pub role: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub request_id: Option<&'a str>,
}

impl<'a> CheckContext<'a> {
    pub fn with_conversation(mut self, conversation: &'a Conversation) -> Self {
        self.conversation = Some(conversation);
        self
    }

    pub fn with_api_key(mut self, api_key: &'a str) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_role(mut self, role: &'a str) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_user_id(mut self, user_id: &'a str) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_request_id(mut self, request_id: &'a str) -> Self {
        self.request_id = Some(request_id);
        self
    }

    fn audit_context(&self) -> AuditContext {
        let mut ctx = AuditContext::default();
        ctx.request_id = self.request_id.map(str::to_string);
        ctx.user_id = self.user_id.map(str::to_string);
        ctx.session_id = self.session_id.map(str::to_string);
        ctx.conversation_id = self.conversation.map(|c| c.id().to_string());
        ctx
    }
}

/// Per-guardrail status row in [`PipelineStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct GuardrailStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub enabled: bool,
    pub available: bool,
}

/// Pipeline introspection snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub input_guardrails: Vec<GuardrailStatus>,
    pub output_guardrails: Vec<GuardrailStatus>,
    pub total_enabled: usize,
    pub total_disabled: usize,
}

struct StageEntry {
    guardrail: Box<dyn Guardrail>,
    /// The entry's `on_error` policy. Drives both init-failure tolerance
    /// and what a blocking verdict maps to at analysis time: `block`
    /// (default) blocks the aggregate, `warn` and `allow` demote the
    /// block to a recorded warning. Unset means block.
    on_error: Option<OnError>,
}

/// Builder for [`Pipeline`] with injectable collaborators.
pub struct PipelineBuilder {
    config: PipelineConfig,
    provider: Option<Arc<dyn ChatProvider>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    audit: Option<AuditTrail>,
    limits: ValidationLimits,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            provider: None,
            rate_limiter: None,
            audit: None,
            limits: ValidationLimits::default(),
        }
    }

    /// Backs AI detectors and moderation with this provider.
    pub fn with_provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_limits(mut self, limits: ValidationLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let validator = InputValidator::new(self.limits);
        validator
            .validate_pipeline_shape(self.config.guardrail_count(), self.config.regex_pattern_count())?;

        // No explicit provider: fall back to the environment-resolved
        // OpenAI key, matching detector self-initialization in standalone
        // use. AI guardrails run in unavailable mode without one.
        let key_manager = ApiKeyManager::new();
        let provider = self.provider.or_else(|| {
            key_manager
                .openai_key()
                .map(|key| Arc::new(OpenAiProvider::new(key)) as Arc<dyn ChatProvider>)
        });

        let registry = GuardrailRegistry::with_default_factories(provider);

        let input = build_stage(&registry, &self.config.pipeline.input, StageKind::Input)?;
        let output = build_stage(&registry, &self.config.pipeline.output, StageKind::Output)?;

        tracing::info!(
            input_guardrails = input.len(),
            output_guardrails = output.len(),
            "pipeline initialized"
        );

        Ok(Pipeline {
            input,
            output,
            registry,
            rate_limiter: self.rate_limiter.unwrap_or_else(default_rate_limiter),
            audit: self.audit.unwrap_or_else(global_audit),
            validator,
        })
    }
}

fn build_stage(
    registry: &GuardrailRegistry,
    specs: &[GuardrailSpec],
    stage: StageKind,
) -> Result<Vec<StageEntry>> {
    let mut entries = Vec::with_capacity(specs.len());
    for spec in specs {
        match registry.build_from_spec(spec) {
            Ok(Some(guardrail)) => {
                tracing::debug!(stage = %stage, guardrail = guardrail.name(), "added guardrail");
                entries.push(StageEntry {
                    guardrail,
                    on_error: spec.on_error,
                });
            }
            Ok(None) => {
                return Err(Error::config(format!(
                    "no factory registered for guardrail type '{}'",
                    spec.kind.as_deref().unwrap_or("<missing>")
                )));
            }
            // Construction failures surface as init errors unless the
            // entry is marked on_error: allow at the pipeline level.
            Err(e) if spec.on_error == Some(OnError::Allow) => {
                tracing::warn!(
                    stage = %stage,
                    guardrail = spec.name.as_deref().unwrap_or("<unnamed>"),
                    error = %e,
                    "skipping guardrail that failed to initialize (on_error: allow)"
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(entries)
}

/// A configured guardrail pipeline.
pub struct Pipeline {
    input: Vec<StageEntry>,
    output: Vec<StageEntry>,
    #[allow(dead_code)] // retained for config-reload and custom factories
    registry: GuardrailRegistry,
    rate_limiter: Arc<RateLimiter>,
    audit: AuditTrail,
    validator: InputValidator,
}

impl Pipeline {
    /// Builds a pipeline from an in-memory configuration with default
    /// collaborators (global rate limiter and audit trail, environment
    /// provider).
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        PipelineBuilder::new(config).build()
    }

    /// Builds a pipeline from a YAML or JSON config file.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = load_config(path.as_ref())?;
        Self::from_config(config)
    }

    /// Builds a pipeline from a named preset.
    pub fn from_preset(preset: Preset) -> Result<Self> {
        Self::from_config(preset.config())
    }

    /// Starts a builder for collaborator injection.
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Checks input content through the input stage, sequentially in
    /// declared order.
    pub async fn check_input(&self, content: &str, ctx: &CheckContext<'_>) -> PipelineVerdict {
        self.run_stage(StageKind::Input, content, ctx, false).await
    }

    /// Checks output content through the output stage.
    pub async fn check_output(&self, content: &str, ctx: &CheckContext<'_>) -> PipelineVerdict {
        self.run_stage(StageKind::Output, content, ctx, false).await
    }

    /// Concurrent variant of [`check_input`](Self::check_input): guardrails
    /// run in parallel and audit events follow completion order.
    pub async fn check_input_concurrent(
        &self,
        content: &str,
        ctx: &CheckContext<'_>,
    ) -> PipelineVerdict {
        self.run_stage(StageKind::Input, content, ctx, true).await
    }

    /// Concurrent variant of [`check_output`](Self::check_output).
    pub async fn check_output_concurrent(
        &self,
        content: &str,
        ctx: &CheckContext<'_>,
    ) -> PipelineVerdict {
        self.run_stage(StageKind::Output, content, ctx, true).await
    }

    /// Synchronous wrapper over [`check_input`](Self::check_input).
    ///
    /// Fails deterministically when called from inside a Tokio runtime
    /// instead of deadlocking.
    pub fn check_input_blocking(
        &self,
        content: &str,
        ctx: &CheckContext<'_>,
    ) -> Result<PipelineVerdict> {
        self.run_blocking(StageKind::Input, content, ctx)
    }

    /// Synchronous wrapper over [`check_output`](Self::check_output).
    pub fn check_output_blocking(
        &self,
        content: &str,
        ctx: &CheckContext<'_>,
    ) -> Result<PipelineVerdict> {
        self.run_blocking(StageKind::Output, content, ctx)
    }

    fn run_blocking(
        &self,
        stage: StageKind,
        content: &str,
        ctx: &CheckContext<'_>,
    ) -> Result<PipelineVerdict> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::pipeline(
                "blocking check called from within an async runtime; use the async check instead",
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(runtime.block_on(self.run_stage(stage, content, ctx, false)))
    }

    #[tracing::instrument(skip(self, content, ctx), fields(stage = %stage, content_len = content.len()))]
    async fn run_stage(
        &self,
        stage: StageKind,
        content: &str,
        ctx: &CheckContext<'_>,
        concurrent: bool,
    ) -> PipelineVerdict {
        let audit_ctx = ctx.audit_context();
        self.log_content(stage, content, &audit_ctx);

        let mut verdict = PipelineVerdict::new(stage);

        // 1. Content size and shape limits.
        if let Err(e) = self.validator.validate_content(content, stage.content_kind()) {
            let safe = sanitize::safe_error_message(&e, "input validation");
            let reason = format!("Input validation failed: {safe}");
            verdict.blocked = true;
            verdict.reasons.push(reason.clone());
            verdict.details.insert(
                "input_validation".to_string(),
                json!({"error": sanitize::sanitize_message(&e.to_string())}),
            );
            self.audit
                .log_decision("input_validation", Decision::Block, &reason, &audit_ctx, None, None);
            return verdict;
        }

        // 2. Global per-key rate limit.
        if let Some(api_key) = ctx.api_key {
            let decision = self.rate_limiter.check(api_key, ctx.role);
            if decision.exceeded {
                let reason = format!("Global rate limit exceeded: {}", decision.reason);
                verdict.blocked = true;
                verdict.reasons.push(reason.clone());
                verdict.details.insert(
                    "global_rate_limit".to_string(),
                    serde_json::to_value(&decision).unwrap_or(Value::Null),
                );
                self.audit.log_decision(
                    "global_rate_limit",
                    Decision::Block,
                    &reason,
                    &audit_ctx,
                    None,
                    None,
                );
                return verdict;
            }
            self.rate_limiter.record_request(api_key, None);
        }

        // 3. Per-conversation rolling-window limits.
        if let Some(conversation) = ctx.conversation
            && conversation.check_rate_limit(RateLimitAction::Block)
        {
            let reason = format!(
                "Conversation rate limit exceeded for {}",
                conversation.id()
            );
            verdict.blocked = true;
            verdict.reasons.push(reason.clone());
            verdict
                .details
                .insert("conversation_rate_limit".to_string(), json!({"exceeded": true}));
            self.audit.log_decision(
                "conversation_rate_limit",
                Decision::Block,
                &reason,
                &audit_ctx,
                None,
                None,
            );
            return verdict;
        }

        // 4. Every enabled guardrail. No short-circuit: callers learn
        // every reason.
        let entries: Vec<&StageEntry> = self
            .stage(stage)
            .iter()
            .filter(|entry| entry.guardrail.is_enabled())
            .collect();

        if concurrent {
            let mut stream: FuturesUnordered<_> = entries
                .iter()
                .map(|entry| async move {
                    let result = entry.guardrail.analyze_safe(content, ctx.conversation).await;
                    (*entry, result)
                })
                .collect();
            while let Some((entry, result)) = stream.next().await {
                self.aggregate(&mut verdict, entry, result, &audit_ctx);
            }
        } else {
            for entry in entries {
                let result = entry.guardrail.analyze_safe(content, ctx.conversation).await;
                self.aggregate(&mut verdict, entry, result, &audit_ctx);
            }
        }

        verdict
    }

    fn aggregate(
        &self,
        verdict: &mut PipelineVerdict,
        entry: &StageEntry,
        result: GuardrailResult,
        audit_ctx: &AuditContext,
    ) {
        let name = result.guardrail_name.clone();
        let action = result.action(entry.on_error);

        let decision = match action {
            OnError::Block => {
                verdict.blocked = true;
                verdict.reasons.push(result.reason.clone());
                Decision::Block
            }
            // A blocking verdict demoted by `on_error: warn` or
            // `on_error: allow`.
            OnError::Warn => {
                verdict.warnings.push(result.reason.clone());
                Decision::Warn
            }
            OnError::Allow => {
                // Non-blocking but notable results surface as warnings.
                if !result.blocked && result.confidence >= 0.5 {
                    verdict.warnings.push(result.reason.clone());
                    Decision::Warn
                } else {
                    Decision::Allow
                }
            }
        };

        let rule_triggered = result
            .details
            .get("matched_keywords")
            .or_else(|| result.details.get("matched_patterns"))
            .and_then(Value::as_array)
            .and_then(|matches| matches.first())
            .and_then(Value::as_str)
            .map(str::to_string);

        self.audit.log_decision(
            &name,
            decision,
            &result.reason,
            audit_ctx,
            Some(result.confidence),
            rule_triggered.as_deref(),
        );

        verdict.details.insert(
            name,
            json!({
                "blocked": result.blocked,
                "confidence": result.confidence,
                "reason": result.reason,
                "details": result.details,
            }),
        );
    }

    fn log_content(&self, stage: StageKind, content: &str, audit_ctx: &AuditContext) {
        match stage {
            StageKind::Input => self.audit.log_prompt(content, audit_ctx),
            StageKind::Output => self.audit.log_response(content, audit_ctx, None, None),
        }
    }

    fn stage(&self, stage: StageKind) -> &[StageEntry] {
        match stage {
            StageKind::Input => &self.input,
            StageKind::Output => &self.output,
        }
    }

    fn all_entries(&self) -> impl Iterator<Item = &StageEntry> {
        self.input.iter().chain(self.output.iter())
    }

    /// Status of every guardrail in both stages.
    pub fn status(&self) -> PipelineStatus {
        let row = |entry: &StageEntry| GuardrailStatus {
            name: entry.guardrail.name().to_string(),
            kind: entry.guardrail.kind().as_str().to_string(),
            enabled: entry.guardrail.is_enabled(),
            available: entry.guardrail.is_available(),
        };

        let input_guardrails: Vec<_> = self.input.iter().map(row).collect();
        let output_guardrails: Vec<_> = self.output.iter().map(row).collect();
        let total_enabled = self.all_entries().filter(|e| e.guardrail.is_enabled()).count();
        let total_disabled = self.input.len() + self.output.len() - total_enabled;

        PipelineStatus {
            input_guardrails,
            output_guardrails,
            total_enabled,
            total_disabled,
        }
    }

    /// Enables a guardrail by name. Returns whether it was found.
    pub fn enable_guardrail(&self, name: &str) -> bool {
        self.set_guardrail_enabled(name, true)
    }

    /// Disables a guardrail by name. Returns whether it was found.
    pub fn disable_guardrail(&self, name: &str) -> bool {
        self.set_guardrail_enabled(name, false)
    }

    fn set_guardrail_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        for entry in self.all_entries() {
            if entry.guardrail.name() == name {
                entry.guardrail.set_enabled(enabled);
                found = true;
            }
        }
        if !found {
            tracing::warn!(guardrail = name, "guardrail not found");
        }
        found
    }

    /// Configuration of a guardrail by name.
    pub fn guardrail_config(&self, name: &str) -> Option<Value> {
        self.all_entries()
            .find(|entry| entry.guardrail.name() == name)
            .map(|entry| entry.guardrail.config())
    }

    /// Updates a guardrail's configuration by name. Returns whether it was
    /// found; update errors propagate.
    pub fn update_guardrail_config(&mut self, name: &str, config: &Map<String, Value>) -> Result<bool> {
        for entry in self.input.iter_mut().chain(self.output.iter_mut()) {
            if entry.guardrail.name() == name {
                entry
                    .guardrail
                    .update_config(config)
                    .map_err(|e| Error::config(e.to_string()))?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The audit trail this pipeline records to.
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// The rate limiter this pipeline consults.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageSet;
    use crate::rate_limit::{RateLimiterConfig, RateLimits};

    fn config_with_input(specs: Vec<GuardrailSpec>) -> PipelineConfig {
        PipelineConfig {
            version: Some("1.0".to_string()),
            pipeline: StageSet {
                input: specs,
                output: Vec::new(),
            },
        }
    }

    fn keyword_spec(name: &str, keywords: &[&str]) -> GuardrailSpec {
        GuardrailSpec::new(name, "keyword_list").with_config("keywords", json!(keywords))
    }

    fn quiet_pipeline(config: PipelineConfig) -> Pipeline {
        Pipeline::builder(config)
            .with_audit(AuditTrail::new())
            .with_rate_limiter(Arc::new(RateLimiter::default()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_blocked_aggregation() {
        let pipeline = quiet_pipeline(config_with_input(vec![
            keyword_spec("kw1", &["alpha"]),
            keyword_spec("kw2", &["beta"]),
        ]));

        let verdict = pipeline
            .check_input("contains alpha and beta", &CheckContext::default())
            .await;
        assert!(verdict.blocked);
        assert_eq!(verdict.reasons.len(), 2);
        assert!(verdict.details.contains_key("kw1"));
        assert!(verdict.details.contains_key("kw2"));
        assert_eq!(verdict.pipeline_type, "input");
    }

    #[tokio::test]
    async fn test_all_guardrails_run_despite_block() {
        // kw1 blocks but kw2 still runs and reports.
        let pipeline = quiet_pipeline(config_with_input(vec![
            keyword_spec("kw1", &["alpha"]),
            keyword_spec("kw2", &["missing"]),
        ]));

        let verdict = pipeline.check_input("alpha only", &CheckContext::default()).await;
        assert!(verdict.blocked);
        assert_eq!(verdict.reasons.len(), 1);
        assert_eq!(verdict.details["kw2"]["blocked"], json!(false));
    }

    #[tokio::test]
    async fn test_clean_content_passes() {
        let pipeline = quiet_pipeline(config_with_input(vec![keyword_spec("kw", &["bad"])]));
        let verdict = pipeline.check_input("all good here", &CheckContext::default()).await;
        assert!(!verdict.blocked);
        assert!(verdict.reasons.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_guardrail_skipped() {
        let mut spec = keyword_spec("kw", &["bad"]);
        spec.enabled = false;
        let pipeline = quiet_pipeline(config_with_input(vec![spec]));

        let verdict = pipeline.check_input("bad content", &CheckContext::default()).await;
        assert!(!verdict.blocked);
        assert!(!verdict.details.contains_key("kw"));
    }

    #[tokio::test]
    async fn test_on_error_warn_demotes_block() {
        let spec = keyword_spec("kw", &["flagged"]).with_on_error(OnError::Warn);
        let pipeline = quiet_pipeline(config_with_input(vec![spec]));

        let verdict = pipeline.check_input("flagged content", &CheckContext::default()).await;
        assert!(!verdict.blocked);
        assert_eq!(verdict.warnings.len(), 1);
        // The result itself still records the block in details.
        assert_eq!(verdict.details["kw"]["blocked"], json!(true));
    }

    #[tokio::test]
    async fn test_global_rate_limit_short_circuits() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            default_limits: RateLimits {
                requests_per_minute: Some(1),
                ..RateLimits::unlimited()
            },
            ..Default::default()
        }));
        let pipeline = Pipeline::builder(config_with_input(vec![keyword_spec("kw", &["x"])]))
            .with_audit(AuditTrail::new())
            .with_rate_limiter(limiter)
            .build()
            .unwrap();

        let ctx = CheckContext::default().with_api_key("key-1");
        let first = pipeline.check_input("fine", &ctx).await;
        assert!(!first.blocked);

        let second = pipeline.check_input("fine", &ctx).await;
        assert!(second.blocked);
        assert!(second.reasons[0].starts_with("Global rate limit exceeded:"));
        assert!(second.details.contains_key("global_rate_limit"));
        // Guardrails never ran.
        assert!(!second.details.contains_key("kw"));
    }

    #[tokio::test]
    async fn test_conversation_rate_limit_blocks() {
        let pipeline = quiet_pipeline(config_with_input(vec![keyword_spec("kw", &["x"])]));
        let conversation = Conversation::human_ai("u", "m").with_rate_limit(
            crate::conversation::TurnRateLimit {
                turns_per_minute: Some(1),
                turns_per_hour: None,
            },
        );
        conversation.add_exchange("one", "r").unwrap();

        let ctx = CheckContext::default().with_conversation(&conversation);
        let verdict = pipeline.check_input("hello", &ctx).await;
        assert!(verdict.blocked);
        assert!(verdict.reasons[0].contains("Conversation rate limit exceeded"));
    }

    #[tokio::test]
    async fn test_oversized_content_blocked_by_validation() {
        let pipeline = Pipeline::builder(config_with_input(vec![keyword_spec("kw", &["x"])]))
            .with_audit(AuditTrail::new())
            .with_limits(ValidationLimits {
                max_prompt_length: 8,
                ..Default::default()
            })
            .build()
            .unwrap();

        let verdict = pipeline
            .check_input("definitely longer than eight bytes", &CheckContext::default())
            .await;
        assert!(verdict.blocked);
        assert!(verdict.reasons[0].starts_with("Input validation failed:"));
    }

    #[tokio::test]
    async fn test_concurrent_matches_sequential_aggregation() {
        let config = config_with_input(vec![
            keyword_spec("kw1", &["alpha"]),
            keyword_spec("kw2", &["beta"]),
            keyword_spec("kw3", &["missing"]),
        ]);
        let pipeline = quiet_pipeline(config);

        let sequential = pipeline
            .check_input("alpha and beta", &CheckContext::default())
            .await;
        let concurrent = pipeline
            .check_input_concurrent("alpha and beta", &CheckContext::default())
            .await;

        assert_eq!(sequential.blocked, concurrent.blocked);
        assert_eq!(
            sequential.details.keys().collect::<std::collections::BTreeSet<_>>(),
            concurrent.details.keys().collect::<std::collections::BTreeSet<_>>()
        );
        let mut sequential_reasons = sequential.reasons.clone();
        let mut concurrent_reasons = concurrent.reasons.clone();
        sequential_reasons.sort();
        concurrent_reasons.sort();
        assert_eq!(sequential_reasons, concurrent_reasons);
    }

    #[tokio::test]
    async fn test_blocking_wrapper_rejected_inside_runtime() {
        let pipeline = quiet_pipeline(config_with_input(vec![keyword_spec("kw", &["x"])]));
        let err = pipeline
            .check_input_blocking("content", &CheckContext::default())
            .unwrap_err();
        assert!(matches!(err, Error::Pipeline { .. }));
    }

    #[test]
    fn test_blocking_wrapper_works_outside_runtime() {
        let pipeline = quiet_pipeline(config_with_input(vec![keyword_spec("kw", &["bad"])]));
        let verdict = pipeline
            .check_input_blocking("bad content", &CheckContext::default())
            .unwrap();
        assert!(verdict.blocked);
    }

    #[test]
    fn test_unknown_type_fails_init() {
        let config = config_with_input(vec![GuardrailSpec::new("mystery", "telepathy")]);
        let err = match Pipeline::from_config(config) {
            Err(e) => e,
            Ok(_) => panic!("expected Pipeline::from_config to fail"),
        };
        assert!(matches!(err, Error::InvalidGuardrailType { .. }));
    }

    #[test]
    fn test_failed_entry_skipped_with_on_error_allow() {
        // Keyword guardrail without keywords fails construction; on_error
        // allow lets the pipeline come up without it.
        let bad = GuardrailSpec::new("kw", "keyword_list").with_on_error(OnError::Allow);
        let pipeline = quiet_pipeline(config_with_input(vec![bad]));
        assert_eq!(pipeline.status().input_guardrails.len(), 0);
    }

    #[test]
    fn test_failed_entry_surfaces_without_on_error_allow() {
        let bad = GuardrailSpec::new("kw", "keyword_list");
        assert!(Pipeline::from_config(config_with_input(vec![bad])).is_err());
    }

    #[test]
    fn test_too_many_guardrails_rejected() {
        let specs: Vec<GuardrailSpec> = (0..21)
            .map(|i| keyword_spec(&format!("kw{i}"), &["x"]))
            .collect();
        assert!(Pipeline::from_config(config_with_input(specs)).is_err());
    }

    #[test]
    fn test_status_and_enable_disable() {
        let pipeline = quiet_pipeline(config_with_input(vec![
            keyword_spec("kw1", &["a"]),
            keyword_spec("kw2", &["b"]),
        ]));

        let status = pipeline.status();
        assert_eq!(status.input_guardrails.len(), 2);
        assert_eq!(status.total_enabled, 2);
        assert_eq!(status.total_disabled, 0);

        assert!(pipeline.disable_guardrail("kw1"));
        let status = pipeline.status();
        assert_eq!(status.total_enabled, 1);
        assert_eq!(status.total_disabled, 1);

        assert!(pipeline.enable_guardrail("kw1"));
        assert!(!pipeline.enable_guardrail("nonexistent"));
    }

    #[tokio::test]
    async fn test_update_guardrail_config() {
        let mut pipeline = quiet_pipeline(config_with_input(vec![keyword_spec("kw", &["old"])]));

        let mut update = Map::new();
        update.insert("keywords".to_string(), json!(["new"]));
        assert!(pipeline.update_guardrail_config("kw", &update).unwrap());
        assert!(!pipeline.update_guardrail_config("missing", &update).unwrap());

        let verdict = pipeline.check_input("new content", &CheckContext::default()).await;
        assert!(verdict.blocked);
    }

    #[test]
    fn test_from_preset() {
        let pipeline = Pipeline::from_preset(Preset::CustomerService).unwrap();
        let status = pipeline.status();
        assert!(!status.input_guardrails.is_empty());
        assert!(!status.output_guardrails.is_empty());
    }

    #[test]
    fn test_guardrail_config_lookup() {
        let pipeline = quiet_pipeline(config_with_input(vec![keyword_spec("kw", &["a"])]));
        let config = pipeline.guardrail_config("kw").unwrap();
        assert_eq!(config["type"], json!("keyword_list"));
        assert!(pipeline.guardrail_config("missing").is_none());
    }
}
