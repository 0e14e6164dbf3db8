//! Palisade is a content safety gateway for LLM applications: a
//! configurable pipeline of guardrails evaluated before and after model
//! calls, per-identity rate limiting, and an immutable audit trail of
//! every security decision.
//!
//! Palisade does not proxy model traffic. Callers invoke the pipeline
//! explicitly around their own model calls:
//!
//! ```text
//! Prompt ──► check_input ──► your LLM call ──► check_output ──► Response
//!                │                                   │
//!            guardrails                          guardrails
//!                └────────── audit trail ────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use palisade::config::Preset;
//! use palisade::pipeline::{CheckContext, Pipeline};
//!
//! # async fn run() -> palisade::Result<()> {
//! let pipeline = Pipeline::from_preset(Preset::CustomerService)?;
//!
//! let verdict = pipeline.check_input("Hello!", &CheckContext::default()).await;
//! if verdict.blocked {
//!     println!("blocked: {:?}", verdict.reasons);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`pipeline`] — stage construction and evaluation
//! - [`guardrails`] — the detector implementations and their uniform contract
//! - [`conversation`] — multi-turn conversation model for context-aware detection
//! - [`rate_limit`] — rolling-window per-key rate limiting with role overrides
//! - [`audit`] — async-batched, optionally PII-redacted audit trail
//! - [`config`] — pipeline configuration, validation rules, presets
//! - [`providers`] — the narrow LLM provider interface and adapters
//! - [`validation`], [`sanitize`], [`secrets`] — cross-cutting defenses

pub mod audit;
pub mod config;
pub mod conversation;
pub mod error;
pub mod guardrails;
pub mod observability;
pub mod pipeline;
pub mod providers;
pub mod rate_limit;
pub mod sanitize;
pub mod secrets;
pub mod validation;

#[cfg(test)]
mod tests;

pub use config::{PipelineConfig, Preset};
pub use conversation::Conversation;
pub use error::{Error, Result};
pub use guardrails::{Guardrail, GuardrailResult, GuardrailType, RiskLevel};
pub use pipeline::{CheckContext, Pipeline, PipelineVerdict};
