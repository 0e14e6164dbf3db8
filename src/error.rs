//! Crate-level error taxonomy.
//!
//! Only configuration/initialization failures and conversation-limit
//! violations propagate as errors; every request-path failure is converted
//! into a structured verdict by the pipeline or by
//! [`analyze_safe`](crate::guardrails::Guardrail::analyze_safe).

use thiserror::Error;

use crate::validation::ValidationError;

/// Result type for crate-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of pipeline and configuration APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is invalid (missing fields, bad values, unparseable file).
    #[error("Configuration error: {message}")]
    Config {
        /// Aggregated, human-readable description of what is wrong.
        message: String,
    },

    /// A guardrail entry names a type outside the closed set.
    #[error("Invalid guardrail type '{requested}'. Valid types: {}", .valid.join(", "))]
    InvalidGuardrailType {
        /// The type string that was requested.
        requested: String,
        /// Every type the factory knows how to build.
        valid: Vec<String>,
    },

    /// Input validation rejected content or a resource limit was exceeded.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A conversation cap (turns, memory, age) would be exceeded.
    #[error("Conversation limit exceeded: {message}")]
    ConversationLimit {
        /// Which cap fired and by how much.
        message: String,
    },

    /// Pipeline construction or execution-boundary failure.
    #[error("Pipeline error: {message}")]
    Pipeline {
        /// Description of the failure.
        message: String,
    },

    /// Filesystem failure while loading configuration or keyword files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a pipeline error.
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::Pipeline {
            message: message.into(),
        }
    }

    /// Creates a conversation-limit error.
    pub fn conversation_limit(message: impl Into<String>) -> Self {
        Self::ConversationLimit {
            message: message.into(),
        }
    }

    /// Returns a stable code string for programmatic handling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::InvalidGuardrailType { .. } => "invalid_guardrail_type",
            Error::Validation(_) => "input_validation_error",
            Error::ConversationLimit { .. } => "conversation_limit_exceeded",
            Error::Pipeline { .. } => "pipeline_error",
            Error::Io(_) => "io_error",
        }
    }
}
