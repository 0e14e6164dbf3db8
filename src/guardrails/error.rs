//! Error types for guardrail construction and analysis.

use thiserror::Error;

use crate::providers::ProviderError;

/// Errors a guardrail can raise. On the request path these never reach
/// callers directly; [`analyze_safe`](crate::guardrails::Guardrail::analyze_safe)
/// converts them into conservative blocked verdicts.
#[derive(Debug, Error)]
pub enum GuardrailError {
    /// Guardrail configuration is invalid.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The backing model provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The provider reply could not be interpreted.
    #[error("Failed to parse analysis response: {message}")]
    Parse { message: String },

    /// The guardrail is not available (no provider, no API key).
    #[error("Guardrail unavailable: {message}")]
    Unavailable { message: String },

    /// Filesystem failure loading guardrail resources.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("Internal guardrail error: {message}")]
    Internal { message: String },
}

impl GuardrailError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable code string for details maps and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            GuardrailError::Config { .. } => "guardrail_config_error",
            GuardrailError::Provider(_) => "guardrail_provider_error",
            GuardrailError::Parse { .. } => "guardrail_parse_error",
            GuardrailError::Unavailable { .. } => "guardrail_unavailable",
            GuardrailError::Io(_) => "guardrail_io_error",
            GuardrailError::Internal { .. } => "guardrail_internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            GuardrailError::config("x").error_code(),
            "guardrail_config_error"
        );
        assert_eq!(
            GuardrailError::unavailable("no key").error_code(),
            "guardrail_unavailable"
        );
    }

    #[test]
    fn test_provider_error_wraps() {
        let provider_err = ProviderError::Auth {
            provider: "openai".to_string(),
            message: "bad key".to_string(),
        };
        let err: GuardrailError = provider_err.into();
        assert_eq!(err.error_code(), "guardrail_provider_error");
        assert!(err.to_string().contains("openai"));
    }
}
