//! Tracing initialization with configurable logging formats.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Console log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, human-oriented output.
    Pretty,
    /// Single-line output.
    #[default]
    Compact,
    /// Structured JSON lines.
    Json,
}

/// Initializes the global tracing subscriber.
///
/// Filtering follows `RUST_LOG`; without it, `info` and above. Returns an
/// error if a subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> Result<(), crate::error::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Pretty => {
            let layer = tracing_subscriber::fmt::layer().pretty().with_target(true);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
        LogFormat::Compact => {
            let layer = tracing_subscriber::fmt::layer().compact().with_target(true);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().json().with_target(true);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
    };

    result.map_err(|e| crate::error::Error::config(format!("failed to initialize tracing: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format() {
        assert_eq!(LogFormat::default(), LogFormat::Compact);
    }
}
