//! Error sanitization for production environments.
//!
//! In production every outward-facing error message is replaced with a
//! generic `"<context> failed [Error ID: xxxxxxxx]"` form; full details are
//! logged under the error ID so operators can correlate without disclosing
//! paths, secrets, or stack information to callers. Development environments
//! pass details through untouched.

use std::collections::HashMap;
use std::fmt::Display;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Deployment environment, detected from process environment variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Full error details are shown to callers.
    Development,
    /// Error details are sanitized; only Error IDs are shown.
    Production,
}

/// Test override for the detected environment.
static FORCED_ENVIRONMENT: RwLock<Option<Environment>> = RwLock::new(None);

/// Full error messages keyed by Error ID, for operator lookup.
static ERROR_REGISTRY: Lazy<RwLock<HashMap<String, String>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Detects the current environment.
///
/// `ENVIRONMENT`, `ENV`, `STAGE`, or `DEPLOYMENT_ENV` set to `production` or
/// `prod` selects production. `DEBUG`, `DEVELOPMENT`, or `DEV` selects
/// development. A containerized process (`CONTAINER` set or `/.dockerenv`
/// present) without development flags is treated as production. Anything
/// else defaults to development.
pub fn current_environment() -> Environment {
    if let Some(forced) = *FORCED_ENVIRONMENT.read() {
        return forced;
    }
    detect_environment()
}

fn detect_environment() -> Environment {
    let is_prod_value = |var: &str| {
        std::env::var(var)
            .map(|v| {
                let v = v.to_ascii_lowercase();
                v == "production" || v == "prod"
            })
            .unwrap_or(false)
    };

    if ["ENVIRONMENT", "ENV", "STAGE", "DEPLOYMENT_ENV"]
        .iter()
        .any(|var| is_prod_value(var))
    {
        return Environment::Production;
    }

    let has_dev_flag = ["DEBUG", "DEVELOPMENT", "DEV"]
        .iter()
        .any(|var| std::env::var(var).is_ok());
    if has_dev_flag {
        return Environment::Development;
    }

    let in_container =
        std::env::var("CONTAINER").is_ok() || std::path::Path::new("/.dockerenv").exists();
    if in_container {
        return Environment::Production;
    }

    Environment::Development
}

/// Forces the environment for tests. Pass `None` to restore detection.
pub fn force_environment(env: Option<Environment>) {
    *FORCED_ENVIRONMENT.write() = env;
}

/// Returns true when running in production mode.
pub fn is_production() -> bool {
    current_environment() == Environment::Production
}

/// Produces a caller-safe error message.
///
/// Development: `"<context> failed: <error>"` with full details.
/// Production: `"<context> failed [Error ID: xxxxxxxx]"`; the full error is
/// logged at error level keyed by the ID and retained for
/// [`error_by_id`] lookup.
pub fn safe_error_message(error: &dyn Display, context: &str) -> String {
    if !is_production() {
        return format!("{context} failed: {error}");
    }

    let error_id = generate_error_id();
    tracing::error!(
        error_id = %error_id,
        context = context,
        error = %error,
        "sanitized error"
    );
    ERROR_REGISTRY
        .write()
        .insert(error_id.clone(), error.to_string());

    format!("{context} failed [Error ID: {error_id}]")
}

/// Looks up the full error message for an Error ID.
pub fn error_by_id(error_id: &str) -> Option<String> {
    ERROR_REGISTRY.read().get(error_id).cloned()
}

/// Collapses a path to its final component in production.
pub fn sanitize_path(path: &str) -> String {
    if !is_production() {
        return path.to_string();
    }

    let tail = path
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(path);
    tail.to_string()
}

static STACK_FRAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)at [^\s]+\.rs:\d+|File "[^"]+", line \d+"#).expect("valid regex"));
static UNIX_PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/[^\s:]+").expect("valid regex"));
static WINDOWS_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Z]:\\[^\s]+").expect("valid regex"));
static SECRET_ASSIGNMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(api[_-]?key|password|secret|token)s?["']?\s*[:=]\s*["']?[^"'\s]+"#)
        .expect("valid regex")
});
static OPENAI_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"sk-[A-Za-z0-9_-]+").expect("valid regex"));

/// Strips paths, stack frames, and inline secrets from an error string.
///
/// Applied only in production; development strings pass through unchanged.
pub fn sanitize_message(message: &str) -> String {
    if !is_production() {
        return message.to_string();
    }

    let out = STACK_FRAME_RE.replace_all(message, "[frame]");
    let out = OPENAI_KEY_RE.replace_all(&out, "[redacted]");
    let out = SECRET_ASSIGNMENT_RE.replace_all(&out, "[redacted]");
    let out = UNIX_PATH_RE.replace_all(&out, "[path]");
    let out = WINDOWS_PATH_RE.replace_all(&out, "[path]");
    out.into_owned()
}

/// Keys that are never disclosed, regardless of value.
const REDACTED_KEYS: [&str; 5] = ["api_key", "password", "secret", "token", "stack_trace"];
/// Keys always safe to pass through.
const SAFE_KEYS: [&str; 3] = ["error_id", "timestamp", "context"];

/// Sanitizes a structured details map for caller-facing results.
///
/// Sensitive keys are replaced with `"[redacted]"`, path-like keys collapse
/// to basenames, and string values get the [`sanitize_message`] sweep. In
/// development the map passes through unchanged.
pub fn sanitize_error_details(details: &Map<String, Value>) -> Map<String, Value> {
    if !is_production() {
        return details.clone();
    }

    let mut sanitized = Map::new();
    for (key, value) in details {
        let new_value = if SAFE_KEYS.contains(&key.as_str()) {
            value.clone()
        } else if REDACTED_KEYS.contains(&key.as_str()) {
            Value::String("[redacted]".to_string())
        } else if key.contains("path") {
            match value {
                Value::String(s) => Value::String(sanitize_path(s)),
                _ => Value::String("[redacted]".to_string()),
            }
        } else {
            match value {
                Value::String(s) => Value::String(sanitize_message(s)),
                other => other.clone(),
            }
        };
        sanitized.insert(key.clone(), new_value);
    }
    sanitized
}

fn generate_error_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_dev_passes_through() {
        force_environment(Some(Environment::Development));
        let msg = safe_error_message(&"boom in /home/user/app", "loading config");
        assert!(msg.contains("/home/user/app"));
        assert_eq!(sanitize_path("/etc/secrets/key.yaml"), "/etc/secrets/key.yaml");
        force_environment(None);
    }

    #[test]
    #[serial]
    fn test_prod_message_has_error_id() {
        force_environment(Some(Environment::Production));
        let msg = safe_error_message(&"open /home/user/keys failed", "loading config");
        assert!(!msg.contains("/home/user"));
        assert!(msg.starts_with("loading config failed [Error ID: "));
        let id = msg
            .rsplit("Error ID: ")
            .next()
            .unwrap()
            .trim_end_matches(']');
        assert_eq!(id.len(), 8);
        assert!(error_by_id(id).unwrap().contains("/home/user/keys"));
        force_environment(None);
    }

    #[test]
    #[serial]
    fn test_sanitize_message_strips_secrets_and_paths() {
        force_environment(Some(Environment::Production));
        let dirty = r#"failed: api_key=sk-abc123DEF in /home/user/app.rs at main.rs:42"#;
        let clean = sanitize_message(dirty);
        assert!(!clean.contains("sk-abc123DEF"));
        assert!(!clean.contains("/home/user"));
        assert!(!clean.contains("main.rs:42"));
        force_environment(None);
    }

    #[test]
    #[serial]
    fn test_sanitize_path_prod() {
        force_environment(Some(Environment::Production));
        assert_eq!(sanitize_path("/etc/app/config.yaml"), "config.yaml");
        assert_eq!(sanitize_path(r"C:\Users\dev\config.yaml"), "config.yaml");
        assert_eq!(sanitize_path("bare_name.yaml"), "bare_name.yaml");
        force_environment(None);
    }

    #[test]
    #[serial]
    fn test_sanitize_details_redacts_sensitive_keys() {
        force_environment(Some(Environment::Production));
        let mut details = Map::new();
        details.insert("api_key".to_string(), Value::String("sk-real".to_string()));
        details.insert("context".to_string(), Value::String("analysis".to_string()));
        details.insert(
            "config_path".to_string(),
            Value::String("/srv/app/cfg.yaml".to_string()),
        );

        let clean = sanitize_error_details(&details);
        assert_eq!(clean["api_key"], Value::String("[redacted]".to_string()));
        assert_eq!(clean["context"], Value::String("analysis".to_string()));
        assert_eq!(clean["config_path"], Value::String("cfg.yaml".to_string()));
        force_environment(None);
    }

    #[test]
    #[serial]
    fn test_environment_detection_from_env_vars() {
        force_environment(None);
        temp_env::with_vars(
            [
                ("ENVIRONMENT", Some("production")),
                ("DEBUG", None::<&str>),
                ("DEVELOPMENT", None),
                ("DEV", None),
            ],
            || {
                assert_eq!(current_environment(), Environment::Production);
            },
        );
        temp_env::with_vars(
            [("ENVIRONMENT", None::<&str>), ("DEBUG", Some("1"))],
            || {
                assert_eq!(current_environment(), Environment::Development);
            },
        );
    }
}
