//! API key resolution for model providers.
//!
//! Keys resolve environment-first (`OPENAI_API_KEY`, `AZURE_OPENAI_API_KEY`,
//! `ANTHROPIC_API_KEY`), then from an optional config file. Key values are
//! never logged; log lines carry the provider name only.
//!
//! The reference design also supports an encrypted local store and falls
//! back to environment-only mode when the crypto primitive is unavailable.
//! This build runs in that environment-only mode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Providers the key manager knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyProvider {
    OpenAi,
    AzureOpenAi,
    Anthropic,
}

impl KeyProvider {
    /// Environment variable holding this provider's key.
    pub fn env_var(&self) -> &'static str {
        match self {
            KeyProvider::OpenAi => "OPENAI_API_KEY",
            KeyProvider::AzureOpenAi => "AZURE_OPENAI_API_KEY",
            KeyProvider::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    /// Key name used in config files.
    pub fn config_key(&self) -> &'static str {
        match self {
            KeyProvider::OpenAi => "openai",
            KeyProvider::AzureOpenAi => "azure_openai",
            KeyProvider::Anthropic => "anthropic",
        }
    }

    fn all() -> [KeyProvider; 3] {
        [
            KeyProvider::OpenAi,
            KeyProvider::AzureOpenAi,
            KeyProvider::Anthropic,
        ]
    }
}

impl std::fmt::Display for KeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.config_key())
    }
}

static OPENAI_KEY_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^sk-[A-Za-z0-9_-]{20,}$").expect("valid regex"));
static AZURE_KEY_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{32}$").expect("valid regex"));
static ANTHROPIC_KEY_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^sk-ant-[A-Za-z0-9_-]{20,}$").expect("valid regex"));

/// Checks whether a key value has the expected shape for its provider.
///
/// A shape check only; it does not verify the key against the provider.
pub fn key_has_valid_format(provider: KeyProvider, key: &str) -> bool {
    match provider {
        KeyProvider::OpenAi => OPENAI_KEY_SHAPE.is_match(key),
        KeyProvider::AzureOpenAi => AZURE_KEY_SHAPE.is_match(key),
        KeyProvider::Anthropic => ANTHROPIC_KEY_SHAPE.is_match(key),
    }
}

/// Shape of the optional key config file.
#[derive(Debug, Deserialize, Default)]
struct KeyFile {
    #[serde(default)]
    api_keys: HashMap<String, String>,
}

/// Resolves and holds provider API keys for the process.
#[derive(Debug, Default)]
pub struct ApiKeyManager {
    keys: HashMap<KeyProvider, String>,
    config_path: Option<PathBuf>,
}

impl ApiKeyManager {
    /// Loads keys from environment variables only.
    pub fn new() -> Self {
        let mut manager = Self::default();
        manager.load_from_environment();
        manager
    }

    /// Loads keys from environment variables, then fills gaps from a YAML or
    /// JSON config file with an `api_keys` map. Environment always wins.
    pub fn with_config_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut manager = Self {
            keys: HashMap::new(),
            config_path: Some(path.clone()),
        };
        manager.load_from_environment();
        manager.load_from_config_file(&path);
        manager
    }

    fn load_from_environment(&mut self) {
        for provider in KeyProvider::all() {
            if let Ok(key) = std::env::var(provider.env_var())
                && !key.is_empty()
            {
                tracing::info!(provider = %provider, "loaded API key from environment");
                self.keys.insert(provider, key);
            }
        }
    }

    fn load_from_config_file(&mut self, path: &Path) {
        let Ok(raw) = std::fs::read_to_string(path) else {
            tracing::debug!(
                path = %crate::sanitize::sanitize_path(&path.display().to_string()),
                "API key config file not readable; skipping"
            );
            return;
        };

        let parsed: Option<KeyFile> = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw).ok(),
            _ => serde_yaml::from_str(&raw).ok(),
        };
        let Some(file) = parsed else {
            tracing::warn!("failed to parse API key config file");
            return;
        };

        for provider in KeyProvider::all() {
            if self.keys.contains_key(&provider) {
                continue; // env wins
            }
            if let Some(key) = file.api_keys.get(provider.config_key())
                && !key.is_empty()
            {
                tracing::info!(provider = %provider, "loaded API key from config file");
                self.keys.insert(provider, key.clone());
            }
        }
    }

    /// Returns the key for a provider, if resolved.
    pub fn key(&self, provider: KeyProvider) -> Option<&str> {
        self.keys.get(&provider).map(String::as_str)
    }

    /// OpenAI key, if resolved.
    pub fn openai_key(&self) -> Option<&str> {
        self.key(KeyProvider::OpenAi)
    }

    /// Azure OpenAI key, if resolved.
    pub fn azure_openai_key(&self) -> Option<&str> {
        self.key(KeyProvider::AzureOpenAi)
    }

    /// Anthropic key, if resolved.
    pub fn anthropic_key(&self) -> Option<&str> {
        self.key(KeyProvider::Anthropic)
    }

    /// Sets a key directly (in-memory only).
    pub fn set_key(&mut self, provider: KeyProvider, key: impl Into<String>) {
        tracing::info!(provider = %provider, "set API key");
        self.keys.insert(provider, key.into());
    }

    /// Path of the config file this manager was created with.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_key_format_shapes() {
        assert!(key_has_valid_format(
            KeyProvider::OpenAi,
            "sk-abcdefghijklmnopqrstuvwxyz123456"
        ));
        assert!(!key_has_valid_format(KeyProvider::OpenAi, "sk-short"));
        assert!(!key_has_valid_format(KeyProvider::OpenAi, "no-prefix"));

        assert!(key_has_valid_format(
            KeyProvider::AzureOpenAi,
            "0123456789abcdef0123456789abcdef"
        ));
        assert!(!key_has_valid_format(KeyProvider::AzureOpenAi, "xyz"));

        assert!(key_has_valid_format(
            KeyProvider::Anthropic,
            "sk-ant-REDACTED"
        ));
        assert!(!key_has_valid_format(
            KeyProvider::Anthropic,
            "sk-abcdefghijklmnopqrstuvwxyz123456"
        ));
    }

    #[test]
    #[serial]
    fn test_environment_takes_priority() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.yaml");
        std::fs::write(&path, "api_keys:\n  openai: sk-from-file\n").unwrap();

        temp_env::with_var("OPENAI_API_KEY", Some("sk-from-env"), || {
            let manager = ApiKeyManager::with_config_file(&path);
            assert_eq!(manager.openai_key(), Some("sk-from-env"));
        });
    }

    #[test]
    #[serial]
    fn test_config_file_fills_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.yaml");
        std::fs::write(
            &path,
            "api_keys:\n  openai: sk-from-file\n  anthropic: sk-ant-from-file\n",
        )
        .unwrap();

        temp_env::with_vars(
            [
                ("OPENAI_API_KEY", None::<&str>),
                ("ANTHROPIC_API_KEY", None),
                ("AZURE_OPENAI_API_KEY", None),
            ],
            || {
                let manager = ApiKeyManager::with_config_file(&path);
                assert_eq!(manager.openai_key(), Some("sk-from-file"));
                assert_eq!(manager.anthropic_key(), Some("sk-ant-from-file"));
                assert_eq!(manager.azure_openai_key(), None);
            },
        );
    }

    #[test]
    #[serial]
    fn test_missing_config_file_is_tolerated() {
        temp_env::with_vars(
            [
                ("OPENAI_API_KEY", None::<&str>),
                ("ANTHROPIC_API_KEY", None),
                ("AZURE_OPENAI_API_KEY", None),
            ],
            || {
                let manager = ApiKeyManager::with_config_file("/nonexistent/keys.yaml");
                assert_eq!(manager.openai_key(), None);
            },
        );
    }
}
