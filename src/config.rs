//! Client configuration and credential resolution.
//!
//! The API key may live under more than one environment variable name. The
//! candidates are checked in order and the first non-empty value wins.

use crate::types::{ClientError, Result};
use std::time::Duration;

/// Environment variables accepted for the API key, in priority order
pub const API_KEY_VARS: [&str; 2] = ["NEXT_PUBLIC_OPENAI_KEY", "VITE_OPENAI_KEY"];

pub const BASE_URL_VAR: &str = "OPENAI_BASE_URL";
pub const MODEL_VAR: &str = "OPENAI_MODEL";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_FALLBACK_WORD_DELAY: Duration = Duration::from_millis(50);

/// A place a credential can come from
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialSource {
    /// Read from the named environment variable
    Env(String),
    /// Explicit value, e.g. from a command line flag
    Value(String),
}

impl CredentialSource {
    pub fn env(name: impl Into<String>) -> Self {
        CredentialSource::Env(name.into())
    }

    fn read(&self) -> Option<String> {
        let raw = match self {
            CredentialSource::Env(name) => std::env::var(name).ok()?,
            CredentialSource::Value(value) => value.clone(),
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn describe(&self) -> String {
        match self {
            CredentialSource::Env(name) => name.clone(),
            CredentialSource::Value(_) => "explicit value".to_string(),
        }
    }
}

/// Default credential sources: the accepted environment variable names
pub fn default_credential_sources() -> Vec<CredentialSource> {
    API_KEY_VARS.iter().map(|name| CredentialSource::env(*name)).collect()
}

/// Return the first non-empty credential among `sources`.
pub fn resolve_api_key(sources: &[CredentialSource]) -> Result<String> {
    sources
        .iter()
        .find_map(CredentialSource::read)
        .ok_or_else(|| missing_key_error(sources))
}

fn missing_key_error(sources: &[CredentialSource]) -> ClientError {
    let names: Vec<String> = sources.iter().map(CredentialSource::describe).collect();
    ClientError::Config(format!(
        "API key is not configured. Set one of: {}",
        if names.is_empty() {
            API_KEY_VARS.join(", ")
        } else {
            names.join(", ")
        }
    ))
}

/// Render the first three characters of a secret for diagnostics.
pub fn mask_secret(secret: &str) -> String {
    let prefix: String = secret.chars().take(3).collect();
    format!("{prefix}...")
}

/// Settings for [`crate::OpenAIClient`]
#[derive(Clone)]
pub struct ClientConfig {
    /// Bearer credential; requests fail with a configuration error while empty
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    /// Pause between words when the rate-limit fallback is replayed as a stream
    pub fallback_word_delay: Duration,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &self.api_key.as_deref().map(mask_secret))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("fallback_word_delay", &self.fallback_word_delay)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            fallback_word_delay: DEFAULT_FALLBACK_WORD_DELAY,
        }
    }
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Default::default()
        }
    }

    /// Build a config from the process environment.
    ///
    /// A missing key is not an error here; it is reported by the first request
    /// so that callers can construct a client before the user has configured it.
    pub fn from_env() -> Self {
        let mut config = Self {
            api_key: resolve_api_key(&default_credential_sources()).ok(),
            ..Default::default()
        };
        if let Some(base_url) = CredentialSource::env(BASE_URL_VAR).read() {
            config.base_url = base_url;
        }
        if let Some(model) = CredentialSource::env(MODEL_VAR).read() {
            config.model = model;
        }
        config
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_fallback_word_delay(mut self, delay: Duration) -> Self {
        self.fallback_word_delay = delay;
        self
    }

    /// The configured credential, or a configuration error naming the variables.
    pub fn require_api_key(&self) -> Result<&str> {
        match self.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(missing_key_error(&default_credential_sources())),
        }
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}
