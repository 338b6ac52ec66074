//! Environment-driven runtime configuration.
//!
//! All variables share the `PIPELINE_ENGINE_` prefix. Provider profiles
//! built here are registered at startup alongside the built-in defaults.

use crate::engine::types::{ProviderKind, ProviderProfile};

pub const ADDR_ENV: &str = "PIPELINE_ENGINE_ADDR";
pub const LOG_LEVEL_ENV: &str = "PIPELINE_ENGINE_LOG_LEVEL";
pub const OPENAI_API_KEY_ENV: &str = "PIPELINE_ENGINE_OPENAI_API_KEY";
pub const OPENAI_BASE_URL_ENV: &str = "PIPELINE_ENGINE_OPENAI_BASE_URL";
pub const OPENAI_MODEL_ENV: &str = "PIPELINE_ENGINE_OPENAI_MODEL";
pub const ENABLE_OLLAMA_ENV: &str = "PIPELINE_ENGINE_ENABLE_OLLAMA";
pub const OLLAMA_BASE_URL_ENV: &str = "PIPELINE_ENGINE_OLLAMA_BASE_URL";
pub const OLLAMA_MODEL_ENV: &str = "PIPELINE_ENGINE_OLLAMA_MODEL";

pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub addr: String,
    pub log_level: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub openai_model: Option<String>,
    pub enable_ollama: bool,
    pub ollama_base_url: Option<String>,
    pub ollama_model: Option<String>,
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            addr: env_nonempty(ADDR_ENV).unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            log_level: env_nonempty(LOG_LEVEL_ENV).unwrap_or_else(|| "info".to_string()),
            openai_api_key: env_nonempty(OPENAI_API_KEY_ENV),
            openai_base_url: env_nonempty(OPENAI_BASE_URL_ENV),
            openai_model: env_nonempty(OPENAI_MODEL_ENV),
            enable_ollama: env_nonempty(ENABLE_OLLAMA_ENV).is_some(),
            ollama_base_url: env_nonempty(OLLAMA_BASE_URL_ENV),
            ollama_model: env_nonempty(OLLAMA_MODEL_ENV),
        }
    }

    /// Provider profile backed by the OpenAI env vars, when the key is set.
    pub fn openai_profile(&self) -> Option<ProviderProfile> {
        let api_key = self.openai_api_key.clone()?;
        Some(ProviderProfile {
            id: "openai-env".to_string(),
            kind: ProviderKind::Openai,
            base_uri: self
                .openai_base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: Some(api_key),
            default_model: Some(
                self.openai_model
                    .clone()
                    .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            ),
            extra: serde_json::Map::new(),
        })
    }

    /// Provider profile backed by the Ollama env vars. Enabled by either
    /// the explicit toggle or a configured base URL.
    pub fn ollama_profile(&self) -> Option<ProviderProfile> {
        if !self.enable_ollama && self.ollama_base_url.is_none() {
            return None;
        }
        Some(ProviderProfile {
            id: "ollama-env".to_string(),
            kind: ProviderKind::Ollama,
            base_uri: self
                .ollama_base_url
                .clone()
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),
            api_key: None,
            default_model: Some(
                self.ollama_model
                    .clone()
                    .unwrap_or_else(|| "llama3".to_string()),
            ),
            extra: serde_json::Map::new(),
        })
    }

    pub fn provider_profiles(&self) -> Vec<ProviderProfile> {
        let mut profiles = Vec::new();
        if let Some(profile) = self.openai_profile() {
            profiles.push(profile);
        }
        if let Some(profile) = self.ollama_profile() {
            profiles.push(profile);
        }
        profiles
    }
}
