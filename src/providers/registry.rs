use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::ollama::OllamaProvider;
use super::openai::OpenAiProvider;
use super::synthetic::{ImageProvider, LocalToolProvider};
use super::traits::Provider;
use crate::engine::types::{ProviderKind, ProviderProfile, StepDef};
use crate::error::{EngineError, Result};

pub type ProviderFactory = Box<dyn Fn(ProviderProfile) -> Arc<dyn Provider> + Send + Sync>;

/// Holds provider profiles (by id) and factories (by kind) and resolves a
/// step to an executable provider plus its effective profile.
pub struct ProviderRegistry {
    profiles: RwLock<HashMap<String, ProviderProfile>>,
    factories: RwLock<HashMap<ProviderKind, ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry seeded with the four standard factories and a stub
    /// profile for each kind.
    pub async fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_default_factories().await;
        for profile in default_profiles() {
            registry.upsert_profile(profile).await;
        }
        registry
    }

    pub async fn register_default_factories(&self) {
        self.register_factory(
            ProviderKind::Openai,
            Box::new(|profile| Arc::new(OpenAiProvider::new(profile))),
        )
        .await;
        self.register_factory(
            ProviderKind::Ollama,
            Box::new(|profile| Arc::new(OllamaProvider::new(profile))),
        )
        .await;
        self.register_factory(
            ProviderKind::Image,
            Box::new(|profile| Arc::new(ImageProvider::new(profile))),
        )
        .await;
        self.register_factory(
            ProviderKind::LocalTool,
            Box::new(|profile| Arc::new(LocalToolProvider::new(profile))),
        )
        .await;
    }

    /// Store a profile, replacing any existing one with the same id.
    /// Profiles with an empty id are ignored.
    pub async fn upsert_profile(&self, profile: ProviderProfile) {
        if profile.id.is_empty() {
            return;
        }
        self.profiles
            .write()
            .await
            .insert(profile.id.clone(), profile);
    }

    pub async fn register_factory(&self, kind: ProviderKind, factory: ProviderFactory) {
        self.factories.write().await.insert(kind, factory);
    }

    /// Resolve a step to `(provider, merged profile)`.
    pub async fn resolve(&self, step: &StepDef) -> Result<(Arc<dyn Provider>, ProviderProfile)> {
        if step.provider_profile_id.is_empty() {
            return Err(EngineError::MissingProfileId {
                step_id: step.id.clone(),
            });
        }

        let profile = self
            .profiles
            .read()
            .await
            .get(&step.provider_profile_id)
            .cloned()
            .ok_or_else(|| EngineError::ProfileNotFound(step.provider_profile_id.clone()))?;

        let merged = merge_profile(profile, &step.provider_override);

        let factories = self.factories.read().await;
        let factory = factories
            .get(&merged.kind)
            .ok_or_else(|| EngineError::KindNotRegistered(kind_str(merged.kind).to_string()))?;
        Ok((factory(merged.clone()), merged))
    }
}

fn kind_str(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Openai => "openai",
        ProviderKind::Ollama => "ollama",
        ProviderKind::Image => "image",
        ProviderKind::LocalTool => "local_tool",
    }
}

/// Apply a step's `provider_override` onto its base profile. The three
/// named keys overwrite the corresponding field (matched case-insensitively,
/// value coerced to its string form); every other key spills into `extra`
/// under its original name.
pub fn merge_profile(
    base: ProviderProfile,
    overrides: &serde_json::Map<String, serde_json::Value>,
) -> ProviderProfile {
    if overrides.is_empty() {
        return base;
    }
    let mut merged = base;
    for (key, value) in overrides {
        match key.to_lowercase().as_str() {
            "base_uri" => merged.base_uri = value_string(value),
            "api_key" => merged.api_key = Some(value_string(value)),
            "default_model" => merged.default_model = Some(value_string(value)),
            _ => {
                merged.extra.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

fn value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn default_profiles() -> Vec<ProviderProfile> {
    vec![
        ProviderProfile {
            id: "default-openai".to_string(),
            kind: ProviderKind::Openai,
            base_uri: "https://api.openai.com/v1".to_string(),
            api_key: None,
            default_model: Some("gpt-4o-mini".to_string()),
            extra: serde_json::Map::new(),
        },
        ProviderProfile {
            id: "default-ollama".to_string(),
            kind: ProviderKind::Ollama,
            base_uri: "http://127.0.0.1:11434".to_string(),
            api_key: None,
            default_model: Some("llama3".to_string()),
            extra: serde_json::Map::new(),
        },
        ProviderProfile {
            id: "default-image".to_string(),
            kind: ProviderKind::Image,
            base_uri: "http://localhost:9000".to_string(),
            api_key: None,
            default_model: None,
            extra: serde_json::Map::new(),
        },
        ProviderProfile {
            id: "default-local".to_string(),
            kind: ProviderKind::LocalTool,
            base_uri: "local://tool".to_string(),
            api_key: None,
            default_model: None,
            extra: serde_json::Map::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_with_profile(profile_id: &str) -> StepDef {
        StepDef {
            id: "s1".to_string(),
            provider_profile_id: profile_id.to_string(),
            ..StepDef::default()
        }
    }

    #[tokio::test]
    async fn resolve_requires_profile_id() {
        let registry = ProviderRegistry::with_defaults().await;
        let err = registry
            .resolve(&step_with_profile(""))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "missing_profile_id");
    }

    #[tokio::test]
    async fn resolve_unknown_profile() {
        let registry = ProviderRegistry::with_defaults().await;
        let err = registry
            .resolve(&step_with_profile("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "profile_not_found");
    }

    #[tokio::test]
    async fn resolve_unregistered_kind() {
        let registry = ProviderRegistry::new();
        registry
            .upsert_profile(ProviderProfile {
                id: "p1".to_string(),
                kind: ProviderKind::Openai,
                base_uri: String::new(),
                api_key: None,
                default_model: None,
                extra: serde_json::Map::new(),
            })
            .await;
        let err = registry.resolve(&step_with_profile("p1")).await.unwrap_err();
        assert_eq!(err.code(), "kind_not_registered");
    }

    #[tokio::test]
    async fn resolve_default_profile_succeeds() {
        let registry = ProviderRegistry::with_defaults().await;
        let (_, profile) = registry
            .resolve(&step_with_profile("default-local"))
            .await
            .unwrap();
        assert_eq!(profile.kind, ProviderKind::LocalTool);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_profile() {
        let registry = ProviderRegistry::with_defaults().await;
        registry
            .upsert_profile(ProviderProfile {
                id: "default-local".to_string(),
                kind: ProviderKind::LocalTool,
                base_uri: "local://other".to_string(),
                api_key: None,
                default_model: None,
                extra: serde_json::Map::new(),
            })
            .await;
        let (_, profile) = registry
            .resolve(&step_with_profile("default-local"))
            .await
            .unwrap();
        assert_eq!(profile.base_uri, "local://other");
    }

    #[test]
    fn merge_named_keys_overwrite_case_insensitively() {
        let base = default_profiles().remove(0);
        let mut overrides = serde_json::Map::new();
        overrides.insert("BASE_URI".to_string(), json!("https://proxy.local/v1"));
        overrides.insert("api_key".to_string(), json!("sk-override"));
        overrides.insert("Default_Model".to_string(), json!("gpt-4o"));

        let merged = merge_profile(base, &overrides);
        assert_eq!(merged.base_uri, "https://proxy.local/v1");
        assert_eq!(merged.api_key.as_deref(), Some("sk-override"));
        assert_eq!(merged.default_model.as_deref(), Some("gpt-4o"));
        assert!(merged.extra.is_empty());
    }

    #[test]
    fn merge_unknown_keys_spill_into_extra() {
        let base = default_profiles().remove(0);
        let mut overrides = serde_json::Map::new();
        overrides.insert("system_prompt".to_string(), json!("be terse"));
        overrides.insert("Temperature_Hint".to_string(), json!(0.2));

        let merged = merge_profile(base, &overrides);
        assert_eq!(merged.extra["system_prompt"], json!("be terse"));
        // Original key casing is preserved for spilled keys.
        assert_eq!(merged.extra["Temperature_Hint"], json!(0.2));
    }

    #[test]
    fn merge_coerces_non_string_named_values() {
        let base = default_profiles().remove(0);
        let mut overrides = serde_json::Map::new();
        overrides.insert("default_model".to_string(), json!(42));
        let merged = merge_profile(base, &overrides);
        assert_eq!(merged.default_model.as_deref(), Some("42"));
    }
}
