use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::traits::{synthesize_chunks, Provider, ProviderRequest, ProviderResponse};
use crate::engine::cancel::CancelSignal;
use crate::error::{EngineError, Result};

const DEFAULT_BASE_URI: &str = "http://127.0.0.1:11434";
const DEFAULT_MODEL: &str = "llama3";

/// Calls a local Ollama endpoint through its non-streaming generate API.
pub struct OllamaProvider {
    profile: crate::engine::types::ProviderProfile,
    client: Client,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    model: String,
}

impl OllamaProvider {
    pub fn new(profile: crate::engine::types::ProviderProfile) -> Self {
        Self {
            profile,
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn build_request(&self, prompt: &str, model: &str) -> GenerateRequest {
        let system = self
            .profile
            .extra
            .get("system_prompt")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let options = self
            .profile
            .extra
            .get("options")
            .and_then(Value::as_object)
            .filter(|m| !m.is_empty())
            .cloned();
        GenerateRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            stream: false,
            system,
            options,
        }
    }

    fn endpoint(&self) -> String {
        let base = if self.profile.base_uri.is_empty() {
            DEFAULT_BASE_URI
        } else {
            self.profile.base_uri.as_str()
        };
        format!("{}/api/generate", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn call(&self, req: ProviderRequest, cancel: CancelSignal) -> Result<ProviderResponse> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let model = self
            .profile
            .default_model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let payload = self.build_request(&req.prompt, &model);
        let url = self.endpoint();

        tracing::debug!(profile = %self.profile.id, %model, "ollama call start");
        let response = tokio::select! {
            result = self.client.post(&url).json(&payload).send() => result.map_err(|e| {
                tracing::error!(profile = %self.profile.id, error = %e, "ollama call error");
                EngineError::StepFailed(format!("ollama request failed: {e}"))
            })?,
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        if !response.status().is_success() {
            let err = EngineError::ProviderHttp {
                provider: "ollama".to_string(),
                status: response.status().to_string(),
            };
            tracing::error!(profile = %self.profile.id, error = %err, "ollama call failed");
            return Err(err);
        }

        let decoded: GenerateResponse = response
            .json()
            .await
            .map_err(|e| EngineError::StepFailed(format!("ollama response decode failed: {e}")))?;
        if decoded.response.is_empty() {
            return Err(EngineError::ProviderEmptyResponse("ollama".to_string()));
        }

        let model_name = if decoded.model.is_empty() {
            model
        } else {
            decoded.model
        };
        let mut metadata = Map::new();
        metadata.insert("provider".to_string(), Value::from("ollama"));
        metadata.insert("model".to_string(), Value::from(model_name.clone()));

        tracing::debug!(profile = %self.profile.id, model = %model_name, "ollama call success");
        Ok(ProviderResponse {
            chunks: synthesize_chunks(&decoded.response),
            output: decoded.response,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{ProviderKind, ProviderProfile};

    fn profile(base_uri: &str) -> ProviderProfile {
        ProviderProfile {
            id: "ollama-test".to_string(),
            kind: ProviderKind::Ollama,
            base_uri: base_uri.to_string(),
            api_key: None,
            default_model: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn endpoint_defaults_and_trims() {
        let p = OllamaProvider::new(profile(""));
        assert_eq!(p.endpoint(), "http://127.0.0.1:11434/api/generate");

        let p = OllamaProvider::new(profile("http://myserver:11434/"));
        assert_eq!(p.endpoint(), "http://myserver:11434/api/generate");
    }

    #[test]
    fn request_carries_system_and_options_from_extra() {
        let mut prof = profile("");
        prof.extra
            .insert("system_prompt".to_string(), Value::from("answer briefly"));
        prof.extra.insert(
            "options".to_string(),
            serde_json::json!({"temperature": 0.1}),
        );
        let p = OllamaProvider::new(prof);
        let req = p.build_request("hi", "llama3");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["system"], "answer briefly");
        assert_eq!(json["options"]["temperature"], 0.1);
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn request_omits_empty_extras() {
        let p = OllamaProvider::new(profile(""));
        let req = p.build_request("hi", "llama3");
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("system"));
        assert!(!json.contains("options"));
    }

    #[test]
    fn response_deserializes() {
        let json = r#"{"response":"Hello from Ollama!","model":"llama3:8b","done":true}"#;
        let resp: GenerateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.response, "Hello from Ollama!");
        assert_eq!(resp.model, "llama3:8b");
    }
}
