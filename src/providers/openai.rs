use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::traits::{synthesize_chunks, Provider, ProviderRequest, ProviderResponse};
use crate::engine::cancel::CancelSignal;
use crate::error::{EngineError, Result};

/// Environment fallback for profiles without an inline key.
pub const OPENAI_API_KEY_ENV: &str = "PIPELINE_ENGINE_OPENAI_API_KEY";

const DEFAULT_BASE_URI: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Calls the OpenAI chat completions API. The transport is non-streaming;
/// chunks are synthesized from the final text.
pub struct OpenAiProvider {
    profile: crate::engine::types::ProviderProfile,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

impl OpenAiProvider {
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

    fn build_request(&self, prompt: &str, model: &str) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(sys) = self
            .profile
            .extra
            .get("system_prompt")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            messages.push(Message {
                role: "system",
                content: sys.to_string(),
            });
        }
        messages.push(Message {
            role: "user",
            content: prompt.to_string(),
        });
        ChatRequest {
            model: model.to_string(),
            messages,
            temperature: 0.0,
        }
    }

    fn api_key(&self) -> Result<String> {
        if let Some(key) = self.profile.api_key.as_deref().filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }
        match std::env::var(OPENAI_API_KEY_ENV) {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => Err(EngineError::StepFailed(
                "openai api key is not configured".to_string(),
            )),
        }
    }

    fn endpoint(&self) -> String {
        let base = if self.profile.base_uri.is_empty() {
            DEFAULT_BASE_URI
        } else {
            self.profile.base_uri.as_str()
        };
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
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
        let api_key = self.api_key()?;
        let payload = self.build_request(&req.prompt, &model);
        let url = self.endpoint();

        tracing::debug!(profile = %self.profile.id, %model, "openai call start");
        let response = tokio::select! {
            result = self
                .client
                .post(&url)
                .bearer_auth(&api_key)
                .json(&payload)
                .send() => result.map_err(|e| {
                    tracing::error!(profile = %self.profile.id, error = %e, "openai call error");
                    EngineError::StepFailed(format!("openai request failed: {e}"))
                })?,
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        if !response.status().is_success() {
            let err = EngineError::ProviderHttp {
                provider: "openai".to_string(),
                status: response.status().to_string(),
            };
            tracing::error!(profile = %self.profile.id, error = %err, "openai call failed");
            return Err(err);
        }

        let decoded: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::StepFailed(format!("openai response decode failed: {e}")))?;
        let text = decoded
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| EngineError::ProviderEmptyResponse("openai".to_string()))?;

        let mut metadata = Map::new();
        metadata.insert("provider".to_string(), Value::from("openai"));
        metadata.insert("model".to_string(), Value::from(model.clone()));

        tracing::debug!(profile = %self.profile.id, %model, "openai call success");
        Ok(ProviderResponse {
            chunks: synthesize_chunks(&text),
            output: text,
            metadata,
        })
    }
}
