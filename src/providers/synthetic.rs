//! Deterministic stub providers for the image and local-tool kinds.
//!
//! They perform no external I/O and exist to exercise the provider
//! abstraction end to end. The simulated latency is raced against the
//! cancel signal so cancellation stays prompt.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::traits::{synthesize_chunks, Provider, ProviderRequest, ProviderResponse};
use crate::engine::cancel::CancelSignal;
use crate::engine::types::ProviderProfile;
use crate::error::{EngineError, Result};

const SIMULATED_LATENCY: Duration = Duration::from_millis(50);

async fn simulate_work(cancel: &CancelSignal) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    tokio::select! {
        () = tokio::time::sleep(SIMULATED_LATENCY) => Ok(()),
        () = cancel.cancelled() => Err(EngineError::Cancelled),
    }
}

pub struct ImageProvider {
    profile: ProviderProfile,
}

impl ImageProvider {
    pub fn new(profile: ProviderProfile) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl Provider for ImageProvider {
    async fn call(&self, req: ProviderRequest, cancel: CancelSignal) -> Result<ProviderResponse> {
        simulate_work(&cancel).await?;
        let text = format!(
            "image provider {} generated assets for step {}",
            self.profile.id, req.step.id
        );
        let mut metadata = Map::new();
        metadata.insert("provider".to_string(), Value::from("image"));
        Ok(ProviderResponse {
            chunks: synthesize_chunks(&text),
            output: text,
            metadata,
        })
    }
}

pub struct LocalToolProvider {
    profile: ProviderProfile,
}

impl LocalToolProvider {
    pub fn new(profile: ProviderProfile) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl Provider for LocalToolProvider {
    async fn call(&self, req: ProviderRequest, cancel: CancelSignal) -> Result<ProviderResponse> {
        simulate_work(&cancel).await?;
        let text = format!(
            "local tool {} executed for step {}",
            self.profile.id, req.step.id
        );
        let mut metadata = Map::new();
        metadata.insert("tool".to_string(), Value::from(self.profile.id.clone()));
        Ok(ProviderResponse {
            chunks: synthesize_chunks(&text),
            output: text,
            metadata,
        })
    }
}
