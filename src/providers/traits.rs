use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::engine::cancel::CancelSignal;
use crate::engine::types::{JobOptions, ProviderProfile, ResultItem, Source, StepDef};
use crate::error::Result;

/// Job-level context shared with providers. Step modes narrow `sources`
/// and `previous` before each call.
#[derive(Debug, Clone, Default)]
pub struct ProviderInput {
    pub sources: Vec<Source>,
    pub options: Option<JobOptions>,
    pub previous: HashMap<String, Vec<ResultItem>>,
}

/// The full context passed to a concrete provider for one call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub step: StepDef,
    pub prompt: String,
    pub profile: ProviderProfile,
    pub input: ProviderInput,
}

/// An incremental fragment of a provider's output.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderChunk {
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub output: String,
    pub metadata: Map<String, Value>,
    pub chunks: Vec<ProviderChunk>,
}

/// An abstract LLM / tool executor. Implementations must observe the
/// cancel signal before starting work and race any network I/O against it.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn call(&self, req: ProviderRequest, cancel: CancelSignal) -> Result<ProviderResponse>;
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Provider")
    }
}

const CHUNK_TARGET_LEN: usize = 48;

/// Segment a final output into whitespace-bounded fragments so that
/// non-streaming transports still produce a meaningful chunk sequence.
pub fn synthesize_chunks(text: &str) -> Vec<ProviderChunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > CHUNK_TARGET_LEN {
            chunks.push(ProviderChunk {
                content: std::mem::take(&mut current),
            });
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(ProviderChunk { content: current });
    }
    chunks
}
