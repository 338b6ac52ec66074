pub mod ollama;
pub mod openai;
pub mod registry;
pub mod synthetic;
pub mod traits;

pub use openai::OPENAI_API_KEY_ENV;
pub use registry::{default_profiles, merge_profile, ProviderRegistry};
pub use traits::{
    synthesize_chunks, Provider, ProviderChunk, ProviderInput, ProviderRequest, ProviderResponse,
};
