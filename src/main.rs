use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use pipeline_engine::config::Config;
use pipeline_engine::engine::{Engine, EngineConfig};
use pipeline_engine::store::MemoryStore;
use pipeline_engine::{gateway, logging};

#[derive(Parser)]
#[command(name = "pipeline-engine", version, about = "Single-node AI pipeline execution engine")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "PIPELINE_ENGINE_ADDR", default_value = pipeline_engine::config::DEFAULT_ADDR)]
    addr: String,

    /// Initial log level (overridable at runtime via /v1/config/engine).
    #[arg(long, env = "PIPELINE_ENGINE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Select the process-level rustls crypto provider before any TLS use.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("warning: failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config = Config::from_env();
    let profiles = config.provider_profiles();
    if config.openai_api_key.is_some() {
        tracing::info!("OpenAI provider enabled (profile openai-env)");
    } else {
        tracing::warn!(
            "OpenAI provider disabled ({} not set)",
            pipeline_engine::config::OPENAI_API_KEY_ENV
        );
    }
    if config.enable_ollama || config.ollama_base_url.is_some() {
        tracing::info!("Ollama provider enabled (profile ollama-env)");
    } else {
        tracing::warn!(
            "Ollama provider disabled (set {} or {})",
            pipeline_engine::config::ENABLE_OLLAMA_ENV,
            pipeline_engine::config::OLLAMA_BASE_URL_ENV
        );
    }

    let store = Arc::new(MemoryStore::new());
    let engine = Engine::with_config(store, EngineConfig { providers: profiles }).await;

    gateway::run_gateway(&cli.addr, engine).await
}
