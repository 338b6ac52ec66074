//! Axum-based HTTP surface.
//!
//! The gateway owns everything sequence-related: it stamps `seq` onto every
//! outbound stream event and retains them per job so `after_seq` resumes
//! work even after a stream has ended. Request parsing, body limits, and
//! the JSON error envelope also live here; the engine stays HTTP-free.

pub mod events;
mod handlers;
mod streams;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;

use crate::engine::Engine;
use events::EventLog;
use handlers::{
    cancel_job, create_job, engine_config, get_job, handle_health, method_not_allowed, not_found,
    rerun_job, stream_job, upsert_provider,
};

/// Maximum request body size. Job inputs are text, not blobs.
const MAX_BODY_SIZE: usize = 1024 * 1024;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub events: Arc<EventLog>,
    pub started_at: Instant,
    pub version: &'static str,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let state = AppState {
        engine,
        events: Arc::new(EventLog::new()),
        started_at: Instant::now(),
        version: VERSION,
    };

    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/jobs", post(create_job))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/jobs/{id}/stream", get(stream_job))
        .route("/v1/jobs/{id}/cancel", post(cancel_job))
        .route("/v1/jobs/{id}/rerun", post(rerun_job))
        .route("/v1/config/providers", post(upsert_provider))
        .route("/v1/config/engine", post(engine_config))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .with_state(state)
}

/// Bind the address and serve until the process exits.
pub async fn run_gateway(addr: &str, engine: Arc<Engine>) -> Result<()> {
    let addr: SocketAddr = addr.parse().context("parse gateway bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind gateway socket")?;
    run_gateway_with_listener(listener, engine).await
}

/// Serve from a pre-bound listener (used by tests for ephemeral ports).
pub async fn run_gateway_with_listener(
    listener: tokio::net::TcpListener,
    engine: Arc<Engine>,
) -> Result<()> {
    let local = listener
        .local_addr()
        .context("get gateway listener local address")?;
    tracing::info!(%local, "gateway listening");
    axum::serve(listener, router(engine))
        .await
        .context("serve gateway")
}
