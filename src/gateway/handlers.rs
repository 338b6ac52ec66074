use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{Response, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::Value;

use super::streams::{spawn_stamper, tail_log};
use super::AppState;
use crate::engine::types::{JobInput, JobMode, JobRequest, ProviderKind, ProviderProfile};
use crate::error::EngineError;
use crate::logging;

#[derive(Debug, Deserialize)]
pub(super) struct CreateJobQuery {
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub(super) struct StreamQuery {
    #[serde(default)]
    after_seq: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CancelBody {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RerunBody {
    #[serde(default)]
    from_step_id: Option<String>,
    #[serde(default)]
    reuse_upstream: bool,
    #[serde(default)]
    override_input: Option<JobInput>,
}

#[derive(Debug, Deserialize)]
struct ProviderProfilePayload {
    #[serde(default)]
    id: String,
    #[serde(default)]
    kind: Option<ProviderKind>,
    #[serde(default)]
    base_uri: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    default_model: Option<String>,
    #[serde(default)]
    extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct EngineConfigBody {
    #[serde(default)]
    log_level: Option<String>,
}

/// GET /health
pub(super) async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "uptime_sec": state.started_at.elapsed().as_secs_f64(),
    }))
}

/// POST /v1/jobs. `?stream=true` upgrades the response to NDJSON.
pub(super) async fn create_job(
    State(state): State<AppState>,
    Query(query): Query<CreateJobQuery>,
    body: Bytes,
) -> Response<Body> {
    let req: JobRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid payload: {err}"),
            )
        }
    };

    match state.engine.run_job(req).await {
        Ok(job) if query.stream.unwrap_or(false) => {
            let job_id = job.id.clone();
            if state.events.try_claim_stamper(&job_id).await {
                spawn_stamper(state.clone(), job_id.clone(), Some(job));
            }
            tail_log(state, job_id, 0)
        }
        Ok(job) => job_response(StatusCode::ACCEPTED, &job),
        Err(err) => engine_error(&err),
    }
}

/// GET /v1/jobs/{id}
pub(super) async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response<Body> {
    match state.engine.get_job(&id).await {
        Ok(job) => job_response(StatusCode::OK, &job),
        Err(err) => engine_error(&err),
    }
}

/// GET /v1/jobs/{id}/stream: live tail or `after_seq` resume.
///
/// Jobs that were never streamed get their events synthesized from store
/// snapshots by a freshly claimed stamper before the tail starts.
pub(super) async fn stream_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response<Body> {
    if !state.events.has_log(&id).await {
        if let Err(err) = state.engine.get_job(&id).await {
            return engine_error(&err);
        }
        if state.events.try_claim_stamper(&id).await {
            spawn_stamper(state.clone(), id.clone(), None);
        }
    }
    tail_log(state, id, query.after_seq.unwrap_or(0))
}

/// POST /v1/jobs/{id}/cancel. Idempotent; an empty body is allowed.
pub(super) async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response<Body> {
    let payload: CancelBody = if body.is_empty() {
        CancelBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(err) => {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("invalid payload: {err}"),
                )
            }
        }
    };

    let reason = payload.reason.unwrap_or_default();
    if let Err(err) = state.engine.cancel_job(&id, &reason).await {
        return engine_error(&err);
    }
    match state.engine.get_job(&id).await {
        Ok(job) => job_response(StatusCode::OK, &job),
        Err(err) => engine_error(&err),
    }
}

/// POST /v1/jobs/{id}/rerun. Parents the new job on the original.
pub(super) async fn rerun_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response<Body> {
    let payload: RerunBody = if body.is_empty() {
        RerunBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(err) => {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("invalid payload: {err}"),
                )
            }
        }
    };

    let base = match state.engine.get_job(&id).await {
        Ok(job) => job,
        Err(err) => return engine_error(&err),
    };

    let req = JobRequest {
        pipeline_type: base.pipeline_type.clone(),
        input: payload.override_input.unwrap_or(base.input),
        mode: JobMode::Rerun,
        parent_job_id: Some(base.id),
        from_step_id: payload.from_step_id,
        reuse_upstream: payload.reuse_upstream,
    };

    match state.engine.run_job(req).await {
        Ok(job) => job_response(StatusCode::ACCEPTED, &job),
        Err(err) => engine_error(&err),
    }
}

/// POST /v1/config/providers: profile upsert.
pub(super) async fn upsert_provider(
    State(state): State<AppState>,
    body: Bytes,
) -> Response<Body> {
    let payload: ProviderProfilePayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid payload: {err}"),
            )
        }
    };
    if payload.id.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "invalid_request", "id is required");
    }

    let profile = ProviderProfile {
        id: payload.id,
        kind: payload.kind.unwrap_or(ProviderKind::LocalTool),
        base_uri: payload.base_uri,
        api_key: payload.api_key,
        default_model: payload.default_model,
        extra: payload.extra,
    };

    match state.engine.upsert_provider_profile(profile.clone()).await {
        Ok(()) => json_response(StatusCode::OK, &profile),
        Err(err) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "config_error",
            &err.to_string(),
        ),
    }
}

/// POST /v1/config/engine: runtime reconfiguration.
pub(super) async fn engine_config(State(_): State<AppState>, body: Bytes) -> Response<Body> {
    let payload: EngineConfigBody = if body.is_empty() {
        EngineConfigBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(err) => {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("invalid payload: {err}"),
                )
            }
        }
    };

    let Some(level) = payload.log_level.filter(|l| !l.is_empty()) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "no configuration provided",
        );
    };

    match logging::set_level(&level) {
        Ok(applied) => json_response(StatusCode::OK, &serde_json::json!({ "log_level": applied })),
        Err(err) => api_error(StatusCode::BAD_REQUEST, "invalid_request", &err),
    }
}

pub(super) async fn not_found() -> Response<Body> {
    api_error(StatusCode::NOT_FOUND, "not_found", "resource not found")
}

pub(super) async fn method_not_allowed() -> Response<Body> {
    api_error(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        "method not allowed",
    )
}

fn job_response(status: StatusCode, job: &crate::engine::types::Job) -> Response<Body> {
    json_response(status, &serde_json::json!({ "job": job }))
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    (status, Json(serde_json::to_value(value).unwrap_or(Value::Null))).into_response()
}

fn api_error(status: StatusCode, code: &str, message: &str) -> Response<Body> {
    (
        status,
        Json(serde_json::json!({
            "error": { "code": code, "message": message }
        })),
    )
        .into_response()
}

fn engine_error(err: &EngineError) -> Response<Body> {
    let status = match err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Config(_) | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    api_error(status, err.code(), &err.to_string())
}
