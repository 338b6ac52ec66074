//! NDJSON stream assembly.
//!
//! Sequence stamping is decoupled from connections: a per-job stamper task
//! polls the store, diffs snapshots through a tracker, and appends the
//! resulting events to the log until `stream_finished`. HTTP responses
//! only tail the log, so dropping a response mid-stream never loses
//! events and never cancels the job; a later `after_seq` resume picks up
//! exactly where the client left off.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use futures_util::Stream;
use serde_json::Value;

use super::AppState;
use crate::engine::tracker::StreamTracker;
use crate::engine::types::{Job, JobStatus, StreamEvent};

/// How often stream tasks poll the store for fresh snapshots.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn line(event: &StreamEvent) -> String {
    match serde_json::to_string(event) {
        Ok(json) => json + "\n",
        Err(_) => String::new(),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

pub(super) fn ndjson_response<S>(stream: S) -> Response<Body>
where
    S: Stream<Item = Result<String, Infallible>> + Send + 'static,
{
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/x-ndjson"),
    );
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    response
}

/// Spawn the per-job stamping task. With an initial job (streaming create)
/// the log opens with `job_queued` at seq 1 and the tracker is seeded with
/// `queued`; the late-attach fallback starts unseeded so a terminal
/// snapshot still produces its terminal events. Callers must hold the
/// stamper claim for the job.
pub(super) fn spawn_stamper(state: AppState, job_id: String, initial: Option<Job>) {
    tokio::spawn(async move {
        let mut tracker = if initial.is_some() {
            StreamTracker::starting_from(JobStatus::Queued)
        } else {
            StreamTracker::new()
        };
        if let Some(job) = initial {
            state
                .events
                .append(StreamEvent::new("job_queued", &job.id, to_value(&job)))
                .await;
        }

        loop {
            match state.engine.get_job(&job_id).await {
                Ok(snapshot) => {
                    let mut finished = false;
                    for event in tracker.diff(&snapshot) {
                        let event = state.events.append(event).await;
                        finished |= event.event == "stream_finished";
                    }
                    if finished {
                        return;
                    }
                }
                Err(err) => {
                    state
                        .events
                        .append(StreamEvent::new(
                            "error",
                            &job_id,
                            Value::from(err.to_string()),
                        ))
                        .await;
                    return;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    });
}

/// Tail a job's event log from `seq > after_seq`, blocking on new events
/// until `stream_finished` has been delivered. A tail that is already
/// caught up on a finished log closes immediately with an empty body.
pub(super) fn tail_log(state: AppState, job_id: String, after_seq: u64) -> Response<Body> {
    let stream = async_stream::stream! {
        let mut last_seq = after_seq;
        'outer: loop {
            let pending = state.events.events_after(&job_id, last_seq).await;
            if !pending.is_empty() {
                for event in pending {
                    last_seq = event.seq;
                    let finished = event.event == "stream_finished";
                    yield Ok::<_, Infallible>(line(&event));
                    if finished {
                        break 'outer;
                    }
                }
                continue;
            }
            if state.events.is_finished(&job_id).await {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    ndjson_response(stream)
}
