use std::collections::HashMap;

use serde_json::Value;

use super::types::{Job, JobStatus, StepExecutionStatus, StreamEvent};

/// Pure state machine that diffs successive job snapshots into stream
/// events. One tracker per subscription; it performs no I/O and relies on
/// snapshots being detached copies.
///
/// Guarantees: at most one `job_started` per job, terminals emitted exactly
/// once, and `stream_finished` is the last event the tracker ever produces.
pub struct StreamTracker {
    last_status: Option<JobStatus>,
    step_status: HashMap<String, StepExecutionStatus>,
    chunk_count: HashMap<String, usize>,
    last_item_count: usize,
    sent_started: bool,
    finished: bool,
}

impl StreamTracker {
    /// A tracker with no remembered status: the first diff reports
    /// `job_status` for whatever state it observes. Used when attaching to
    /// an existing job.
    pub fn new() -> Self {
        Self {
            last_status: None,
            step_status: HashMap::new(),
            chunk_count: HashMap::new(),
            last_item_count: 0,
            sent_started: false,
            finished: false,
        }
    }

    /// A tracker seeded with an already-reported status, so the first diff
    /// does not repeat it. The streaming create path seeds with `queued`
    /// because `job_queued` has already been emitted.
    pub fn starting_from(status: JobStatus) -> Self {
        Self {
            last_status: Some(status),
            ..Self::new()
        }
    }

    pub fn diff(&mut self, job: &Job) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut events = Vec::new();
        let job_data = to_value(job);
        let status_changed = self.last_status != Some(job.status);

        // Non-terminal status changes are reported before step events;
        // the terminal trio trails everything so `stream_finished` is
        // always the last event of the stream.
        if status_changed {
            if job.status == JobStatus::Running && !self.sent_started {
                events.push(StreamEvent::new("job_started", &job.id, job_data.clone()));
                self.sent_started = true;
            }
            if !job.status.is_terminal() {
                events.push(StreamEvent::new("job_status", &job.id, job_data.clone()));
            }
            self.last_status = Some(job.status);
        }

        for step in &job.step_executions {
            let prev = self.step_status.get(&step.step_id).copied();
            if prev != Some(step.status) {
                self.step_status.insert(step.step_id.clone(), step.status);
                let name = match step.status {
                    StepExecutionStatus::Running => Some("step_started"),
                    StepExecutionStatus::Success => Some("step_completed"),
                    StepExecutionStatus::Failed => Some("step_failed"),
                    StepExecutionStatus::Cancelled => Some("step_cancelled"),
                    StepExecutionStatus::Pending | StepExecutionStatus::Skipped => None,
                };
                if let Some(name) = name {
                    events.push(StreamEvent::new(name, &job.id, to_value(step)));
                }
            }

            let seen = self.chunk_count.get(&step.step_id).copied().unwrap_or(0);
            if step.chunks.len() > seen {
                for chunk in &step.chunks[seen..] {
                    events.push(StreamEvent::new("provider_chunk", &job.id, to_value(chunk)));
                }
                self.chunk_count
                    .insert(step.step_id.clone(), step.chunks.len());
            }
        }

        let items = job.result.as_ref().map(|r| r.items.as_slice()).unwrap_or(&[]);
        if items.len() > self.last_item_count {
            for item in &items[self.last_item_count..] {
                events.push(StreamEvent::new("item_completed", &job.id, to_value(item)));
            }
            self.last_item_count = items.len();
        }

        if status_changed && job.status.is_terminal() {
            events.push(StreamEvent::new("job_status", &job.id, job_data.clone()));
            let name = match job.status {
                JobStatus::Failed => "job_failed",
                JobStatus::Cancelled => "job_cancelled",
                _ => "job_completed",
            };
            events.push(StreamEvent::new(name, &job.id, job_data.clone()));
            events.push(StreamEvent::new("stream_finished", &job.id, job_data));
            self.finished = true;
        }

        events
    }
}

impl Default for StreamTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
