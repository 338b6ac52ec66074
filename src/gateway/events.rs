//! Per-job event log.
//!
//! The gateway owns sequence assignment: every outbound event is stamped
//! with `seq = last_seq + 1` for its job and retained so `after_seq`
//! resumes keep working after the live stream has ended. Trackers and the
//! engine never see sequence numbers.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::engine::types::StreamEvent;

#[derive(Default)]
struct JobLog {
    last_seq: u64,
    events: Vec<StreamEvent>,
    stamping: bool,
}

#[derive(Default)]
pub struct EventLog {
    logs: RwLock<HashMap<String, JobLog>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp the next sequence number onto the event and retain it.
    /// Events without a job id pass through unstamped.
    pub async fn append(&self, mut event: StreamEvent) -> StreamEvent {
        if event.job_id.is_empty() {
            return event;
        }
        let mut logs = self.logs.write().await;
        let log = logs.entry(event.job_id.clone()).or_default();
        log.last_seq += 1;
        event.seq = log.last_seq;
        log.events.push(event.clone());
        event
    }

    /// All retained events with `seq > after_seq`, in order.
    pub async fn events_after(&self, job_id: &str, after_seq: u64) -> Vec<StreamEvent> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(job_id) else {
            return Vec::new();
        };
        log.events
            .iter()
            .filter(|e| e.seq > after_seq)
            .cloned()
            .collect()
    }

    pub async fn has_log(&self, job_id: &str) -> bool {
        self.logs
            .read()
            .await
            .get(job_id)
            .is_some_and(|log| log.last_seq > 0)
    }

    /// Whether the job's stream has already ended; a resume that is fully
    /// caught up on a finished log closes immediately instead of polling.
    pub async fn is_finished(&self, job_id: &str) -> bool {
        self.logs
            .read()
            .await
            .get(job_id)
            .and_then(|log| log.events.last())
            .is_some_and(|event| event.event == "stream_finished")
    }

    /// Claim the right to run the stamping task for a job. At most one
    /// claim per job ever succeeds, so concurrent subscribers cannot
    /// double-stamp events.
    pub async fn try_claim_stamper(&self, job_id: &str) -> bool {
        let mut logs = self.logs.write().await;
        let log = logs.entry(job_id.to_string()).or_default();
        if log.stamping {
            false
        } else {
            log.stamping = true;
            true
        }
    }

    pub async fn last_seq(&self, job_id: &str) -> u64 {
        self.logs
            .read()
            .await
            .get(job_id)
            .map_or(0, |log| log.last_seq)
    }
}
