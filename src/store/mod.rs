//! In-memory job persistence.
//!
//! Everything crossing the store boundary is cloned, in both directions.
//! Callers never observe aliased mutable state, which the stream tracker
//! relies on for snapshot stability.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::engine::types::{Job, ResultItem};
use crate::error::{EngineError, Result};

/// Persistence contract required by the engine. Checkpoints are keyed by
/// `(job_id, step_id)` and outlive their creating job so reruns can reuse
/// upstream results until they are explicitly cleared.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<()>;
    async fn update_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<Job>;
    async fn list_jobs(&self) -> Vec<Job>;

    async fn save_checkpoint(&self, job_id: &str, step_id: &str, items: &[ResultItem]);
    async fn load_checkpoints(&self, job_id: &str) -> HashMap<String, Vec<ResultItem>>;
    async fn clear_checkpoints(&self, job_id: &str);
}

/// Process-local store backing the single-node engine.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<String, Job>>,
    checkpoints: RwLock<HashMap<String, HashMap<String, Vec<ResultItem>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(EngineError::AlreadyExists(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&job.id) {
            return Err(EngineError::NotFound(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn list_jobs(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }

    async fn save_checkpoint(&self, job_id: &str, step_id: &str, items: &[ResultItem]) {
        if items.is_empty() {
            return;
        }
        self.checkpoints
            .write()
            .await
            .entry(job_id.to_string())
            .or_default()
            .insert(step_id.to_string(), items.to_vec());
    }

    async fn load_checkpoints(&self, job_id: &str) -> HashMap<String, Vec<ResultItem>> {
        self.checkpoints
            .read()
            .await
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn clear_checkpoints(&self, job_id: &str) {
        self.checkpoints.write().await.remove(job_id);
    }
}
