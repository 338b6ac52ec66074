//! The DAG execution engine.
//!
//! One supervisor task per job owns every mutation of that job's record
//! until it reaches a terminal state; the only other writer is the cancel
//! path, which transitions the job atomically through the store. All reads
//! and writes cross the store boundary as detached copies.

pub mod cancel;
pub mod tracker;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};

use crate::error::{EngineError, Result};
use crate::prompt::build_prompt;
use crate::providers::traits::{Provider, ProviderInput, ProviderRequest, ProviderResponse};
use crate::providers::ProviderRegistry;
use crate::store::JobStore;
use cancel::{CancelHandle, CancelSignal};
use types::{
    generate_id, Job, JobError, JobMode, JobRequest, JobStatus, PipelineDef, ProviderProfile,
    ResultItem, Source, StepChunk, StepDef, StepExecution, StepExecutionStatus, StepKind, StepMode,
};

/// Cancellable pacing delay at step admission. Doubles as the guaranteed
/// cancellation suspension point before provider resolution.
const STEP_ADMISSION_DELAY: Duration = Duration::from_millis(100);

/// Runtime configuration for the engine.
#[derive(Debug, Default)]
pub struct EngineConfig {
    pub providers: Vec<ProviderProfile>,
}

pub struct Engine {
    store: Arc<dyn JobStore>,
    registry: ProviderRegistry,
    pipelines: RwLock<HashMap<String, PipelineDef>>,
    job_pipelines: RwLock<HashMap<String, PipelineDef>>,
    cancels: Mutex<HashMap<String, CancelHandle>>,
}

impl Engine {
    pub async fn new(store: Arc<dyn JobStore>) -> Arc<Self> {
        Self::with_config(store, EngineConfig::default()).await
    }

    pub async fn with_config(store: Arc<dyn JobStore>, config: EngineConfig) -> Arc<Self> {
        let registry = ProviderRegistry::with_defaults().await;
        for profile in config.providers {
            registry.upsert_profile(profile).await;
        }
        Arc::new(Self {
            store,
            registry,
            pipelines: RwLock::new(HashMap::new()),
            job_pipelines: RwLock::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        })
    }

    /// Register or replace a pipeline definition. Definitions are
    /// normalized on the way in; an empty type is ignored.
    pub async fn register_pipeline(&self, def: PipelineDef) {
        if def.pipeline_type.is_empty() {
            return;
        }
        let normalized = def.normalized();
        self.pipelines
            .write()
            .await
            .insert(normalized.pipeline_type.clone(), normalized);
    }

    pub async fn upsert_provider_profile(&self, profile: ProviderProfile) -> Result<()> {
        if profile.id.is_empty() {
            return Err(EngineError::InvalidRequest("id is required".to_string()));
        }
        self.registry.upsert_profile(profile).await;
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.store.get_job(job_id).await
    }

    /// Create a job and schedule it. `sync` mode runs the supervisor inline
    /// and returns the final job; any other mode returns the queued job
    /// immediately.
    pub async fn run_job(self: &Arc<Self>, req: JobRequest) -> Result<Job> {
        if req.pipeline_type.is_empty() {
            return Err(EngineError::InvalidRequest(
                "pipeline_type is required".to_string(),
            ));
        }

        let pipeline = self.pipeline_for_type(&req.pipeline_type).await;
        if let Some(from) = &req.from_step_id {
            if !pipeline.steps.iter().any(|s| &s.id == from) {
                return Err(EngineError::UnknownStep(from.clone()));
            }
        }

        let now = Utc::now();
        let job = Job {
            id: generate_id(),
            pipeline_type: req.pipeline_type,
            pipeline_version: pipeline.version.clone(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            input: req.input,
            result: None,
            error: None,
            step_executions: pipeline
                .steps
                .iter()
                .map(|s| StepExecution::pending(&s.id))
                .collect(),
            parent_job_id: req.parent_job_id,
            mode: req.mode,
            rerun_from_step: req.from_step_id,
            reuse_upstream: req.reuse_upstream,
        };

        self.job_pipelines
            .write()
            .await
            .insert(job.id.clone(), pipeline);
        if let Err(err) = self.store.create_job(&job).await {
            self.job_pipelines.write().await.remove(&job.id);
            return Err(err);
        }

        let (handle, signal) = CancelHandle::new();
        self.cancels.lock().await.insert(job.id.clone(), handle);
        tracing::info!(job_id = %job.id, pipeline = %job.pipeline_type, mode = ?job.mode, "job queued");

        if job.mode == JobMode::Sync {
            Arc::clone(self).execute_job(job.id.clone(), signal).await;
            return self.store.get_job(&job.id).await;
        }

        let engine = Arc::clone(self);
        let job_id = job.id.clone();
        tokio::spawn(async move {
            engine.execute_job(job_id, signal).await;
        });
        Ok(job)
    }

    /// Cancel a queued or running job. Terminal jobs are a no-op success;
    /// unknown jobs surface `not_found`.
    pub async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<()> {
        let mut job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(());
        }

        let reason = if reason.is_empty() {
            "cancelled by user"
        } else {
            reason
        };

        if let Some(handle) = self.cancels.lock().await.get(job_id) {
            handle.cancel();
        }

        let now = Utc::now();
        job.status = JobStatus::Cancelled;
        job.error = Some(JobError::new("cancelled", reason));
        job.updated_at = now;
        for exec in &mut job.step_executions {
            if matches!(
                exec.status,
                StepExecutionStatus::Pending | StepExecutionStatus::Running
            ) {
                exec.status = StepExecutionStatus::Cancelled;
                exec.finished_at = Some(now);
            }
        }
        self.store.update_job(&job).await?;
        self.cancels.lock().await.remove(job_id);
        tracing::info!(job_id, reason, "job cancelled");
        Ok(())
    }

    async fn execute_job(self: Arc<Self>, job_id: String, cancel: CancelSignal) {
        self.run_supervisor(&job_id, &cancel).await;
        self.cancels.lock().await.remove(&job_id);
        self.job_pipelines.write().await.remove(&job_id);
    }

    async fn run_supervisor(&self, job_id: &str, cancel: &CancelSignal) {
        let Ok(mut job) = self.store.get_job(job_id).await else {
            return;
        };

        let cached = self.job_pipelines.read().await.get(job_id).cloned();
        let pipeline = match cached {
            Some(def) => def,
            None => self.pipeline_for_type(&job.pipeline_type).await,
        };

        if job.step_executions.len() != pipeline.steps.len() {
            job.step_executions = pipeline
                .steps
                .iter()
                .map(|s| StepExecution::pending(&s.id))
                .collect();
        }

        let mut outputs: HashMap<String, Vec<ResultItem>> = HashMap::new();
        let start_index = job
            .rerun_from_step
            .as_ref()
            .and_then(|from| pipeline.steps.iter().position(|s| &s.id == from))
            .unwrap_or(0);

        if job.reuse_upstream {
            if let Some(parent_id) = job.parent_job_id.clone() {
                let reused = self.store.load_checkpoints(&parent_id).await;
                for idx in 0..start_index.min(pipeline.steps.len()) {
                    let step = &pipeline.steps[idx];
                    if let Some(items) = reused.get(&step.id) {
                        outputs.insert(step.id.clone(), items.clone());
                        job.step_executions[idx].status = StepExecutionStatus::Skipped;
                        if step.export {
                            job.append_result_items(items);
                        }
                    }
                }
            }
        }

        job.status = JobStatus::Running;
        job.updated_at = Utc::now();
        if !self.persist(&job).await {
            return;
        }

        for (idx, step) in pipeline.steps.iter().enumerate() {
            if job.reuse_upstream && idx < start_index {
                continue;
            }
            if cancel.is_cancelled() {
                // The cancel path has already written the terminal state.
                return;
            }

            if let Some(dep) = step.depends_on.iter().find(|d| !outputs.contains_key(*d)) {
                let err = EngineError::MissingDependency {
                    step_id: step.id.clone(),
                    dependency: dep.clone(),
                };
                self.fail_step(&mut job, idx, &err).await;
                return;
            }

            job.step_executions[idx].status = StepExecutionStatus::Running;
            job.step_executions[idx].started_at = Some(Utc::now());
            if !self.persist(&job).await {
                return;
            }

            let prompt = build_prompt(step, &job, &outputs);
            match self
                .run_step(&mut job, idx, step, &prompt, &outputs, cancel)
                .await
            {
                Ok(items) => {
                    let now = Utc::now();
                    let exec = &mut job.step_executions[idx];
                    exec.status = StepExecutionStatus::Success;
                    exec.finished_at = Some(now);
                    exec.error = None;
                    job.updated_at = now;
                    self.store.save_checkpoint(&job.id, &step.id, &items).await;
                    if step.export {
                        job.append_result_items(&items);
                    }
                    outputs.insert(step.id.clone(), items);
                    if !self.persist(&job).await {
                        return;
                    }
                }
                Err(err) if err.is_cancelled() => return,
                Err(err) => {
                    self.fail_step(&mut job, idx, &err).await;
                    return;
                }
            }
        }

        job.status = JobStatus::Succeeded;
        job.updated_at = Utc::now();
        let _ = self.persist(&job).await;
        tracing::info!(job_id = %job.id, "job succeeded");
    }

    /// Write the supervisor's working copy back, unless another writer has
    /// already parked the job in a terminal state. Terminal statuses are
    /// final.
    async fn persist(&self, job: &Job) -> bool {
        match self.store.get_job(&job.id).await {
            Ok(current) if current.status.is_terminal() => false,
            Ok(_) => self.store.update_job(job).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn fail_step(&self, job: &mut Job, idx: usize, err: &EngineError) {
        let code = match err {
            EngineError::Internal(_) => "step_failed",
            other => other.code(),
        };
        let job_err = JobError::new(code, err.to_string());
        let now = Utc::now();
        if let Some(exec) = job.step_executions.get_mut(idx) {
            exec.status = StepExecutionStatus::Failed;
            exec.finished_at = Some(now);
            exec.error = Some(job_err.clone());
        }
        tracing::warn!(job_id = %job.id, step = idx, code, "step failed");
        job.status = JobStatus::Failed;
        job.error = Some(job_err);
        job.updated_at = now;
        let _ = self.persist(job).await;
    }

    async fn run_step(
        &self,
        job: &mut Job,
        idx: usize,
        step: &StepDef,
        prompt: &str,
        outputs: &HashMap<String, Vec<ResultItem>>,
        cancel: &CancelSignal,
    ) -> Result<Vec<ResultItem>> {
        tokio::select! {
            () = tokio::time::sleep(STEP_ADMISSION_DELAY) => {}
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
        }

        let resolved = self.resolve_provider(step).await?;
        let input = ProviderInput {
            sources: job.input.sources.clone(),
            options: job.input.options.clone(),
            previous: outputs.clone(),
        };

        match step.mode {
            StepMode::Fanout => {
                self.run_fanout(job, idx, &resolved, step, prompt, input, cancel)
                    .await
            }
            StepMode::PerItem => {
                let base = step
                    .depends_on
                    .last()
                    .and_then(|dep| outputs.get(dep))
                    .cloned()
                    .unwrap_or_default();
                if base.is_empty() {
                    self.run_fanout(job, idx, &resolved, step, prompt, input, cancel)
                        .await
                } else {
                    self.run_per_item(job, idx, &resolved, step, prompt, input, base, cancel)
                        .await
                }
            }
            StepMode::Single => self
                .run_single(job, idx, &resolved, step, prompt, input, cancel)
                .await
                .map(|item| vec![item]),
        }
    }

    /// A step with an empty `provider_profile_id` runs without a provider
    /// and synthesizes a deterministic result; a set but unresolvable
    /// profile fails the step with the resolution error.
    async fn resolve_provider(&self, step: &StepDef) -> Result<Option<ResolvedProvider>> {
        if step.provider_profile_id.is_empty() {
            return Ok(None);
        }
        let (provider, profile) = self.registry.resolve(step).await?;
        Ok(Some((provider, profile)))
    }

    async fn call_provider(
        &self,
        resolved: &Option<ResolvedProvider>,
        step: &StepDef,
        prompt: &str,
        input: ProviderInput,
        cancel: &CancelSignal,
    ) -> Result<ProviderResponse> {
        match resolved {
            None => Ok(ProviderResponse::default()),
            Some((provider, profile)) => {
                provider
                    .call(
                        ProviderRequest {
                            step: step.clone(),
                            prompt: prompt.to_string(),
                            profile: profile.clone(),
                            input,
                        },
                        cancel.clone(),
                    )
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_single(
        &self,
        job: &mut Job,
        idx: usize,
        resolved: &Option<ResolvedProvider>,
        step: &StepDef,
        prompt: &str,
        input: ProviderInput,
        cancel: &CancelSignal,
    ) -> Result<ResultItem> {
        let resp = self
            .call_provider(resolved, step, prompt, input, cancel)
            .await?;
        self.record_chunks(job, idx, &resp.chunks).await;
        let text = if resp.output.is_empty() {
            format!(
                "step {} processed {} sources",
                step.id,
                job.input.sources.len()
            )
        } else {
            resp.output
        };
        Ok(single_result(step, job, prompt, &text, &resp.metadata))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_fanout(
        &self,
        job: &mut Job,
        idx: usize,
        resolved: &Option<ResolvedProvider>,
        step: &StepDef,
        prompt: &str,
        input: ProviderInput,
        cancel: &CancelSignal,
    ) -> Result<Vec<ResultItem>> {
        let sources = job.input.sources.clone();
        if sources.is_empty() {
            return self
                .run_single(job, idx, resolved, step, prompt, input, cancel)
                .await
                .map(|item| vec![item]);
        }

        let mut items = Vec::with_capacity(sources.len());
        for (i, src) in sources.iter().enumerate() {
            let mut local = input.clone();
            local.sources = vec![src.clone()];
            let resp = self
                .call_provider(resolved, step, prompt, local, cancel)
                .await?;
            self.record_chunks(job, idx, &resp.chunks).await;
            let text = if resp.output.is_empty() {
                format!("step {} handled source {}", step.id, src.label)
            } else {
                resp.output
            };
            items.push(fanout_result(step, prompt, src, i, &text, &resp.metadata));
        }
        Ok(items)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_per_item(
        &self,
        job: &mut Job,
        idx: usize,
        resolved: &Option<ResolvedProvider>,
        step: &StepDef,
        prompt: &str,
        input: ProviderInput,
        base: Vec<ResultItem>,
        cancel: &CancelSignal,
    ) -> Result<Vec<ResultItem>> {
        let mut items = Vec::with_capacity(base.len());
        for (i, prev) in base.iter().enumerate() {
            let mut local = input.clone();
            local.previous = HashMap::from([(prev.step_id.clone(), vec![prev.clone()])]);
            let resp = self
                .call_provider(resolved, step, prompt, local, cancel)
                .await?;
            self.record_chunks(job, idx, &resp.chunks).await;
            let shard = prev
                .shard_key
                .clone()
                .unwrap_or_else(|| format!("{}-{}", step.id, i));
            let text = if resp.output.is_empty() {
                format!("step {} refined shard {}", step.id, shard)
            } else {
                resp.output
            };
            items.push(per_item_result(
                step,
                prompt,
                prev,
                shard,
                i,
                &text,
                &resp.metadata,
            ));
        }
        Ok(items)
    }

    /// Extend the step execution with a batch of chunks and persist, so
    /// subscribed trackers observe `provider_chunk` events as they happen.
    async fn record_chunks(
        &self,
        job: &mut Job,
        idx: usize,
        chunks: &[crate::providers::ProviderChunk],
    ) {
        if chunks.is_empty() {
            return;
        }
        let Some(exec) = job.step_executions.get_mut(idx) else {
            return;
        };
        for chunk in chunks {
            let index = exec.chunks.len();
            exec.chunks.push(StepChunk {
                step_id: exec.step_id.clone(),
                index,
                content: chunk.content.clone(),
            });
        }
        job.updated_at = Utc::now();
        let _ = self.persist(job).await;
    }

    async fn pipeline_for_type(&self, pipeline_type: &str) -> PipelineDef {
        if let Some(def) = self.pipelines.read().await.get(pipeline_type) {
            return def.clone();
        }
        PipelineDef::default_for(pipeline_type)
    }
}

type ResolvedProvider = (Arc<dyn Provider>, ProviderProfile);

fn step_label(step: &StepDef) -> String {
    if step.name.is_empty() {
        step.id.clone()
    } else {
        step.name.clone()
    }
}

fn step_kind_str(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Llm => "llm",
        StepKind::Image => "image",
        StepKind::Map => "map",
        StepKind::Reduce => "reduce",
        StepKind::Custom => "custom",
    }
}

fn source_kind_str(source: &Source) -> &'static str {
    match source.kind {
        types::SourceKind::Log => "log",
        types::SourceKind::Code => "code",
        types::SourceKind::Note => "note",
        types::SourceKind::Raw => "raw",
    }
}

fn base_item(step: &StepDef, label: String, data: Map<String, Value>) -> ResultItem {
    ResultItem {
        id: generate_id(),
        label,
        step_id: step.id.clone(),
        shard_key: None,
        is_primary: false,
        kind: step_kind_str(step.kind).to_string(),
        tag: step.export_tag.clone(),
        content_type: step.output_type,
        data,
    }
}

fn single_result(
    step: &StepDef,
    job: &Job,
    prompt: &str,
    text: &str,
    meta: &Map<String, Value>,
) -> ResultItem {
    let mut data = Map::new();
    data.insert("text".to_string(), Value::from(text));
    data.insert("prompt".to_string(), Value::from(prompt));
    data.insert(
        "pipelineType".to_string(),
        Value::from(job.pipeline_type.clone()),
    );
    merge_meta(&mut data, meta);
    base_item(step, step_label(step), data)
}

fn fanout_result(
    step: &StepDef,
    prompt: &str,
    src: &Source,
    idx: usize,
    text: &str,
    meta: &Map<String, Value>,
) -> ResultItem {
    let mut data = Map::new();
    data.insert("text".to_string(), Value::from(text));
    data.insert("prompt".to_string(), Value::from(prompt));
    data.insert("source_kind".to_string(), Value::from(source_kind_str(src)));
    data.insert("source".to_string(), Value::from(src.content.clone()));
    merge_meta(&mut data, meta);
    let mut item = base_item(step, format!("{}#{}", step_label(step), idx + 1), data);
    item.shard_key = Some(format!("{}-{}", step.id, idx));
    item
}

fn per_item_result(
    step: &StepDef,
    prompt: &str,
    prev: &ResultItem,
    shard: String,
    idx: usize,
    text: &str,
    meta: &Map<String, Value>,
) -> ResultItem {
    let mut data = Map::new();
    data.insert("text".to_string(), Value::from(text));
    data.insert("prompt".to_string(), Value::from(prompt));
    data.insert(
        "previous_step".to_string(),
        Value::from(prev.step_id.clone()),
    );
    merge_meta(&mut data, meta);
    let mut item = base_item(step, format!("{}#{}", step_label(step), idx + 1), data);
    item.shard_key = Some(shard);
    item
}

fn merge_meta(data: &mut Map<String, Value>, meta: &Map<String, Value>) {
    for (k, v) in meta {
        data.insert(k.clone(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{JobInput, JobOptions, SourceKind};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn sample_request() -> JobRequest {
        JobRequest {
            pipeline_type: "sample_pipeline".to_string(),
            input: JobInput {
                sources: vec![Source {
                    kind: SourceKind::Note,
                    label: "release note".to_string(),
                    content: "smoke check input".to_string(),
                    metadata: None,
                }],
                options: Some(JobOptions {
                    max_tokens: None,
                    detail_level: None,
                    language: Some("en".to_string()),
                }),
            },
            ..JobRequest::default()
        }
    }

    async fn wait_for_status(
        store: &MemoryStore,
        job_id: &str,
        expected: JobStatus,
    ) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let job = store.get_job(job_id).await.expect("job should exist");
            if job.status == expected {
                return job;
            }
            assert!(
                !(job.status.is_terminal() && job.status != expected),
                "job reached unexpected terminal state {:?}",
                job.status
            );
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {expected:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn two_step_pipeline() -> PipelineDef {
        PipelineDef {
            pipeline_type: "dag.v0".to_string(),
            version: "v1".to_string(),
            steps: vec![
                StepDef {
                    id: "A".to_string(),
                    name: "Collect".to_string(),
                    mode: StepMode::Fanout,
                    provider_profile_id: "default-local".to_string(),
                    export: true,
                    ..StepDef::default()
                },
                StepDef {
                    id: "B".to_string(),
                    name: "Merge".to_string(),
                    depends_on: vec!["A".to_string()],
                    provider_profile_id: "default-local".to_string(),
                    export: true,
                    ..StepDef::default()
                },
            ],
        }
    }

    fn two_sources_input() -> JobInput {
        JobInput {
            sources: vec![
                Source {
                    kind: SourceKind::Log,
                    label: "first".to_string(),
                    content: "log line".to_string(),
                    metadata: None,
                },
                Source {
                    kind: SourceKind::Code,
                    label: "second".to_string(),
                    content: "fn main() {}".to_string(),
                    metadata: None,
                },
            ],
            options: None,
        }
    }

    #[tokio::test]
    async fn default_pipeline_job_succeeds_with_one_item() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).await;
        let job = engine.run_job(sample_request()).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let done = wait_for_status(&store, &job.id, JobStatus::Succeeded).await;
        let items = &done.result.as_ref().unwrap().items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content_type, types::ContentType::Text);
        // Empty profile id: the engine synthesizes a deterministic result.
        assert_eq!(
            items[0].data["text"],
            serde_json::json!("step step-1 processed 1 sources")
        );
        assert_eq!(done.step_executions.len(), 1);
        assert_eq!(
            done.step_executions[0].status,
            StepExecutionStatus::Success
        );
    }

    #[tokio::test]
    async fn sync_mode_returns_final_job() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store).await;
        let mut req = sample_request();
        req.mode = JobMode::Sync;
        let job = engine.run_job(req).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.result.is_some());
    }

    #[tokio::test]
    async fn empty_pipeline_type_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store).await;
        let err = engine.run_job(JobRequest::default()).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn unknown_from_step_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store).await;
        let mut req = sample_request();
        req.from_step_id = Some("ghost".to_string());
        let err = engine.run_job(req).await.unwrap_err();
        assert_eq!(err.code(), "unknown_step");
    }

    #[tokio::test]
    async fn cancel_stops_execution_and_marks_steps() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).await;
        let job = engine.run_job(sample_request()).await.unwrap();

        wait_for_status(&store, &job.id, JobStatus::Running).await;
        engine.cancel_job(&job.id, "test cancel").await.unwrap();

        let done = wait_for_status(&store, &job.id, JobStatus::Cancelled).await;
        let err = done.error.unwrap();
        assert_eq!(err.code, "cancelled");
        assert_eq!(err.message, "test cancel");
        for exec in &done.step_executions {
            assert_eq!(exec.status, StepExecutionStatus::Cancelled);
            assert!(exec.finished_at.is_some());
        }
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_checks_existence() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).await;

        let err = engine.cancel_job("missing", "").await.unwrap_err();
        assert_eq!(err.code(), "not_found");

        let mut req = sample_request();
        req.mode = JobMode::Sync;
        let job = engine.run_job(req).await.unwrap();
        // Terminal job: cancelling twice stays a success and changes nothing.
        engine.cancel_job(&job.id, "late").await.unwrap();
        engine.cancel_job(&job.id, "later").await.unwrap();
        let stored = store.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn fanout_then_single_produces_ordered_exports() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).await;
        engine.register_pipeline(two_step_pipeline()).await;

        let req = JobRequest {
            pipeline_type: "dag.v0".to_string(),
            input: two_sources_input(),
            ..JobRequest::default()
        };
        let job = engine.run_job(req).await.unwrap();
        let done = wait_for_status(&store, &job.id, JobStatus::Succeeded).await;

        let items = &done.result.as_ref().unwrap().items;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].label, "Collect#1");
        assert_eq!(items[0].shard_key.as_deref(), Some("A-0"));
        assert_eq!(items[0].data["source_kind"], serde_json::json!("log"));
        assert_eq!(items[1].shard_key.as_deref(), Some("A-1"));
        assert_eq!(items[2].label, "Merge");
        assert_eq!(items[2].step_id, "B");

        // Result item ids are unique within the job.
        let mut ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn fanout_with_no_sources_degrades_to_single() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).await;
        engine
            .register_pipeline(PipelineDef {
                pipeline_type: "fan.v0".to_string(),
                version: String::new(),
                steps: vec![StepDef {
                    id: "only".to_string(),
                    mode: StepMode::Fanout,
                    provider_profile_id: "default-local".to_string(),
                    export: true,
                    ..StepDef::default()
                }],
            })
            .await;

        let req = JobRequest {
            pipeline_type: "fan.v0".to_string(),
            mode: JobMode::Sync,
            ..JobRequest::default()
        };
        let job = engine.run_job(req).await.unwrap();
        let items = &job.result.as_ref().unwrap().items;
        assert_eq!(items.len(), 1);
        assert!(items[0].shard_key.is_none());
    }

    #[tokio::test]
    async fn per_item_consumes_last_dependency_items() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).await;
        engine
            .register_pipeline(PipelineDef {
                pipeline_type: "refine.v0".to_string(),
                version: String::new(),
                steps: vec![
                    StepDef {
                        id: "shards".to_string(),
                        mode: StepMode::Fanout,
                        provider_profile_id: "default-local".to_string(),
                        ..StepDef::default()
                    },
                    StepDef {
                        id: "refine".to_string(),
                        name: "Refine".to_string(),
                        mode: StepMode::PerItem,
                        depends_on: vec!["shards".to_string()],
                        provider_profile_id: "default-local".to_string(),
                        export: true,
                        ..StepDef::default()
                    },
                ],
            })
            .await;

        let req = JobRequest {
            pipeline_type: "refine.v0".to_string(),
            input: two_sources_input(),
            mode: JobMode::Sync,
            ..JobRequest::default()
        };
        let job = engine.run_job(req).await.unwrap();
        let items = &job.result.as_ref().unwrap().items;
        assert_eq!(items.len(), 2);
        // Shard keys from the upstream fanout are preserved.
        assert_eq!(items[0].shard_key.as_deref(), Some("shards-0"));
        assert_eq!(items[1].shard_key.as_deref(), Some("shards-1"));
        assert_eq!(items[0].data["previous_step"], serde_json::json!("shards"));
    }

    #[tokio::test]
    async fn missing_dependency_fails_the_step() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).await;
        engine
            .register_pipeline(PipelineDef {
                pipeline_type: "broken.v0".to_string(),
                version: String::new(),
                steps: vec![StepDef {
                    id: "b".to_string(),
                    depends_on: vec!["never-ran".to_string()],
                    provider_profile_id: "default-local".to_string(),
                    ..StepDef::default()
                }],
            })
            .await;

        let req = JobRequest {
            pipeline_type: "broken.v0".to_string(),
            mode: JobMode::Sync,
            ..JobRequest::default()
        };
        let job = engine.run_job(req).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_ref().unwrap().code, "missing_dependency");
        assert_eq!(
            job.step_executions[0].status,
            StepExecutionStatus::Failed
        );
    }

    #[tokio::test]
    async fn unresolvable_profile_fails_the_step() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).await;
        engine
            .register_pipeline(PipelineDef {
                pipeline_type: "missing-profile.v0".to_string(),
                version: String::new(),
                steps: vec![StepDef {
                    id: "s".to_string(),
                    provider_profile_id: "no-such-profile".to_string(),
                    ..StepDef::default()
                }],
            })
            .await;

        let req = JobRequest {
            pipeline_type: "missing-profile.v0".to_string(),
            mode: JobMode::Sync,
            ..JobRequest::default()
        };
        let job = engine.run_job(req).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_ref().unwrap().code, "profile_not_found");
    }

    #[tokio::test]
    async fn rerun_with_reuse_skips_upstream_and_reuses_items() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).await;
        engine.register_pipeline(two_step_pipeline()).await;

        let parent = engine
            .run_job(JobRequest {
                pipeline_type: "dag.v0".to_string(),
                input: two_sources_input(),
                mode: JobMode::Sync,
                ..JobRequest::default()
            })
            .await
            .unwrap();
        let parent_items = parent.result.as_ref().unwrap().items.clone();
        assert_eq!(parent_items.len(), 3);

        let rerun = engine
            .run_job(JobRequest {
                pipeline_type: "dag.v0".to_string(),
                input: parent.input.clone(),
                mode: JobMode::Sync,
                parent_job_id: Some(parent.id.clone()),
                from_step_id: Some("B".to_string()),
                reuse_upstream: true,
            })
            .await
            .unwrap();

        assert_eq!(rerun.status, JobStatus::Succeeded);
        assert_eq!(rerun.parent_job_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(
            rerun.step_executions[0].status,
            StepExecutionStatus::Skipped
        );
        assert_eq!(
            rerun.step_executions[1].status,
            StepExecutionStatus::Success
        );

        let rerun_items = &rerun.result.as_ref().unwrap().items;
        assert_eq!(rerun_items.len(), 3);
        // Upstream items are reused verbatim, including their ids.
        assert_eq!(rerun_items[0].id, parent_items[0].id);
        assert_eq!(rerun_items[1].id, parent_items[1].id);
        assert_ne!(rerun_items[2].id, parent_items[2].id);
    }

    #[tokio::test]
    async fn upsert_profile_requires_id() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store).await;
        let err = engine
            .upsert_provider_profile(ProviderProfile {
                id: String::new(),
                kind: types::ProviderKind::LocalTool,
                base_uri: String::new(),
                api_key: None,
                default_model: None,
                extra: Map::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn chunks_are_recorded_densely_per_step() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone()).await;
        engine
            .register_pipeline(PipelineDef {
                pipeline_type: "chunky.v0".to_string(),
                version: String::new(),
                steps: vec![StepDef {
                    id: "tool".to_string(),
                    mode: StepMode::Fanout,
                    provider_profile_id: "default-local".to_string(),
                    export: true,
                    ..StepDef::default()
                }],
            })
            .await;

        let job = engine
            .run_job(JobRequest {
                pipeline_type: "chunky.v0".to_string(),
                input: two_sources_input(),
                mode: JobMode::Sync,
                ..JobRequest::default()
            })
            .await
            .unwrap();

        let chunks = &job.step_executions[0].chunks;
        assert!(!chunks.is_empty());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.step_id, "tool");
        }
    }
}
