use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Provider kinds the registry knows how to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    Ollama,
    Image,
    LocalTool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Text,
    Markdown,
    Json,
    Image,
    Embedding,
    Table,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Text,
    JsonStrict,
    JsonLoose,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Llm,
    Image,
    Map,
    Reduce,
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    #[default]
    Single,
    Fanout,
    PerItem,
}

/// One node of a pipeline definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: StepKind,
    #[serde(default)]
    pub mode: StepMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider_profile_id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub provider_override: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptTemplate>,
    #[serde(default)]
    pub output_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub export: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_tag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDef {
    #[serde(rename = "type")]
    pub pipeline_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub steps: Vec<StepDef>,
}

impl PipelineDef {
    /// The fallback pipeline used when a type has no registered definition.
    pub fn default_for(pipeline_type: &str) -> Self {
        Self {
            pipeline_type: pipeline_type.to_string(),
            version: "v0".to_string(),
            steps: vec![default_step()],
        }
    }

    /// Fill in missing versions, step ids, kinds, modes, and output types.
    /// An empty step list collapses to the default single-step pipeline.
    pub fn normalized(&self) -> Self {
        let mut def = self.clone();
        if def.version.is_empty() {
            def.version = "v0".to_string();
        }
        if def.steps.is_empty() {
            def.steps = vec![default_step()];
            return def;
        }
        for (i, step) in def.steps.iter_mut().enumerate() {
            if step.id.is_empty() {
                step.id = format!("step-{}", i + 1);
            }
        }
        def
    }
}

fn default_step() -> StepDef {
    StepDef {
        id: "step-1".to_string(),
        name: "default".to_string(),
        kind: StepKind::Llm,
        mode: StepMode::Single,
        output_type: ContentType::Text,
        export: true,
        ..StepDef::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Log,
    Code,
    Note,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub kind: SourceKind,
    pub label: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<JobOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub id: String,
    pub label: String,
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_key: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_primary: bool,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub content_type: ContentType,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default)]
    pub items: Vec<ResultItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepChunk {
    pub step_id: String,
    pub index: usize,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub status: StepExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<StepChunk>,
}

impl StepExecution {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            chunks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Sync,
    #[default]
    Async,
    Rerun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub pipeline_type: String,
    pub pipeline_version: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub input: JobInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_executions: Vec<StepExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
    #[serde(default)]
    pub mode: JobMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerun_from_step: Option<String>,
    #[serde(default)]
    pub reuse_upstream: bool,
}

impl Job {
    /// Append exported items to the job result, creating it on first use.
    pub fn append_result_items(&mut self, items: &[ResultItem]) {
        if items.is_empty() {
            return;
        }
        self.result
            .get_or_insert_with(JobResult::default)
            .items
            .extend_from_slice(items);
    }
}

/// The minimal payload required to start a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub pipeline_type: String,
    #[serde(default)]
    pub input: JobInput,
    #[serde(default)]
    pub mode: JobMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_step_id: Option<String>,
    #[serde(default)]
    pub reuse_upstream: bool,
}

/// One line of an NDJSON job stream. `seq` is stamped by the gateway's
/// event log, never by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seq: u64,
    pub event: String,
    pub job_id: String,
    pub data: Value,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl StreamEvent {
    pub fn new(event: &str, job_id: &str, data: Value) -> Self {
        Self {
            seq: 0,
            event: event.to_string(),
            job_id: job_id.to_string(),
            data,
        }
    }
}

/// 128-bit random identifier in hex, used for jobs and result items.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
