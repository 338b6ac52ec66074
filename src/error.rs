use thiserror::Error;

/// Structured error hierarchy for the engine.
///
/// Every variant maps to a stable wire code via [`EngineError::code`]; the
/// gateway turns those codes into HTTP statuses and the
/// `{"error":{code,message}}` envelope. Internal plumbing keeps using
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── Validation ───────────────────────────────────────────────────────
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("provider_profile_id is required for step {step_id}")]
    MissingProfileId { step_id: String },

    #[error("step {0} not found in pipeline")]
    UnknownStep(String),

    // ── Not found ────────────────────────────────────────────────────────
    #[error("job {0} not found")]
    NotFound(String),

    #[error("provider profile {0} not found")]
    ProfileNotFound(String),

    #[error("provider kind {0} not registered")]
    KindNotRegistered(String),

    // ── Conflict ─────────────────────────────────────────────────────────
    #[error("job {0} already exists")]
    AlreadyExists(String),

    // ── Execution ────────────────────────────────────────────────────────
    #[error("dependency {dependency} not satisfied for step {step_id}")]
    MissingDependency { step_id: String, dependency: String },

    #[error("step failed: {0}")]
    StepFailed(String),

    #[error("{provider} api error: {status}")]
    ProviderHttp { provider: String, status: String },

    #[error("{0} returned an empty response")]
    ProviderEmptyResponse(String),

    // ── Control ──────────────────────────────────────────────────────────
    #[error("cancelled")]
    Cancelled,

    // ── Transport / config ───────────────────────────────────────────────
    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable wire code for this error, per the error taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::MissingProfileId { .. } => "missing_profile_id",
            Self::UnknownStep(_) => "unknown_step",
            Self::NotFound(_) => "not_found",
            Self::ProfileNotFound(_) => "profile_not_found",
            Self::KindNotRegistered(_) => "kind_not_registered",
            Self::AlreadyExists(_) => "already_exists",
            Self::MissingDependency { .. } => "missing_dependency",
            Self::StepFailed(_) => "step_failed",
            Self::ProviderHttp { .. } => "provider_http_error",
            Self::ProviderEmptyResponse(_) => "provider_empty_response",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
