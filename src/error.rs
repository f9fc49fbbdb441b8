use crate::gateway::GatewayError;
use crate::schema::ValidationError;
use crate::stage::StageId;
use crate::types::EntityId;
use thiserror::Error;

/// Errors produced by the orchestrator outside of a single stage execution.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid stage configuration detected at load or build time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The submitted [`PipelineRequest`](crate::PipelineRequest) is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No run with the given id is known to the scheduler.
    #[error("Unknown run: {0}")]
    UnknownRun(String),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing failed at the serde level.
    #[cfg(feature = "yaml")]
    #[error("YAML parsing failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Reading a configuration file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The coordinating task panicked or was aborted.
    #[error("Run task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// How a stage execution ended when it did not produce an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// A non-retryable transport error; no further attempts were made.
    Fatal,
    /// The attempt budget ran out on retryable or validation failures.
    Exhausted,
    /// Cancellation was observed before the stage could finish.
    Cancelled,
}

impl std::fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StageErrorKind::Fatal => "fatal",
            StageErrorKind::Exhausted => "exhausted",
            StageErrorKind::Cancelled => "cancelled",
        })
    }
}

/// The last underlying failure behind a [`StageError`].
#[derive(Error, Debug, Clone)]
pub enum StageCause {
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),

    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    #[error("run cancelled")]
    Cancelled,

    /// The run state refused the artifact.
    #[error("store: {0}")]
    Store(String),
}

/// Terminal failure of one stage for one (optional) entity.
#[derive(Error, Debug, Clone)]
#[error("stage {stage}{} {kind} after {attempts} attempt(s): {cause}", entity_suffix(.entity))]
pub struct StageError {
    pub stage: StageId,
    pub entity: Option<EntityId>,
    pub kind: StageErrorKind,
    pub cause: StageCause,
    /// Gateway calls made, including the failing one.
    pub attempts: u32,
}

impl StageError {
    pub fn new(
        stage: StageId,
        entity: Option<EntityId>,
        kind: StageErrorKind,
        cause: impl Into<StageCause>,
        attempts: u32,
    ) -> Self {
        Self {
            stage,
            entity,
            kind,
            cause: cause.into(),
            attempts,
        }
    }

    pub fn cancelled(stage: StageId, entity: Option<EntityId>, attempts: u32) -> Self {
        Self::new(stage, entity, StageErrorKind::Cancelled, StageCause::Cancelled, attempts)
    }
}

fn entity_suffix(entity: &Option<EntityId>) -> String {
    match entity {
        Some(id) => format!(" [{}]", id),
        None => String::new(),
    }
}
