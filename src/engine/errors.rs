use thiserror::Error;
use uuid::Uuid;

use crate::external::ExternalError;
use crate::store::StoreError;

/// Failure raised by a single task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Retryable failure of an external collaborator.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// A precondition the pipeline relies on does not hold. Never defaulted away.
    #[error("contract violated: {0}")]
    Contract(String),

    #[error("{0}")]
    Failed(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl TaskError {
    pub fn contract(message: impl Into<String>) -> Self {
        TaskError::Contract(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Transient(_) | TaskError::Timeout(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Transient(_) => "transient",
            TaskError::Timeout(_) => "timeout",
            TaskError::Contract(_) => "contract",
            TaskError::Failed(_) => "failed",
            TaskError::Store(_) => "store",
        }
    }
}

impl From<ExternalError> for TaskError {
    fn from(err: ExternalError) -> Self {
        if err.is_transient() {
            TaskError::Transient(err.to_string())
        } else {
            TaskError::Failed(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no program registered for workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("cursor {path:?} does not address a step of workflow '{workflow}'")]
    InvalidCursor { workflow: String, path: Vec<usize> },

    #[error("workflow object {workflow_id} failed in task '{task}': {source}")]
    Task {
        workflow_id: Uuid,
        task: String,
        #[source]
        source: TaskError,
    },

    #[error("workflow object {0} is already completed")]
    AlreadyCompleted(Uuid),

    #[error("workflow object {id} is {status}, expected a suspended object")]
    NotSuspended { id: Uuid, status: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
