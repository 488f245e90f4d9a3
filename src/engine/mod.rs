//! # Workflow engine
//!
//! Interprets [`StepProgram`]s against [`WorkflowObject`]s.
//!
//! ## Core Principles
//!
//! 1. **Cursor-driven execution**: the only execution state is `callback_pos`
//! 2. **Persist after every task**: a crash loses at most the task in flight
//! 3. **Suspension is a value**: halts return [`RunOutcome::Suspended`], callers decide what next
//! 4. **No engine-level retry**: retries and timeouts are task decorators

pub mod decorators;
pub mod errors;
mod exec_loop;
pub mod program;
pub mod task;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::external::{
    InMemoryRecordIndex, LegacyUploader, RecordIndex, RecordValidator, RecordingTicketing,
    RecordingUploader, RequiredFieldsValidator, Ticketing, WorkflowIndex,
};
use crate::matching::DuplicateMatcher;
use crate::store::{InMemoryWorkflowStore, WorkflowStore};
use crate::types::{CreateObjectParams, HaltAction, HaltInfo, ObjectStatus, WorkflowObject};

pub use decorators::{RetryPolicy, TaskExt};
pub use errors::{EngineError, TaskError};
pub use program::{if_else, seq, task, when, Step, StepProgram};
pub use task::{fn_task, HaltRequest, Outcome, Predicate, Task, TaskContext};

/* ===================== Results ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeFrom {
    /// Continue after the task that halted (the callback resolved its question).
    Next,
    /// Re-execute the task that halted (it re-checks its own condition).
    Current,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suspension {
    pub status: ObjectStatus,
    pub action: HaltAction,
    pub message: String,
    pub callback_pos: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// A task asked to stop processing. The object is COMPLETED.
    Stopped,
    Suspended(Suspension),
}

impl RunOutcome {
    pub fn is_suspended(&self) -> bool {
        matches!(self, RunOutcome::Suspended(_))
    }
}

/* ===================== Environment ===================== */

/// Everything a task may reach outside the object it runs on.
#[derive(Clone)]
pub struct Environment {
    pub config: Arc<Config>,
    pub store: Arc<dyn WorkflowStore>,
    pub workflow_index: Arc<dyn WorkflowIndex>,
    pub records: Arc<dyn RecordIndex>,
    pub ticketing: Arc<dyn Ticketing>,
    pub uploader: Arc<dyn LegacyUploader>,
    pub validator: Arc<dyn RecordValidator>,
}

/// In-memory collaborators, kept concrete so tests can inspect them.
#[derive(Clone, Default)]
pub struct InMemoryCollaborators {
    pub store: Arc<InMemoryWorkflowStore>,
    pub records: Arc<InMemoryRecordIndex>,
    pub ticketing: Arc<RecordingTicketing>,
    pub uploader: Arc<RecordingUploader>,
}

impl InMemoryCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn environment(&self, config: Config) -> Environment {
        let validator = RequiredFieldsValidator::new(config.workflow.required_fields.clone());
        Environment {
            config: Arc::new(config),
            store: self.store.clone(),
            workflow_index: self.store.clone(),
            records: self.records.clone(),
            ticketing: self.ticketing.clone(),
            uploader: self.uploader.clone(),
            validator: Arc::new(validator),
        }
    }
}

impl Environment {
    pub fn in_memory(config: Config) -> Self {
        InMemoryCollaborators::new().environment(config)
    }
}

/* ===================== Engine ===================== */

pub struct Engine {
    env: Environment,
    programs: HashMap<String, Arc<StepProgram>>,
}

impl Engine {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            programs: HashMap::new(),
        }
    }

    pub fn register(&mut self, program: StepProgram) {
        self.programs
            .insert(program.name().to_string(), Arc::new(program));
    }

    pub fn program(&self, name: &str) -> Result<Arc<StepProgram>, EngineError> {
        self.programs
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorkflow(name.to_string()))
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn config(&self) -> &Config {
        &self.env.config
    }

    pub fn store(&self) -> &dyn WorkflowStore {
        self.env.store.as_ref()
    }

    pub fn matcher(&self) -> DuplicateMatcher {
        DuplicateMatcher::new(
            self.env.records.clone(),
            self.env.workflow_index.clone(),
            self.env.config.matching.clone(),
        )
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.matcher(), self.env.store.clone())
    }

    /// Persist a new object in INITIAL without running it.
    pub async fn create_object(&self, params: CreateObjectParams) -> Result<WorkflowObject, EngineError> {
        self.program(&params.workflow_name)?;
        let obj = WorkflowObject::new(params);
        self.store().create(&obj).await?;
        info!(workflow_id = %obj.id, workflow = %obj.workflow_name, "workflow_created");
        Ok(obj)
    }

    /// Create an object and run it.
    pub async fn start(
        &self,
        params: CreateObjectParams,
    ) -> Result<(WorkflowObject, RunOutcome), EngineError> {
        let mut obj = self.create_object(params).await?;
        let outcome = self.run(&mut obj).await?;
        Ok((obj, outcome))
    }

    pub async fn load(&self, id: uuid::Uuid) -> Result<WorkflowObject, EngineError> {
        self.store()
            .get(id)
            .await?
            .ok_or_else(|| EngineError::Store(crate::store::StoreError::NotFound(id)))
    }

    /// Execute from the saved cursor, or from the root for a fresh object.
    pub async fn run(&self, obj: &mut WorkflowObject) -> Result<RunOutcome, EngineError> {
        if obj.status == ObjectStatus::Completed {
            return Err(EngineError::AlreadyCompleted(obj.id));
        }
        let program = self.program(&obj.workflow_name)?;
        exec_loop::drive(self, &program, obj, ResumeFrom::Current).await
    }

    /// Continue a suspended object from its saved cursor.
    ///
    /// RUNNING is accepted so callers can claim the object first.
    pub async fn resume(
        &self,
        obj: &mut WorkflowObject,
        from: ResumeFrom,
    ) -> Result<RunOutcome, EngineError> {
        match obj.status {
            ObjectStatus::Halted | ObjectStatus::Waiting | ObjectStatus::Running => {}
            ObjectStatus::Completed => return Err(EngineError::AlreadyCompleted(obj.id)),
            status => {
                return Err(EngineError::NotSuspended {
                    id: obj.id,
                    status: status.to_string(),
                })
            }
        }
        let program = self.program(&obj.workflow_name)?;
        info!(workflow_id = %obj.id, from = ?from, "workflow_resumed");
        exec_loop::drive(self, &program, obj, from).await
    }

    /// Start over from the root. `done` marks survive, so `do_not_repeat` tasks stay done.
    pub async fn restart(&self, obj: &mut WorkflowObject) -> Result<RunOutcome, EngineError> {
        let program = self.program(&obj.workflow_name)?;
        obj.extra_data.restart_count += 1;
        obj.callback_pos.clear();
        obj.extra_data.halt = None;
        obj.extra_data.error_msg = None;
        info!(
            workflow_id = %obj.id,
            restart_count = obj.extra_data.restart_count,
            "workflow_restarted"
        );
        exec_loop::drive(self, &program, obj, ResumeFrom::Current).await
    }

    /// Run an ad-hoc program on the object from its root, replacing its cursor.
    pub async fn run_program(
        &self,
        obj: &mut WorkflowObject,
        program: &StepProgram,
    ) -> Result<RunOutcome, EngineError> {
        obj.callback_pos.clear();
        info!(workflow_id = %obj.id, program = program.name(), "workflow_transplanted");
        exec_loop::drive(self, program, obj, ResumeFrom::Current).await
    }

    /// Suspend an object from outside, keeping its cursor.
    pub async fn halt(
        &self,
        obj: &mut WorkflowObject,
        request: HaltRequest,
    ) -> Result<(), EngineError> {
        if obj.status == ObjectStatus::Completed {
            return Err(EngineError::AlreadyCompleted(obj.id));
        }
        obj.status = request.status;
        obj.extra_data.halt = Some(HaltInfo {
            action: request.action,
            message: request.message,
        });
        self.store().save(obj).await?;
        info!(
            workflow_id = %obj.id,
            status = %obj.status,
            action = %request.action,
            "workflow_halted_externally"
        );
        Ok(())
    }
}
