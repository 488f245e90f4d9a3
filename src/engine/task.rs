//! Tasks, predicates and the outcomes a task can report

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use super::errors::TaskError;
use super::Engine;
use crate::types::{HaltAction, ObjectStatus, WorkflowObject};

/* ===================== Outcomes ===================== */

/// What the engine should do after a task returns successfully.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Continue,
    /// Suspend the object at this task until a callback or release resumes it.
    Halt(HaltRequest),
    /// Leave the enclosing block and carry on with the next sibling of its parent.
    Skip,
    /// Stop processing the object; it completes without running the rest.
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HaltRequest {
    pub status: ObjectStatus,
    pub action: HaltAction,
    pub message: String,
}

impl HaltRequest {
    /// Waiting on a curator.
    pub fn halt(action: HaltAction, message: impl Into<String>) -> Self {
        Self {
            status: ObjectStatus::Halted,
            action,
            message: message.into(),
        }
    }

    /// Waiting on another workflow object.
    pub fn wait(action: HaltAction, message: impl Into<String>) -> Self {
        Self {
            status: ObjectStatus::Waiting,
            action,
            message: message.into(),
        }
    }
}

impl Outcome {
    pub fn halt(action: HaltAction, message: impl Into<String>) -> Self {
        Outcome::Halt(HaltRequest::halt(action, message))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Continue => "continue",
            Outcome::Halt(_) => "halt",
            Outcome::Skip => "skip",
            Outcome::Stop => "stop",
        }
    }
}

/* ===================== Task ===================== */

pub struct TaskContext<'a> {
    pub obj: &'a mut WorkflowObject,
    pub engine: &'a Engine,
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError>;
}

type TaskFn = dyn Fn(&mut WorkflowObject) -> Result<Outcome, TaskError> + Send + Sync;

/// A synchronous closure over the object, for tasks that only touch `data`/`extra_data`.
pub struct FnTask {
    name: String,
    f: Arc<TaskFn>,
}

#[async_trait]
impl Task for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        (self.f)(ctx.obj)
    }
}

pub fn fn_task<F>(name: impl Into<String>, f: F) -> FnTask
where
    F: Fn(&mut WorkflowObject) -> Result<Outcome, TaskError> + Send + Sync + 'static,
{
    FnTask {
        name: name.into(),
        f: Arc::new(f),
    }
}

/* ===================== Predicates ===================== */

type PredicateFn = dyn Fn(&WorkflowObject) -> bool + Send + Sync;

/// Named branch condition. Named so logs and `Debug` output stay readable.
#[derive(Clone)]
pub struct Predicate {
    name: String,
    f: Arc<PredicateFn>,
}

impl Predicate {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&WorkflowObject) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn eval(&self, obj: &WorkflowObject) -> bool {
        (self.f)(obj)
    }

    pub fn not(self) -> Self {
        let name = format!("not({})", self.name);
        let inner = self.f;
        Self {
            name,
            f: Arc::new(move |obj| !inner(obj)),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({})", self.name)
    }
}
