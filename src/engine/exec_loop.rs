//! Core execution loop
//!
//! `drive()` walks a program from the object's cursor until the object
//! completes, suspends or fails. The cursor is the only execution state, so
//! any run can stop after any task and later continue from `callback_pos`.
//!
//! The loop is iterative. Entering a container pushes onto the cursor,
//! exhausting a block truncates it back to the container and advances.

use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, error, info};

use super::errors::EngineError;
use super::program::{StepProgram, Step, ELSE_BRANCH, THEN_BRANCH};
use super::task::{Outcome, TaskContext};
use super::{Engine, ResumeFrom, RunOutcome, Suspension};
use crate::types::{HaltInfo, ObjectStatus, TaskHistoryEntry, WorkflowObject};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/* ===================== Driver ===================== */

/// Run `program` against `obj` starting at its saved cursor.
///
/// Boxed because tasks may call back into the engine for other objects.
pub(crate) fn drive<'a>(
    engine: &'a Engine,
    program: &'a StepProgram,
    obj: &'a mut WorkflowObject,
    from: ResumeFrom,
) -> BoxFuture<'a, Result<RunOutcome, EngineError>> {
    Box::pin(async move {
        let mut cursor = initial_cursor(&obj.callback_pos, from);

        obj.status = ObjectStatus::Running;
        obj.extra_data.halt = None;
        obj.extra_data.error_msg = None;
        obj.callback_pos = cursor.clone();
        engine.store().save(obj).await?;

        info!(
            workflow_id = %obj.id,
            workflow = program.name(),
            cursor = ?cursor,
            "workflow_running"
        );

        loop {
            let invalid = || EngineError::InvalidCursor {
                workflow: program.name().to_string(),
                path: cursor.clone(),
            };
            let block = program.block_at(&cursor).ok_or_else(invalid)?;
            let idx = *cursor.last().ok_or_else(invalid)?;

            let Some(step) = block.steps.get(idx) else {
                if block.span == 0 {
                    return complete(engine, program, obj, RunOutcome::Completed).await;
                }
                cursor.truncate(cursor.len() - block.span);
                advance(&mut cursor);
                continue;
            };

            match step {
                Step::Sequence(_) => cursor.push(0),

                Step::Condition { predicate, .. } => {
                    let holds = predicate.eval(obj);
                    debug!(
                        workflow_id = %obj.id,
                        predicate = predicate.name(),
                        holds,
                        "condition_evaluated"
                    );
                    cursor.push(if holds { THEN_BRANCH } else { ELSE_BRANCH });
                    cursor.push(0);
                }

                Step::Task(task) => {
                    obj.callback_pos = cursor.clone();
                    debug!(workflow_id = %obj.id, task = task.name(), "task_started");

                    let result = {
                        let mut ctx = TaskContext {
                            obj: &mut *obj,
                            engine,
                        };
                        task.execute(&mut ctx).await
                    };

                    let limit = engine.config().workflow.task_history_limit;
                    match result {
                        Ok(outcome) => {
                            record_history(obj, task.name(), outcome.label(), limit);
                            debug!(
                                workflow_id = %obj.id,
                                task = task.name(),
                                outcome = outcome.label(),
                                "task_completed"
                            );

                            match outcome {
                                Outcome::Continue => advance(&mut cursor),
                                Outcome::Skip => {
                                    if let Some(last) = cursor.last_mut() {
                                        *last = block.steps.len();
                                    }
                                }
                                Outcome::Stop => {
                                    return complete(engine, program, obj, RunOutcome::Stopped).await;
                                }
                                Outcome::Halt(request) => {
                                    obj.status = request.status;
                                    obj.extra_data.halt = Some(HaltInfo {
                                        action: request.action,
                                        message: request.message.clone(),
                                    });
                                    obj.callback_pos = cursor.clone();
                                    engine.store().save(obj).await?;

                                    info!(
                                        workflow_id = %obj.id,
                                        status = %request.status,
                                        action = %request.action,
                                        cursor = ?cursor,
                                        "workflow_halted"
                                    );
                                    return Ok(RunOutcome::Suspended(Suspension {
                                        status: request.status,
                                        action: request.action,
                                        message: request.message,
                                        callback_pos: cursor,
                                    }));
                                }
                            }

                            obj.callback_pos = cursor.clone();
                            engine.store().save(obj).await?;
                        }
                        Err(err) => {
                            record_history(obj, task.name(), "error", limit);
                            obj.status = ObjectStatus::Error;
                            obj.extra_data.error_msg = Some(err.to_string());
                            engine.store().save(obj).await?;

                            error!(
                                workflow_id = %obj.id,
                                task = task.name(),
                                kind = err.kind(),
                                error = %err,
                                "workflow_failed"
                            );
                            return Err(EngineError::Task {
                                workflow_id: obj.id,
                                task: task.name().to_string(),
                                source: err,
                            });
                        }
                    }
                }
            }
        }
    })
}

/* ===================== Helpers ===================== */

fn initial_cursor(saved: &[usize], from: ResumeFrom) -> Vec<usize> {
    if saved.is_empty() {
        return vec![0];
    }
    let mut cursor = saved.to_vec();
    if from == ResumeFrom::Next {
        advance(&mut cursor);
    }
    cursor
}

fn advance(cursor: &mut [usize]) {
    if let Some(last) = cursor.last_mut() {
        *last += 1;
    }
}

async fn complete(
    engine: &Engine,
    program: &StepProgram,
    obj: &mut WorkflowObject,
    outcome: RunOutcome,
) -> Result<RunOutcome, EngineError> {
    obj.status = ObjectStatus::Completed;
    obj.callback_pos.clear();
    obj.extra_data.halt = None;
    engine.store().save(obj).await?;

    match outcome {
        RunOutcome::Stopped => info!(
            workflow_id = %obj.id,
            workflow = program.name(),
            "workflow_stopped"
        ),
        _ => info!(
            workflow_id = %obj.id,
            workflow = program.name(),
            "workflow_completed"
        ),
    }
    Ok(outcome)
}

fn record_history(obj: &mut WorkflowObject, task: &str, outcome: &str, limit: usize) {
    if limit == 0 {
        return;
    }
    let history = &mut obj.extra_data.task_history;
    history.push(TaskHistoryEntry {
        task: task.to_string(),
        outcome: outcome.to_string(),
        at: Utc::now(),
    });
    if history.len() > limit {
        let excess = history.len() - limit;
        history.drain(..excess);
    }
}
