//! Holding-pen coordination steps

use async_trait::async_trait;

use crate::engine::{HaltRequest, Outcome, Task, TaskContext, TaskError};
use crate::types::HaltAction;

pub struct SetHoldingpenMatches;

#[async_trait]
impl Task for SetHoldingpenMatches {
    fn name(&self) -> &str {
        "set_holdingpen_matches"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        ctx.engine
            .coordinator()
            .set_wf_not_completed_ids_to_wf(ctx.obj, false)
            .await?;
        Ok(Outcome::Continue)
    }
}

pub struct HandleMatchedHoldingpenWfs;

#[async_trait]
impl Task for HandleMatchedHoldingpenWfs {
    fn name(&self) -> &str {
        "handle_matched_holdingpen_wfs"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let engine = ctx.engine;
        engine
            .coordinator()
            .handle_matched_holdingpen_wfs(engine, ctx.obj)
            .await?;
        Ok(Outcome::Continue)
    }
}

/// WAITING while any live object still blocks this one.
pub struct WaitForBlockers;

#[async_trait]
impl Task for WaitForBlockers {
    fn name(&self) -> &str {
        "wait_for_blockers"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let remaining = ctx.engine.coordinator().prune_blockers(ctx.obj).await?;
        if remaining.is_empty() {
            return Ok(Outcome::Continue);
        }
        let ids: Vec<String> = remaining.iter().map(|id| id.to_string()).collect();
        Ok(Outcome::Halt(HaltRequest::wait(
            HaltAction::BlockedByHoldingpen,
            format!("Waiting for holding pen workflows: {}", ids.join(", ")),
        )))
    }
}

/// Release and resume objects that were waiting on this one.
pub struct RunNextIfNecessary;

#[async_trait]
impl Task for RunNextIfNecessary {
    fn name(&self) -> &str {
        "run_next_if_necessary"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let engine = ctx.engine;
        engine
            .coordinator()
            .run_next_if_necessary(engine, ctx.obj)
            .await?;
        Ok(Outcome::Continue)
    }
}
