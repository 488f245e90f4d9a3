//! Duplicate-matching steps

use async_trait::async_trait;
use tracing::info;

use crate::engine::{Outcome, Task, TaskContext, TaskError};
use crate::matching::{DuplicateMatcher, MatchResolution};
use crate::types::{HaltAction, Mark};

/// Rejects the object outright when a curator already rejected the same
/// record from the same source. Other sources are only recorded.
pub struct CheckPreviouslyRejected;

#[async_trait]
impl Task for CheckPreviouslyRejected {
    fn name(&self) -> &str {
        "check_previously_rejected"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let rejected = ctx.engine.matcher().previously_rejected(ctx.obj).await?;
        ctx.obj.extra_data.previously_rejected_matches = rejected.iter().map(|o| o.id).collect();

        let source = ctx.obj.source();
        let same_source = rejected.iter().any(|other| match (&source, other.source()) {
            (Some(mine), Some(theirs)) => mine.eq_ignore_ascii_case(&theirs),
            _ => false,
        });
        if !same_source {
            return Ok(Outcome::Continue);
        }

        ctx.obj.extra_data.mark(Mark::PreviouslyRejected, true);
        ctx.obj.extra_data.mark(Mark::Approved, false);
        ctx.obj.extra_data.reason = Some("Previously rejected from the same source".to_string());
        info!(workflow_id = %ctx.obj.id, "previously_rejected");
        Ok(Outcome::Skip)
    }
}

pub struct ExactMatch;

#[async_trait]
impl Task for ExactMatch {
    fn name(&self) -> &str {
        "exact_match"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let exact = ctx.engine.matcher().exact_match(ctx.obj).await?;
        let matches = &mut ctx.obj.extra_data.matches;
        matches.exact = exact;
        matches.fuzzy.clear();
        matches.approved = None;
        ctx.obj.extra_data.unmark(Mark::IsUpdate);
        Ok(Outcome::Continue)
    }
}

pub struct FuzzyMatch;

#[async_trait]
impl Task for FuzzyMatch {
    fn name(&self) -> &str {
        "fuzzy_match"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let fuzzy = ctx.engine.matcher().fuzzy_match(ctx.obj).await?;
        ctx.obj.extra_data.matches.fuzzy = fuzzy;
        Ok(Outcome::Continue)
    }
}

/// A single exact match makes the object an update of that record.
pub struct ApproveExactMatch;

#[async_trait]
impl Task for ApproveExactMatch {
    fn name(&self) -> &str {
        "approve_exact_match"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let extra = &mut ctx.obj.extra_data;
        match DuplicateMatcher::resolve(&extra.matches.exact, &extra.matches.fuzzy) {
            MatchResolution::Exact(control_number) => {
                extra.matches.approved = Some(control_number);
                extra.mark(Mark::IsUpdate, true);
                Ok(Outcome::Continue)
            }
            other => Err(TaskError::contract(format!(
                "approve_exact_match needs exactly one exact match, found {:?}",
                other
            ))),
        }
    }
}

pub struct HaltForMatchApproval;

#[async_trait]
impl Task for HaltForMatchApproval {
    fn name(&self) -> &str {
        "halt_for_match_approval"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let matches = &ctx.obj.extra_data.matches;
        let message = match DuplicateMatcher::resolve(&matches.exact, &matches.fuzzy) {
            MatchResolution::Ambiguous(ids) => {
                format!("{} records share an identifier with this one, pick the right one", ids.len())
            }
            MatchResolution::Fuzzy(candidates) => {
                format!("{} similar records found, confirm or dismiss the match", candidates.len())
            }
            _ => "Confirm the match".to_string(),
        };
        Ok(Outcome::halt(HaltAction::MatchApproval, message))
    }
}
