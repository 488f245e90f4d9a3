//! Intake, curator halts and ticketing steps

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::engine::{Outcome, Task, TaskContext, TaskError};
use crate::types::{HaltAction, Mark, WorkflowObject};

fn title(obj: &WorkflowObject) -> String {
    obj.data
        .pointer("/titles/0/title")
        .and_then(JsonValue::as_str)
        .unwrap_or("")
        .to_string()
}

fn ticket_context(obj: &WorkflowObject) -> JsonValue {
    json!({
        "workflow_id": obj.id,
        "title": title(obj),
        "control_number": obj.control_number(),
        "id_user": obj.id_user,
        "reason": obj.extra_data.reason,
    })
}

/* ===================== Intake ===================== */

/// Copy the acquisition source into bookkeeping. Objects without one are refused.
pub struct SetAcquisitionSource;

#[async_trait]
impl Task for SetAcquisitionSource {
    fn name(&self) -> &str {
        "set_acquisition_source"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let obj = &mut *ctx.obj;
        let acquisition = obj.data.get("acquisition_source").cloned().unwrap_or(JsonValue::Null);
        let source = acquisition
            .get("source")
            .and_then(JsonValue::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                TaskError::contract(format!(
                    "workflow object {} has no acquisition_source.source",
                    obj.id
                ))
            })?;
        obj.extra_data.source = Some(source.to_string());

        if acquisition.get("method").and_then(JsonValue::as_str) == Some("submitter") {
            obj.extra_data.mark(Mark::IsSubmission, true);
        }
        Ok(Outcome::Continue)
    }
}

pub struct ValidateRecord;

#[async_trait]
impl Task for ValidateRecord {
    fn name(&self) -> &str {
        "validate_record"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let errors = ctx.engine.env().validator.validate(&ctx.obj.data);
        if errors.is_empty() {
            ctx.obj.extra_data.validation_errors.clear();
            return Ok(Outcome::Continue);
        }
        let message = format!("Record has {} validation error(s)", errors.len());
        ctx.obj.extra_data.validation_errors = errors;
        Ok(Outcome::halt(HaltAction::ResolveValidationErrors, message))
    }
}

/* ===================== Curator halts ===================== */

/// Halts with a fixed action. The matching callback answers it.
pub struct HaltFor {
    name: &'static str,
    action: HaltAction,
    message: &'static str,
}

impl HaltFor {
    pub fn hep_approval() -> Self {
        Self {
            name: "halt_for_hep_approval",
            action: HaltAction::HepApproval,
            message: "Accept or reject this record for the catalog",
        }
    }

    pub fn core_approval() -> Self {
        Self {
            name: "halt_for_core_approval",
            action: HaltAction::CoreApproval,
            message: "The update adds a core category to a non-core record",
        }
    }

    pub fn core_selection() -> Self {
        Self {
            name: "halt_for_core_selection",
            action: HaltAction::CoreSelectionApproval,
            message: "Auto-approved, decide whether the record is core",
        }
    }

    pub fn merge_approval() -> Self {
        Self {
            name: "halt_for_merge_approval",
            action: HaltAction::MergeApproval,
            message: "Resolve the merge conflicts",
        }
    }
}

#[async_trait]
impl Task for HaltFor {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, _ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        Ok(Outcome::halt(self.action, self.message))
    }
}

pub struct AutoApprove;

#[async_trait]
impl Task for AutoApprove {
    fn name(&self) -> &str {
        "auto_approve"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let extra = &mut ctx.obj.extra_data;
        extra.mark(Mark::Approved, true);
        extra.mark(Mark::AutoApproved, true);
        info!(workflow_id = %ctx.obj.id, "auto_approved");
        Ok(Outcome::Continue)
    }
}

/* ===================== Ticketing ===================== */

pub struct CreateSubmissionTicket;

#[async_trait]
impl Task for CreateSubmissionTicket {
    fn name(&self) -> &str {
        "create_submission_ticket"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let queue = &ctx.engine.config().ticketing.submission_queue;
        let ticket_id = ctx
            .engine
            .env()
            .ticketing
            .create_ticket(queue, "submission_new", &ticket_context(ctx.obj))
            .await?;
        info!(workflow_id = %ctx.obj.id, ticket_id = %ticket_id, "submission_ticket_created");
        ctx.obj.extra_data.ticket_id = Some(ticket_id);
        Ok(Outcome::Continue)
    }
}

pub struct CreateCurationTicket;

#[async_trait]
impl Task for CreateCurationTicket {
    fn name(&self) -> &str {
        "create_curation_ticket"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let queue = &ctx.engine.config().ticketing.curation_queue;
        let ticket_id = ctx
            .engine
            .env()
            .ticketing
            .create_ticket(queue, "curation_core", &ticket_context(ctx.obj))
            .await?;
        info!(workflow_id = %ctx.obj.id, ticket_id = %ticket_id, "curation_ticket_created");
        ctx.obj.extra_data.curation_ticket_id = Some(ticket_id);
        Ok(Outcome::Continue)
    }
}

/// Tell the submitter about the decision on their submission ticket.
pub struct ReplyToSubmitter;

#[async_trait]
impl Task for ReplyToSubmitter {
    fn name(&self) -> &str {
        "reply_to_submitter"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let Some(ticket_id) = ctx.obj.extra_data.ticket_id.clone() else {
            return Ok(Outcome::Continue);
        };
        let template = if ctx.obj.extra_data.is_marked(Mark::Approved) {
            "submission_accepted"
        } else {
            "submission_rejected"
        };
        ctx.engine
            .env()
            .ticketing
            .reply_ticket(&ticket_id, template, &ticket_context(ctx.obj))
            .await?;
        Ok(Outcome::Continue)
    }
}

/// Close the object's own ticket, if it has one.
pub struct CloseTicket;

#[async_trait]
impl Task for CloseTicket {
    fn name(&self) -> &str {
        "close_ticket"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let Some(ticket_id) = ctx.obj.extra_data.ticket_id.clone() else {
            debug!(workflow_id = %ctx.obj.id, "no_ticket_to_close");
            return Ok(Outcome::Continue);
        };
        ctx.engine.env().ticketing.close_ticket(&ticket_id).await?;
        info!(workflow_id = %ctx.obj.id, ticket_id = %ticket_id, "ticket_closed");
        Ok(Outcome::Continue)
    }
}

/* ===================== Stop ===================== */

/// Record that another object superseded this one.
pub struct MarkStopped;

#[async_trait]
impl Task for MarkStopped {
    fn name(&self) -> &str {
        "mark_stopped"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let extra = &mut ctx.obj.extra_data;
        let by = extra.stopped_by_wf.ok_or_else(|| {
            TaskError::contract("stop program run without stopped-by-wf set")
        })?;
        extra.reason = Some(format!("Superseded by workflow {}", by));
        info!(workflow_id = %ctx.obj.id, stopped_by = %by, "workflow_superseded");
        Ok(Outcome::Continue)
    }
}
