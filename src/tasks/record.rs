//! Steps that read or write the catalog record

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::engine::{Outcome, Task, TaskContext, TaskError};
use crate::merge::merge_records;
use crate::tasks::predicates::in_core_categories;
use crate::types::{HaltAction, Mark};

/// Merge the object's record into the matched head.
pub struct MergeWithHead;

#[async_trait]
impl Task for MergeWithHead {
    fn name(&self) -> &str {
        "merge_with_head"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let obj = &mut *ctx.obj;
        let control_number = obj.extra_data.matches.approved.ok_or_else(|| {
            TaskError::contract("merge_with_head requires an approved match")
        })?;
        let update_source = obj.source().ok_or_else(|| {
            TaskError::contract(format!(
                "workflow object {} has no acquisition source, cannot merge",
                obj.id
            ))
        })?;

        let head = ctx
            .engine
            .env()
            .records
            .get(control_number)
            .await?
            .ok_or_else(|| {
                TaskError::contract(format!("matched record {} not found in the catalog", control_number))
            })?;
        let head_source = head
            .pointer("/acquisition_source/source")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                TaskError::contract(format!(
                    "head record {} has no acquisition source, cannot merge",
                    control_number
                ))
            })?;

        let core_categories = &ctx.engine.config().workflow.core_categories;
        let head_core = head.get("core").and_then(JsonValue::as_bool).unwrap_or(false)
            || in_core_categories(&head, core_categories);

        let result = merge_records(&head, &obj.data, head_source, &update_source);
        info!(
            workflow_id = %obj.id,
            control_number,
            conflicts = result.conflicts.len(),
            "record_merged"
        );

        obj.data = result.data;
        obj.extra_data.conflicts = result.conflicts;
        obj.extra_data.extensions.insert("head_core".to_string(), json!(head_core));
        if head_core {
            obj.extra_data.mark(Mark::Core, true);
        }
        Ok(Outcome::Continue)
    }
}

/// Updates without open questions are approved.
pub struct ApproveUpdate;

#[async_trait]
impl Task for ApproveUpdate {
    fn name(&self) -> &str {
        "approve_update"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        if ctx.obj.extra_data.flag(Mark::Approved).is_none() {
            ctx.obj.extra_data.mark(Mark::Approved, true);
        }
        Ok(Outcome::Continue)
    }
}

/// Store the record, then hand its control number to every superseded object.
pub struct StoreRecord;

#[async_trait]
impl Task for StoreRecord {
    fn name(&self) -> &str {
        "store_record"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let env = ctx.engine.env();
        let obj = &mut *ctx.obj;

        if let Some(head) = obj.extra_data.matches.approved {
            obj.data["control_number"] = json!(head);
        }
        if obj.extra_data.is_marked(Mark::Core) {
            obj.data["core"] = json!(true);
        }

        let control_number = env.records.store(&obj.data).await?;
        obj.data["control_number"] = json!(control_number);
        env.records.refresh().await?;
        info!(workflow_id = %obj.id, control_number, "record_stored");

        for id in obj.extra_data.stopped_wfs.clone() {
            match env.store.get(id).await? {
                Some(mut stopped) => {
                    stopped.data["control_number"] = json!(control_number);
                    env.store.save(&mut stopped).await?;
                }
                None => warn!(workflow_id = %obj.id, stopped_id = %id, "stopped_workflow_vanished"),
            }
        }
        Ok(Outcome::Continue)
    }
}

/// Push the record to the legacy system. Halts for the ack when a callback URL is set.
pub struct SendRobotUpload;

#[async_trait]
impl Task for SendRobotUpload {
    fn name(&self) -> &str {
        "send_robotupload"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let upload = &ctx.engine.config().upload;
        if !upload.enabled {
            return Ok(Outcome::Continue);
        }
        let mode = if ctx.obj.extra_data.is_marked(Mark::IsUpdate) {
            "replace"
        } else {
            upload.mode.as_str()
        };

        let ack = ctx
            .engine
            .env()
            .uploader
            .upload(&ctx.obj.data, mode, upload.callback_url.as_deref())
            .await?;
        if !ack.accepted {
            return Err(TaskError::failed(format!("legacy upload refused: {}", ack.message)));
        }

        match &upload.callback_url {
            Some(_) => Ok(Outcome::halt(
                HaltAction::RobotuploadCallback,
                format!("Waiting for the legacy upload acknowledgement: {}", ack.message),
            )),
            None => {
                ctx.obj.extra_data.robotupload_ack = Some(json!({
                    "success": true,
                    "message": ack.message,
                }));
                Ok(Outcome::Continue)
            }
        }
    }
}
