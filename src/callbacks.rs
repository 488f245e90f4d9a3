//! Inbound callbacks that answer a halted workflow object
//!
//! Every callback names the halt action it answers. The object must be
//! HALTED or WAITING on exactly that action, otherwise the callback is
//! rejected with [`CallbackError::WorkflowNotInExpectedState`] and nothing
//! changes. Accepted callbacks claim the object, apply their payload and
//! resume the engine from the saved cursor.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{Engine, EngineError, ResumeFrom, RunOutcome};
use crate::store::{StoreError, WorkflowStore};
use crate::types::{Conflict, ExtraData, HaltAction, Mark, ObjectStatus, WorkflowObject};
use crate::workflows::stop_program;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("workflow object {0} not found")]
    NotFound(Uuid),

    #[error("workflow object {id} is {status} ({current}), expected a halt on {expected}")]
    WorkflowNotInExpectedState {
        id: Uuid,
        expected: String,
        status: ObjectStatus,
        current: String,
    },

    #[error("invalid callback payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/* ===================== Payloads ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    AcceptCore,
    Reject,
}

impl std::str::FromStr for Decision {
    type Err = CallbackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(Decision::Accept),
            "accept_core" => Ok(Decision::AcceptCore),
            "reject" => Ok(Decision::Reject),
            other => Err(CallbackError::InvalidPayload(format!(
                "unknown decision '{}', expected accept, accept_core or reject",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPayload {
    pub value: Decision,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchPayload {
    /// The chosen control number, or none when no candidate is the same record.
    #[serde(rename = "match")]
    pub control_number: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResolution {
    pub data: JsonValue,
    /// Revised bookkeeping. Each top-level key replaces the stored one.
    #[serde(default)]
    pub extra_data: Option<Map<String, JsonValue>>,
    /// Conflicts the curator chose to keep open. Usually empty.
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceConflictDecision {
    Proceed,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotuploadAck {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub workflow_id: Uuid,
    pub status: ObjectStatus,
    pub message: String,
}

impl CallbackResponse {
    fn from_outcome(obj: &WorkflowObject, outcome: &RunOutcome) -> Self {
        let message = match outcome {
            RunOutcome::Completed => "Workflow completed".to_string(),
            RunOutcome::Stopped => "Workflow stopped".to_string(),
            RunOutcome::Suspended(s) => format!("{}: {}", s.action, s.message),
        };
        Self {
            workflow_id: obj.id,
            status: obj.status,
            message,
        }
    }
}

/* ===================== Handler ===================== */

pub struct CallbackHandler {
    engine: Arc<Engine>,
}

impl CallbackHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Load the object and check it waits on one of `expected`.
    async fn load_expecting(
        &self,
        id: Uuid,
        expected: &[HaltAction],
    ) -> Result<WorkflowObject, CallbackError> {
        let obj = self
            .engine
            .store()
            .get(id)
            .await?
            .ok_or(CallbackError::NotFound(id))?;

        let current = obj.current_halt();
        let in_state = obj.status.is_suspended()
            && current.map(|action| expected.contains(&action)).unwrap_or(false);
        if !in_state {
            return Err(not_in_expected_state(&obj, expected));
        }
        Ok(obj)
    }

    /// Take ownership of the object before mutating it. Loses to concurrent callbacks.
    async fn claim(&self, obj: &mut WorkflowObject, expected: &[HaltAction]) -> Result<(), CallbackError> {
        let claimed = self
            .engine
            .store()
            .claim(obj.id, &[ObjectStatus::Halted, ObjectStatus::Waiting])
            .await?;
        if !claimed {
            let latest = self.engine.load(obj.id).await?;
            return Err(not_in_expected_state(&latest, expected));
        }
        obj.status = ObjectStatus::Running;
        Ok(())
    }

    async fn resume(
        &self,
        mut obj: WorkflowObject,
        from: ResumeFrom,
    ) -> Result<CallbackResponse, CallbackError> {
        let outcome = self.engine.resume(&mut obj, from).await?;
        Ok(CallbackResponse::from_outcome(&obj, &outcome))
    }

    /// Answer `hep_approval`, `core_approval` or `core_selection_approval`.
    pub async fn resolve_approval(
        &self,
        id: Uuid,
        action: HaltAction,
        payload: ApprovalPayload,
    ) -> Result<CallbackResponse, CallbackError> {
        if !matches!(
            action,
            HaltAction::HepApproval | HaltAction::CoreApproval | HaltAction::CoreSelectionApproval
        ) {
            return Err(CallbackError::InvalidPayload(format!(
                "{} is not an approval action",
                action
            )));
        }
        let mut obj = self.load_expecting(id, &[action]).await?;
        self.claim(&mut obj, &[action]).await?;

        let extra = &mut obj.extra_data;
        match payload.value {
            Decision::Accept => {
                extra.mark(Mark::Approved, true);
                extra.mark(Mark::Core, false);
            }
            Decision::AcceptCore => {
                extra.mark(Mark::Approved, true);
                extra.mark(Mark::Core, true);
            }
            Decision::Reject => {
                extra.mark(Mark::Approved, false);
            }
        }
        if payload.reason.is_some() {
            extra.reason = payload.reason;
        }
        info!(workflow_id = %id, action = %action, decision = ?payload.value, "approval_resolved");

        self.resume(obj, ResumeFrom::Next).await
    }

    /// Answer `match_approval` with the chosen record, or none.
    pub async fn resolve_match(
        &self,
        id: Uuid,
        payload: MatchPayload,
    ) -> Result<CallbackResponse, CallbackError> {
        let expected = [HaltAction::MatchApproval];
        let mut obj = self.load_expecting(id, &expected).await?;

        if let Some(cn) = payload.control_number {
            let matches = &obj.extra_data.matches;
            let offered = matches.exact.contains(&cn)
                || matches.fuzzy.iter().any(|c| c.control_number == cn);
            if !offered {
                return Err(CallbackError::InvalidPayload(format!(
                    "record {} was not among the match candidates",
                    cn
                )));
            }
        }
        self.claim(&mut obj, &expected).await?;

        let extra = &mut obj.extra_data;
        extra.matches.approved = payload.control_number;
        match payload.control_number {
            Some(_) => extra.mark(Mark::IsUpdate, true),
            None => extra.unmark(Mark::IsUpdate),
        }
        info!(workflow_id = %id, chosen = ?payload.control_number, "match_resolved");

        self.resume(obj, ResumeFrom::Next).await
    }

    /// Answer `merge_approval` with the curated record.
    pub async fn resolve_merge_conflicts(
        &self,
        id: Uuid,
        resolution: MergeResolution,
    ) -> Result<CallbackResponse, CallbackError> {
        if !resolution.data.is_object() {
            return Err(CallbackError::InvalidPayload("data must be a JSON object".to_string()));
        }
        let expected = [HaltAction::MergeApproval];
        let mut obj = self.load_expecting(id, &expected).await?;
        let revised = resolution
            .extra_data
            .map(|patch| patch_extra_data(&obj.extra_data, patch))
            .transpose()?;
        self.claim(&mut obj, &expected).await?;

        if let Some(extra_data) = revised {
            obj.extra_data = extra_data;
        }
        if let Some(head) = obj.extra_data.matches.approved {
            let mut data = resolution.data;
            data["control_number"] = json!(head);
            obj.data = data;
        } else {
            obj.data = resolution.data;
        }
        obj.extra_data.conflicts = resolution.conflicts;
        obj.extra_data.mark(Mark::Approved, true);
        obj.extra_data.mark(Mark::Merged, true);
        info!(workflow_id = %id, "merge_conflicts_resolved");

        self.resume(obj, ResumeFrom::Next).await
    }

    /// Answer `resolve_validation_errors` with corrected data. Validation runs again.
    pub async fn resolve_validation_errors(
        &self,
        id: Uuid,
        data: JsonValue,
    ) -> Result<CallbackResponse, CallbackError> {
        if !data.is_object() {
            return Err(CallbackError::InvalidPayload("data must be a JSON object".to_string()));
        }
        let expected = [HaltAction::ResolveValidationErrors];
        let mut obj = self.load_expecting(id, &expected).await?;
        self.claim(&mut obj, &expected).await?;

        obj.data = data;
        obj.extra_data.validation_errors.clear();

        self.resume(obj, ResumeFrom::Current).await
    }

    /// Answer `source_conflict_approval`: keep going, or give way to the other object.
    pub async fn resolve_source_conflict(
        &self,
        id: Uuid,
        decision: SourceConflictDecision,
    ) -> Result<CallbackResponse, CallbackError> {
        let expected = [HaltAction::SourceConflictApproval];
        let mut obj = self.load_expecting(id, &expected).await?;

        match decision {
            SourceConflictDecision::Proceed => {
                self.claim(&mut obj, &expected).await?;
                obj.extra_data.halted_by_wf = None;
                info!(workflow_id = %id, "source_conflict_proceed");
                self.resume(obj, ResumeFrom::Current).await
            }
            SourceConflictDecision::Stop => {
                let by = obj.extra_data.halted_by_wf.ok_or_else(|| {
                    CallbackError::InvalidPayload(format!(
                        "workflow object {} does not record which workflow halted it",
                        id
                    ))
                })?;
                self.claim(&mut obj, &expected).await?;
                obj.extra_data.stopped_by_wf = Some(by);
                info!(workflow_id = %id, stopped_by = %by, "source_conflict_stop");

                let outcome = self.engine.run_program(&mut obj, &stop_program(self.engine.config())).await?;
                Ok(CallbackResponse::from_outcome(&obj, &outcome))
            }
        }
    }

    /// Answer `robotupload_callback` with the legacy system's acknowledgement.
    pub async fn robotupload_ack(
        &self,
        id: Uuid,
        ack: RobotuploadAck,
    ) -> Result<CallbackResponse, CallbackError> {
        let expected = [HaltAction::RobotuploadCallback];
        let mut obj = self.load_expecting(id, &expected).await?;
        self.claim(&mut obj, &expected).await?;

        obj.extra_data.robotupload_ack = Some(json!({
            "success": ack.success,
            "message": ack.message,
        }));

        if ack.success {
            return self.resume(obj, ResumeFrom::Next).await;
        }

        obj.status = ObjectStatus::Error;
        obj.extra_data.halt = None;
        obj.extra_data.error_msg = Some(format!("Legacy upload failed: {}", ack.message));
        self.engine.store().save(&mut obj).await?;
        warn!(workflow_id = %id, message = %ack.message, "robotupload_failed");

        Ok(CallbackResponse {
            workflow_id: id,
            status: obj.status,
            message: format!("Legacy upload failed: {}", ack.message),
        })
    }
}

fn patch_extra_data(current: &ExtraData, patch: Map<String, JsonValue>) -> Result<ExtraData, CallbackError> {
    let mut value = serde_json::to_value(current)
        .map_err(|e| CallbackError::InvalidPayload(format!("extra_data: {}", e)))?;
    if let JsonValue::Object(map) = &mut value {
        map.extend(patch);
    }
    serde_json::from_value(value)
        .map_err(|e| CallbackError::InvalidPayload(format!("extra_data: {}", e)))
}

fn not_in_expected_state(obj: &WorkflowObject, expected: &[HaltAction]) -> CallbackError {
    let expected: Vec<&str> = expected.iter().map(|a| a.as_str()).collect();
    CallbackError::WorkflowNotInExpectedState {
        id: obj.id,
        expected: expected.join(" or "),
        status: obj.status,
        current: obj
            .current_halt()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "no halt".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{fn_task, task, InMemoryCollaborators, Outcome, StepProgram};
    use crate::types::CreateObjectParams;

    fn handler() -> (CallbackHandler, Arc<Engine>) {
        let collaborators = InMemoryCollaborators::new();
        let mut engine = Engine::new(collaborators.environment(Config::default()));
        engine.register(StepProgram::new(
            "approval",
            vec![
                task(fn_task("ask", |_| Ok(Outcome::halt(HaltAction::HepApproval, "approve?")))),
                task(fn_task("after", |obj| {
                    obj.data["after_ran"] = json!(true);
                    Ok(Outcome::Continue)
                })),
            ],
        ));
        let engine = Arc::new(engine);
        (CallbackHandler::new(engine.clone()), engine)
    }

    async fn halted(engine: &Engine) -> WorkflowObject {
        let (obj, outcome) = engine
            .start(CreateObjectParams {
                workflow_name: "approval".to_string(),
                data: json!({}),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(outcome.is_suspended());
        obj
    }

    #[tokio::test]
    async fn test_approval_resumes_after_halting_task() {
        let (handler, engine) = handler();
        let obj = halted(&engine).await;

        let response = handler
            .resolve_approval(
                obj.id,
                HaltAction::HepApproval,
                ApprovalPayload {
                    value: Decision::AcceptCore,
                    reason: Some("looks fine".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.status, ObjectStatus::Completed);

        let obj = engine.load(obj.id).await.unwrap();
        assert!(obj.extra_data.is_marked(Mark::Approved));
        assert!(obj.extra_data.is_marked(Mark::Core));
        assert_eq!(obj.extra_data.reason.as_deref(), Some("looks fine"));
        assert_eq!(obj.data["after_ran"], json!(true));
        assert!(obj.extra_data.halt.is_none());
    }

    #[tokio::test]
    async fn test_wrong_action_is_rejected_without_change() {
        let (handler, engine) = handler();
        let obj = halted(&engine).await;

        let err = handler
            .resolve_match(obj.id, MatchPayload { control_number: None })
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::WorkflowNotInExpectedState { .. }));

        let after = engine.load(obj.id).await.unwrap();
        assert_eq!(after.status, ObjectStatus::Halted);
        assert_eq!(after.callback_pos, obj.callback_pos);
    }

    #[tokio::test]
    async fn test_replayed_callback_is_rejected() {
        let (handler, engine) = handler();
        let obj = halted(&engine).await;
        let payload = ApprovalPayload {
            value: Decision::Accept,
            reason: None,
        };

        handler
            .resolve_approval(obj.id, HaltAction::HepApproval, payload.clone())
            .await
            .unwrap();
        let err = handler
            .resolve_approval(obj.id, HaltAction::HepApproval, payload)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallbackError::WorkflowNotInExpectedState {
                status: ObjectStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_object() {
        let (handler, _engine) = handler();
        let err = handler
            .robotupload_ack(
                Uuid::new_v4(),
                RobotuploadAck {
                    success: true,
                    message: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::NotFound(_)));
    }

    #[test]
    fn test_decision_wire_names() {
        let payload: ApprovalPayload =
            serde_json::from_value(json!({"value": "accept_core"})).unwrap();
        assert_eq!(payload.value, Decision::AcceptCore);
        assert!("maybe".parse::<Decision>().is_err());
    }
}
