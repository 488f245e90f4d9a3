use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::callbacks::{
    ApprovalPayload, CallbackError, CallbackHandler, Decision, MatchPayload, MergeResolution,
    RobotuploadAck, SourceConflictDecision,
};
use crate::config::Config;
use crate::engine::{Engine, EngineError, InMemoryCollaborators, RunOutcome, TaskError};
use crate::external::TicketEvent;
use crate::types::{CreateObjectParams, HaltAction, Mark, ObjectStatus, WorkflowObject};

struct Harness {
    engine: Arc<Engine>,
    callbacks: CallbackHandler,
    collaborators: InMemoryCollaborators,
}

fn harness(config: Config) -> Harness {
    let collaborators = InMemoryCollaborators::new();
    let mut engine = Engine::new(collaborators.environment(config));
    register_builtin(&mut engine);
    let engine = Arc::new(engine);
    Harness {
        callbacks: CallbackHandler::new(engine.clone()),
        engine,
        collaborators,
    }
}

fn arxiv_record(eprint: &str, title: &str) -> JsonValue {
    json!({
        "titles": [{"title": title}],
        "acquisition_source": {"source": "arXiv", "method": "hepcrawl"},
        "arxiv_eprints": [{"value": eprint, "categories": ["hep-th"]}],
    })
}

fn params(data: JsonValue) -> CreateObjectParams {
    CreateObjectParams {
        workflow_name: ARTICLE_WORKFLOW.to_string(),
        data,
        ..Default::default()
    }
}

fn accept(value: Decision) -> ApprovalPayload {
    ApprovalPayload { value, reason: None }
}

fn halt_action(obj: &WorkflowObject) -> Option<HaltAction> {
    obj.current_halt()
}

#[tokio::test]
async fn test_new_record_waits_for_approval_then_completes_as_core() {
    let h = harness(Config::default());

    let (obj, outcome) = h
        .engine
        .start(params(arxiv_record("1234.5678", "Dark matter on the lattice")))
        .await
        .unwrap();
    assert!(outcome.is_suspended());
    assert_eq!(obj.status, ObjectStatus::Halted);
    assert_eq!(halt_action(&obj), Some(HaltAction::HepApproval));

    let response = h
        .callbacks
        .resolve_approval(obj.id, HaltAction::HepApproval, accept(Decision::AcceptCore))
        .await
        .unwrap();
    assert_eq!(response.status, ObjectStatus::Completed);

    let obj = h.engine.load(obj.id).await.unwrap();
    assert_eq!(obj.data["core"], json!(true));
    assert!(obj.control_number().is_some());
    assert!(obj.callback_pos.is_empty());

    let curation: Vec<TicketEvent> = h
        .collaborators
        .ticketing
        .events()
        .into_iter()
        .filter(|e| matches!(e, TicketEvent::Created { queue, .. } if queue == "HEP_curation"))
        .collect();
    assert_eq!(curation.len(), 1);
    assert_eq!(h.collaborators.uploader.uploads().len(), 1);

    let err = h
        .callbacks
        .resolve_approval(obj.id, HaltAction::HepApproval, accept(Decision::AcceptCore))
        .await
        .unwrap_err();
    assert!(matches!(err, CallbackError::WorkflowNotInExpectedState { .. }));
    assert_eq!(h.collaborators.ticketing.created_count(), 1);
}

#[tokio::test]
async fn test_rejected_record_is_not_stored() {
    let h = harness(Config::default());
    let (obj, _) = h
        .engine
        .start(params(arxiv_record("1111.2222", "Nothing new under the sun")))
        .await
        .unwrap();

    h.callbacks
        .resolve_approval(obj.id, HaltAction::HepApproval, accept(Decision::Reject))
        .await
        .unwrap();

    let obj = h.engine.load(obj.id).await.unwrap();
    assert_eq!(obj.status, ObjectStatus::Completed);
    assert_eq!(obj.extra_data.flag(Mark::Approved), Some(false));
    assert!(obj.control_number().is_none());
    assert_eq!(h.collaborators.records.len().await, 0);
    assert!(h.collaborators.uploader.uploads().is_empty());
}

#[tokio::test]
async fn test_same_source_harvest_supersedes_older_one() {
    let h = harness(Config::default());

    let mut first = h
        .engine
        .create_object(params(arxiv_record("1234.5678", "Dark matter on the lattice")))
        .await
        .unwrap();
    let second = h
        .engine
        .create_object(params(arxiv_record("1234.5678", "Dark matter on the lattice, v2")))
        .await
        .unwrap();

    let outcome = h.engine.run(&mut first).await.unwrap();
    assert!(outcome.is_suspended());
    assert_eq!(halt_action(&first), Some(HaltAction::HepApproval));
    assert_eq!(first.extra_data.stopped_wfs, vec![second.id]);
    assert!(first.extra_data.is_marked(Mark::StoppedMatchedHoldingpenWf));

    let stopped = h.engine.load(second.id).await.unwrap();
    assert_eq!(stopped.status, ObjectStatus::Completed);
    assert_eq!(stopped.extra_data.stopped_by_wf, Some(first.id));
    assert!(stopped.is_superseded());

    h.callbacks
        .resolve_approval(first.id, HaltAction::HepApproval, accept(Decision::Accept))
        .await
        .unwrap();

    let first = h.engine.load(first.id).await.unwrap();
    let stopped = h.engine.load(second.id).await.unwrap();
    assert_eq!(first.status, ObjectStatus::Completed);
    assert!(first.control_number().is_some());
    assert_eq!(first.control_number(), stopped.control_number());
}

#[tokio::test]
async fn test_later_harvest_stops_the_halted_one() {
    let h = harness(Config::default());

    let (older, outcome) = h
        .engine
        .start(params(arxiv_record("1234.5678", "Dark matter on the lattice")))
        .await
        .unwrap();
    assert!(outcome.is_suspended());
    assert_eq!(halt_action(&older), Some(HaltAction::HepApproval));

    let (newer, _) = h
        .engine
        .start(params(arxiv_record("1234.5678", "Dark matter on the lattice, v2")))
        .await
        .unwrap();
    assert_eq!(halt_action(&newer), Some(HaltAction::HepApproval));
    assert_eq!(newer.extra_data.stopped_wfs, vec![older.id]);
    assert!(newer.extra_data.holdingpen_matches.is_empty());

    let stopped = h.engine.load(older.id).await.unwrap();
    assert_eq!(stopped.status, ObjectStatus::Completed);
    assert_eq!(stopped.extra_data.stopped_by_wf, Some(newer.id));

    h.callbacks
        .resolve_approval(newer.id, HaltAction::HepApproval, accept(Decision::Accept))
        .await
        .unwrap();
    let newer = h.engine.load(newer.id).await.unwrap();
    let stopped = h.engine.load(older.id).await.unwrap();
    assert!(newer.control_number().is_some());
    assert_eq!(stopped.control_number(), newer.control_number());

    let err = h
        .callbacks
        .resolve_approval(older.id, HaltAction::HepApproval, accept(Decision::Accept))
        .await
        .unwrap_err();
    assert!(matches!(err, CallbackError::WorkflowNotInExpectedState { .. }));
    assert_eq!(h.collaborators.records.len().await, 1);
}

#[tokio::test]
async fn test_other_source_object_waits_for_curator() {
    let h = harness(Config::default());

    let mut publisher = arxiv_record("1234.5678", "Dark matter on the lattice");
    publisher["acquisition_source"] = json!({"source": "Elsevier"});
    let older = h.engine.create_object(params(publisher)).await.unwrap();

    let (newer, outcome) = h
        .engine
        .start(params(arxiv_record("1234.5678", "Dark matter on the lattice")))
        .await
        .unwrap();

    match outcome {
        RunOutcome::Suspended(s) => {
            assert_eq!(s.status, ObjectStatus::Waiting);
            assert_eq!(s.action, HaltAction::BlockedByHoldingpen);
        }
        other => panic!("expected a suspension, got {:?}", other),
    }
    assert_eq!(newer.extra_data.holdingpen_matches, vec![older.id]);

    let older = h.engine.load(older.id).await.unwrap();
    assert_eq!(older.status, ObjectStatus::Halted);
    assert_eq!(halt_action(&older), Some(HaltAction::SourceConflictApproval));
    assert_eq!(older.extra_data.halted_by_wf, Some(newer.id));
}

#[tokio::test]
async fn test_single_exact_match_becomes_update_without_curator() {
    let h = harness(Config::default());
    let mut head = arxiv_record("1234.5678", "Dark matter on the lattice");
    head["arxiv_eprints"] = json!([{"value": "1234.5678"}]);
    let control_number = h.collaborators.records.insert(head).await;

    let mut update = arxiv_record("1234.5678", "Dark matter on the lattice (revised)");
    update["arxiv_eprints"] = json!([{"value": "1234.5678"}]);
    let (obj, outcome) = h.engine.start(params(update)).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(obj.extra_data.matches.approved, Some(control_number));
    assert!(obj.extra_data.is_marked(Mark::IsUpdate));
    assert!(obj.extra_data.is_marked(Mark::Approved));
    assert_eq!(obj.control_number(), Some(control_number));
    assert_eq!(h.collaborators.records.len().await, 1);
    assert_eq!(h.collaborators.uploader.uploads()[0].1, "replace");
}

#[tokio::test]
async fn test_several_exact_matches_need_a_curator() {
    let h = harness(Config::default());
    let mut head = arxiv_record("1234.5678", "Dark matter on the lattice");
    head["arxiv_eprints"] = json!([{"value": "1234.5678"}]);
    let first = h.collaborators.records.insert(head.clone()).await;
    let second = h.collaborators.records.insert(head.clone()).await;

    let (obj, outcome) = h.engine.start(params(head)).await.unwrap();
    assert!(outcome.is_suspended());
    assert_eq!(halt_action(&obj), Some(HaltAction::MatchApproval));
    assert_eq!(obj.extra_data.matches.exact, vec![first, second]);
    assert_eq!(obj.extra_data.matches.approved, None);

    let err = h
        .callbacks
        .resolve_match(obj.id, MatchPayload { control_number: Some(999) })
        .await
        .unwrap_err();
    assert!(matches!(err, CallbackError::InvalidPayload(_)));

    let response = h
        .callbacks
        .resolve_match(obj.id, MatchPayload { control_number: Some(second) })
        .await
        .unwrap();
    assert_eq!(response.status, ObjectStatus::Completed);

    let obj = h.engine.load(obj.id).await.unwrap();
    assert_eq!(obj.control_number(), Some(second));
}

#[tokio::test]
async fn test_merge_conflicts_are_resolved_by_curator() {
    let h = harness(Config::default());
    let mut head = arxiv_record("1234.5678", "Dark matter on the lattice");
    head["arxiv_eprints"] = json!([{"value": "1234.5678"}]);
    head["acquisition_source"] = json!({"source": "Elsevier"});
    head["page_start"] = json!("1");
    let control_number = h.collaborators.records.insert(head).await;

    let mut update = arxiv_record("1234.5678", "Dark matter on a lattice");
    update["arxiv_eprints"] = json!([{"value": "1234.5678"}]);
    update["page_start"] = json!("17");
    let (obj, outcome) = h.engine.start(params(update)).await.unwrap();

    assert!(outcome.is_suspended());
    assert_eq!(halt_action(&obj), Some(HaltAction::MergeApproval));
    assert!(!obj.extra_data.conflicts.is_empty());

    let mut curated = obj.data.clone();
    curated["page_start"] = json!("17");
    h.callbacks
        .resolve_merge_conflicts(
            obj.id,
            MergeResolution {
                data: curated,
                extra_data: Some(
                    json!({"reason": "publisher pagination kept"})
                        .as_object()
                        .cloned()
                        .unwrap(),
                ),
                conflicts: Vec::new(),
            },
        )
        .await
        .unwrap();

    let obj = h.engine.load(obj.id).await.unwrap();
    assert_eq!(obj.status, ObjectStatus::Completed);
    assert!(obj.extra_data.is_marked(Mark::Merged));
    assert!(obj.extra_data.conflicts.is_empty());
    assert_eq!(obj.extra_data.reason.as_deref(), Some("publisher pagination kept"));
    assert_eq!(obj.control_number(), Some(control_number));
}

#[tokio::test]
async fn test_auto_approved_core_record_asks_only_for_core_selection() {
    let mut config = Config::default();
    config.workflow.auto_approve = true;
    let h = harness(config);

    let (obj, _) = h
        .engine
        .start(params(arxiv_record("2401.00001", "Strings at finite temperature")))
        .await
        .unwrap();
    assert_eq!(halt_action(&obj), Some(HaltAction::CoreSelectionApproval));
    assert!(obj.extra_data.is_marked(Mark::AutoApproved));

    h.callbacks
        .resolve_approval(obj.id, HaltAction::CoreSelectionApproval, accept(Decision::Accept))
        .await
        .unwrap();

    let obj = h.engine.load(obj.id).await.unwrap();
    assert_eq!(obj.status, ObjectStatus::Completed);
    assert!(!obj.extra_data.is_marked(Mark::Core));
    assert_eq!(h.collaborators.ticketing.created_count(), 0);
}

#[tokio::test]
async fn test_submission_ticket_lifecycle() {
    let h = harness(Config::default());
    let mut data = arxiv_record("2401.00002", "A user submitted paper");
    data["acquisition_source"] = json!({"source": "submitter", "method": "submitter"});

    let (obj, _) = h.engine.start(params(data)).await.unwrap();
    assert!(obj.extra_data.is_marked(Mark::IsSubmission));
    let ticket_id = obj.extra_data.ticket_id.clone().unwrap();

    h.callbacks
        .resolve_approval(obj.id, HaltAction::HepApproval, accept(Decision::Accept))
        .await
        .unwrap();

    let events = h.collaborators.ticketing.events();
    assert_eq!(
        events,
        vec![
            TicketEvent::Created {
                ticket_id: ticket_id.clone(),
                queue: "HEP_add_user".to_string(),
                template: "submission_new".to_string(),
            },
            TicketEvent::Replied {
                ticket_id: ticket_id.clone(),
                template: "submission_accepted".to_string(),
            },
            TicketEvent::Closed { ticket_id },
        ]
    );
}

#[tokio::test]
async fn test_same_source_rejection_is_remembered() {
    let h = harness(Config::default());
    let (first, _) = h
        .engine
        .start(params(arxiv_record("2401.00003", "Rejected once")))
        .await
        .unwrap();
    h.callbacks
        .resolve_approval(first.id, HaltAction::HepApproval, accept(Decision::Reject))
        .await
        .unwrap();

    let (again, outcome) = h
        .engine
        .start(params(arxiv_record("2401.00003", "Rejected once")))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert!(again.extra_data.is_marked(Mark::PreviouslyRejected));
    assert_eq!(again.extra_data.previously_rejected_matches, vec![first.id]);
    assert_eq!(again.extra_data.flag(Mark::Approved), Some(false));
}

#[tokio::test]
async fn test_missing_required_field_halts_until_fixed() {
    let h = harness(Config::default());
    let mut data = arxiv_record("2401.00004", "placeholder");
    data.as_object_mut().unwrap().remove("titles");

    let (obj, _) = h.engine.start(params(data.clone())).await.unwrap();
    assert_eq!(halt_action(&obj), Some(HaltAction::ResolveValidationErrors));
    assert_eq!(obj.extra_data.validation_errors.len(), 1);

    data["titles"] = json!([{"title": "Now with a title"}]);
    h.callbacks
        .resolve_validation_errors(obj.id, data)
        .await
        .unwrap();

    let obj = h.engine.load(obj.id).await.unwrap();
    assert_eq!(halt_action(&obj), Some(HaltAction::HepApproval));
    assert!(obj.extra_data.validation_errors.is_empty());
}

/// Older publisher object halted on a source conflict by a newer arXiv one.
async fn source_conflict(h: &Harness) -> (WorkflowObject, WorkflowObject) {
    let mut publisher = arxiv_record("1234.5678", "Dark matter on the lattice");
    publisher["acquisition_source"] = json!({"source": "Elsevier"});
    let older = h.engine.create_object(params(publisher)).await.unwrap();
    let (newer, _) = h
        .engine
        .start(params(arxiv_record("1234.5678", "Dark matter on the lattice")))
        .await
        .unwrap();
    assert_eq!(newer.status, ObjectStatus::Waiting);
    let older = h.engine.load(older.id).await.unwrap();
    assert_eq!(halt_action(&older), Some(HaltAction::SourceConflictApproval));
    (older, newer)
}

#[tokio::test]
async fn test_source_conflict_proceed_then_release() {
    let h = harness(Config::default());
    let (older, newer) = source_conflict(&h).await;

    let response = h
        .callbacks
        .resolve_source_conflict(older.id, SourceConflictDecision::Proceed)
        .await
        .unwrap();
    assert_eq!(response.status, ObjectStatus::Halted);

    let older = h.engine.load(older.id).await.unwrap();
    assert_eq!(halt_action(&older), Some(HaltAction::HepApproval));
    assert!(older.extra_data.halted_by_wf.is_none());
    let waiting = h.engine.load(newer.id).await.unwrap();
    assert_eq!(waiting.status, ObjectStatus::Waiting);
    assert_eq!(waiting.extra_data.holdingpen_matches, vec![older.id]);

    h.callbacks
        .resolve_approval(older.id, HaltAction::HepApproval, accept(Decision::AcceptCore))
        .await
        .unwrap();

    let older = h.engine.load(older.id).await.unwrap();
    let newer = h.engine.load(newer.id).await.unwrap();
    assert_eq!(older.status, ObjectStatus::Completed);
    assert_eq!(newer.status, ObjectStatus::Completed);
    assert!(newer.extra_data.is_marked(Mark::IsUpdate));
    assert!(newer.extra_data.conflicts.is_empty());
    assert_eq!(newer.control_number(), older.control_number());
}

#[tokio::test]
async fn test_source_conflict_stop_releases_the_newer_object() {
    let h = harness(Config::default());
    let (older, newer) = source_conflict(&h).await;

    let response = h
        .callbacks
        .resolve_source_conflict(older.id, SourceConflictDecision::Stop)
        .await
        .unwrap();
    assert_eq!(response.status, ObjectStatus::Completed);

    let older = h.engine.load(older.id).await.unwrap();
    assert_eq!(older.extra_data.stopped_by_wf, Some(newer.id));
    assert!(older.is_superseded());

    let newer = h.engine.load(newer.id).await.unwrap();
    assert_eq!(newer.status, ObjectStatus::Halted);
    assert_eq!(halt_action(&newer), Some(HaltAction::HepApproval));
    assert!(newer.extra_data.holdingpen_matches.is_empty());
}

fn with_upload_callback() -> Config {
    let mut config = Config::default();
    config.upload.callback_url = Some("https://legacy.example.org/callback".to_string());
    config
}

#[tokio::test]
async fn test_upload_ack_completes_the_object() {
    let h = harness(with_upload_callback());
    let (obj, _) = h
        .engine
        .start(params(arxiv_record("2401.00005", "Waiting on the legacy system")))
        .await
        .unwrap();

    let response = h
        .callbacks
        .resolve_approval(obj.id, HaltAction::HepApproval, accept(Decision::Accept))
        .await
        .unwrap();
    assert_eq!(response.status, ObjectStatus::Halted);
    let obj = h.engine.load(obj.id).await.unwrap();
    assert_eq!(halt_action(&obj), Some(HaltAction::RobotuploadCallback));
    assert_eq!(h.collaborators.uploader.uploads().len(), 1);

    let response = h
        .callbacks
        .robotupload_ack(
            obj.id,
            RobotuploadAck {
                success: true,
                message: "record 42 inserted".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(response.status, ObjectStatus::Completed);

    let obj = h.engine.load(obj.id).await.unwrap();
    assert_eq!(
        obj.extra_data.robotupload_ack,
        Some(json!({"success": true, "message": "record 42 inserted"}))
    );
}

#[tokio::test]
async fn test_failed_upload_ack_puts_object_in_error() {
    let h = harness(with_upload_callback());
    let (obj, _) = h
        .engine
        .start(params(arxiv_record("2401.00006", "Refused by the legacy system")))
        .await
        .unwrap();
    h.callbacks
        .resolve_approval(obj.id, HaltAction::HepApproval, accept(Decision::Accept))
        .await
        .unwrap();

    let response = h
        .callbacks
        .robotupload_ack(
            obj.id,
            RobotuploadAck {
                success: false,
                message: "duplicate record".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(response.status, ObjectStatus::Error);

    let obj = h.engine.load(obj.id).await.unwrap();
    assert_eq!(obj.status, ObjectStatus::Error);
    assert_eq!(
        obj.extra_data.error_msg.as_deref(),
        Some("Legacy upload failed: duplicate record")
    );
    assert!(obj.current_halt().is_none());
}

#[tokio::test]
async fn test_slow_record_index_times_out() {
    let mut config = Config::default();
    config.matching.index_timeout_ms = 20;
    let h = harness(config);
    h.collaborators.records.set_latency(Duration::from_millis(500));

    let err = h
        .engine
        .start(params(arxiv_record("2401.00007", "Stuck in the index")))
        .await
        .unwrap_err();
    let EngineError::Task { workflow_id, task, source } = err else {
        panic!("expected a task error");
    };
    assert_eq!(task, "exact_match");
    assert!(matches!(source, TaskError::Timeout(20)));

    let obj = h.engine.load(workflow_id).await.unwrap();
    assert_eq!(obj.status, ObjectStatus::Error);
}

#[tokio::test]
async fn test_stop_program_uses_configured_ticket_retry() {
    let mut config = Config::default();
    config.ticketing.retry.max_attempts = 1;
    let h = harness(config);

    let mut submitted = arxiv_record("2401.00008", "Submitted, then harvested");
    submitted["acquisition_source"] = json!({"source": "submitter", "method": "submitter"});
    let (older, _) = h.engine.start(params(submitted)).await.unwrap();
    assert!(older.extra_data.ticket_id.is_some());

    let mut harvested = arxiv_record("2401.00008", "Submitted, then harvested");
    harvested["acquisition_source"] = json!({"source": "submitter", "method": "hepcrawl"});
    h.collaborators.ticketing.fail_next(1);
    assert!(h.engine.start(params(harvested)).await.is_err());

    let older = h.engine.load(older.id).await.unwrap();
    assert_eq!(older.status, ObjectStatus::Error);
    assert!(older.extra_data.stopped_by_wf.is_some());
}

#[test]
fn test_builtin_programs_register() {
    let collaborators = InMemoryCollaborators::new();
    let mut engine = Engine::new(collaborators.environment(Config::default()));
    register_builtin(&mut engine);
    assert!(engine.program(ARTICLE_WORKFLOW).is_ok());
    assert!(engine.program(STOP_WORKFLOW).is_ok());
}
