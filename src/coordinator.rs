//! Blocked-workflow coordination
//!
//! Serializes in-flight objects that target the same catalog record. An object
//! lists the objects it waits for in `extra_data.holdingpen_matches`; that list
//! is recomputed on each check, and a blocker that vanished or completed never
//! blocks.

use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::{Engine, HaltRequest, ResumeFrom, TaskError};
use crate::matching::DuplicateMatcher;
use crate::store::WorkflowStore;
use crate::types::{HaltAction, Mark, ObjectStatus, WorkflowObject};
use crate::workflows::stop::stop_program;

/// Statuses a same-source match can be stopped from.
const STOPPABLE: [ObjectStatus; 4] = [
    ObjectStatus::Initial,
    ObjectStatus::Halted,
    ObjectStatus::Waiting,
    ObjectStatus::Error,
];

/// Statuses a different-source match is halted from.
const HALTABLE: [ObjectStatus; 3] = [
    ObjectStatus::Initial,
    ObjectStatus::Waiting,
    ObjectStatus::Error,
];

pub struct Coordinator {
    matcher: DuplicateMatcher,
    store: Arc<dyn WorkflowStore>,
}

impl Coordinator {
    pub fn new(matcher: DuplicateMatcher, store: Arc<dyn WorkflowStore>) -> Self {
        Self { matcher, store }
    }

    /// Recompute `obj.extra_data.holdingpen_matches`.
    ///
    /// Unless `include_blocked_by_self`, objects already waiting on `obj` are
    /// left out so two objects never wait on each other.
    pub async fn set_wf_not_completed_ids_to_wf(
        &self,
        obj: &mut WorkflowObject,
        include_blocked_by_self: bool,
    ) -> Result<Vec<Uuid>, TaskError> {
        let own_id = obj.id;
        let matches = self
            .matcher
            .pending_in_holding_pen(obj, |other| {
                include_blocked_by_self || !other.extra_data.holdingpen_matches.contains(&own_id)
            })
            .await?;
        obj.extra_data.holdingpen_matches = matches.clone();
        Ok(matches)
    }

    /// Stop same-source matches and halt different-source ones.
    ///
    /// Stopped objects leave `holdingpen_matches` and are remembered in
    /// `stopped_wfs`. Halted ones stay as blockers until a curator decides.
    pub async fn handle_matched_holdingpen_wfs(
        &self,
        engine: &Engine,
        obj: &mut WorkflowObject,
    ) -> Result<(), TaskError> {
        let source = obj.source().ok_or_else(|| {
            TaskError::contract(format!(
                "workflow object {} has no acquisition source, cannot compare it with holding pen matches",
                obj.id
            ))
        })?;

        let matched = obj.extra_data.holdingpen_matches.clone();
        let mut blockers = Vec::with_capacity(matched.len());

        for id in matched {
            let Some(other) = self.store.get(id).await? else {
                warn!(workflow_id = %obj.id, matched_id = %id, "matched_workflow_vanished");
                continue;
            };
            if other.status == ObjectStatus::Completed {
                continue;
            }

            let same_source = other
                .source()
                .map(|s| s.eq_ignore_ascii_case(&source))
                .unwrap_or(false);

            if same_source {
                let Some(mut other) = self.take(id, &STOPPABLE).await? else {
                    info!(workflow_id = %obj.id, matched_id = %id, "matched_workflow_busy");
                    blockers.push(id);
                    continue;
                };
                other.extra_data.stopped_by_wf = Some(obj.id);
                engine
                    .run_program(&mut other, &stop_program(engine.config()))
                    .await
                    .map_err(|e| TaskError::failed(format!("failed to stop workflow {}: {}", id, e)))?;

                if !obj.extra_data.stopped_wfs.contains(&id) {
                    obj.extra_data.stopped_wfs.push(id);
                }
                obj.extra_data.mark(Mark::StoppedMatchedHoldingpenWf, true);
                info!(workflow_id = %obj.id, stopped_id = %id, source = %source, "matched_workflow_stopped");
                continue;
            }

            // Objects already halted or running are left to their curator.
            if let Some(mut other) = self.take(id, &HALTABLE).await? {
                other.extra_data.halted_by_wf = Some(obj.id);
                let message = format!(
                    "Workflow {} from source '{}' targets the same record",
                    obj.id, source
                );
                engine
                    .halt(
                        &mut other,
                        HaltRequest::halt(HaltAction::SourceConflictApproval, message),
                    )
                    .await
                    .map_err(|e| TaskError::failed(format!("failed to halt workflow {}: {}", id, e)))?;
                info!(workflow_id = %obj.id, halted_id = %id, "matched_workflow_halted");
            }
            blockers.push(id);
        }

        obj.extra_data.holdingpen_matches = blockers;
        Ok(())
    }

    /// Claim another object and return its stored state, or `None` if it is
    /// not in one of `expected` any more.
    async fn take(
        &self,
        id: Uuid,
        expected: &[ObjectStatus],
    ) -> Result<Option<WorkflowObject>, TaskError> {
        if !self.store.claim(id, expected).await? {
            return Ok(None);
        }
        Ok(self.store.get(id).await?)
    }

    /// Drop blockers that vanished or completed. Returns those still blocking.
    pub async fn prune_blockers(&self, obj: &mut WorkflowObject) -> Result<Vec<Uuid>, TaskError> {
        let mut remaining = Vec::new();
        for id in &obj.extra_data.holdingpen_matches {
            if *id == obj.id {
                continue;
            }
            match self.store.get(*id).await? {
                Some(other) if other.status != ObjectStatus::Completed => remaining.push(*id),
                _ => {}
            }
        }
        obj.extra_data.holdingpen_matches = remaining.clone();
        Ok(remaining)
    }

    /// Remove `obj` from every object listing it as a blocker.
    ///
    /// Returns the WAITING objects left without a live blocker, in creation order.
    pub async fn release_blocked(&self, obj: &WorkflowObject) -> Result<Vec<WorkflowObject>, TaskError> {
        let mut released = Vec::new();
        for mut other in self.store.find_blocked_by(obj.id).await? {
            if other.id == obj.id {
                continue;
            }
            other.extra_data.holdingpen_matches.retain(|id| *id != obj.id);
            let live = self.prune_blockers(&mut other).await?;

            // Only the blocker list is written; the object may be running.
            let Some(current) = self.store.set_holdingpen_matches(other.id, &live).await? else {
                continue;
            };
            if current.status == ObjectStatus::Waiting && live.is_empty() {
                released.push(current);
            }
        }
        Ok(released)
    }

    /// Release objects blocked by `obj` and resume those now free.
    ///
    /// A failing resume is logged and does not fail `obj`.
    pub async fn run_next_if_necessary(
        &self,
        engine: &Engine,
        obj: &WorkflowObject,
    ) -> Result<Vec<Uuid>, TaskError> {
        let mut resumed = Vec::new();
        for mut other in self.release_blocked(obj).await? {
            if !self.store.claim(other.id, &[ObjectStatus::Waiting]).await? {
                continue;
            }
            other.status = ObjectStatus::Running;
            info!(workflow_id = %other.id, released_by = %obj.id, "workflow_released");
            match engine.resume(&mut other, ResumeFrom::Current).await {
                Ok(outcome) => {
                    info!(workflow_id = %other.id, outcome = ?outcome, "released_workflow_ran");
                }
                Err(err) => {
                    error!(workflow_id = %other.id, error = %err, "released_workflow_failed");
                }
            }
            resumed.push(other.id);
        }
        Ok(resumed)
    }
}
