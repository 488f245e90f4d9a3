use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/* ===================== Status ===================== */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    Initial,
    Running,
    Halted,
    Waiting,
    Completed,
    Error,
}

impl ObjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectStatus::Initial => "initial",
            ObjectStatus::Running => "running",
            ObjectStatus::Halted => "halted",
            ObjectStatus::Waiting => "waiting",
            ObjectStatus::Completed => "completed",
            ObjectStatus::Error => "error",
        }
    }

    /// Halted or waiting: the object sits on a saved cursor until something resumes it.
    pub fn is_suspended(self) -> bool {
        matches!(self, ObjectStatus::Halted | ObjectStatus::Waiting)
    }
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initial" => Ok(ObjectStatus::Initial),
            "running" => Ok(ObjectStatus::Running),
            "halted" => Ok(ObjectStatus::Halted),
            "waiting" => Ok(ObjectStatus::Waiting),
            "completed" => Ok(ObjectStatus::Completed),
            "error" => Ok(ObjectStatus::Error),
            other => Err(format!(
                "Invalid status: {}. Must be one of: initial, running, halted, waiting, completed, error",
                other
            )),
        }
    }
}

/* ===================== Halts ===================== */

/// Why a workflow object is suspended. Callbacks must name the action they resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltAction {
    MatchApproval,
    MergeApproval,
    HepApproval,
    CoreApproval,
    CoreSelectionApproval,
    ResolveValidationErrors,
    SourceConflictApproval,
    RobotuploadCallback,
    BlockedByHoldingpen,
}

impl HaltAction {
    pub fn as_str(self) -> &'static str {
        match self {
            HaltAction::MatchApproval => "match_approval",
            HaltAction::MergeApproval => "merge_approval",
            HaltAction::HepApproval => "hep_approval",
            HaltAction::CoreApproval => "core_approval",
            HaltAction::CoreSelectionApproval => "core_selection_approval",
            HaltAction::ResolveValidationErrors => "resolve_validation_errors",
            HaltAction::SourceConflictApproval => "source_conflict_approval",
            HaltAction::RobotuploadCallback => "robotupload_callback",
            HaltAction::BlockedByHoldingpen => "blocked_by_holdingpen",
        }
    }
}

impl fmt::Display for HaltAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HaltAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(JsonValue::String(s.to_string()))
            .map_err(|_| format!("Unknown halt action: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltInfo {
    pub action: HaltAction,
    pub message: String,
}

/* ===================== Extra data ===================== */

/// Recognized boolean-ish marks. Anything workflow specific goes to `ExtraData::extensions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mark {
    IsUpdate,
    Approved,
    AutoApproved,
    Core,
    Merged,
    StoppedMatchedHoldingpenWf,
    AlreadyHarvested,
    IsSubmission,
    PreviouslyRejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyCandidate {
    pub control_number: i64,
    pub score: f64,
    #[serde(default)]
    pub fields: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Matches {
    #[serde(default)]
    pub exact: Vec<i64>,
    #[serde(default)]
    pub fuzzy: Vec<FuzzyCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictOp {
    /// The update would overwrite a differing head value.
    Replace,
    /// The update would drop a value the head has.
    Remove,
}

/// Field-level disagreement between the incoming update and the stored head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: String,
    pub op: ConflictOp,
    pub head: JsonValue,
    pub update: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub task: String,
    pub outcome: String,
    pub at: DateTime<Utc>,
}

/// Pipeline bookkeeping attached to a workflow object.
///
/// The recognized keys are typed fields so a typo cannot silently create
/// untracked state. Keys this struct does not know about are kept verbatim in
/// `extensions`, which is flattened into the same JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub marks: BTreeMap<Mark, JsonValue>,

    /// Keys of `do_not_repeat` tasks that already ran.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub done: BTreeSet<String>,

    #[serde(default)]
    pub matches: Matches,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub holdingpen_matches: Vec<Uuid>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previously_rejected_matches: Vec<Uuid>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stopped_wfs: Vec<Uuid>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curation_ticket_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robotupload_ack: Option<JsonValue>,

    #[serde(default)]
    pub restart_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt: Option<HaltInfo>,

    #[serde(rename = "_error_msg", default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,

    #[serde(rename = "stopped-by-wf", default, skip_serializing_if = "Option::is_none")]
    pub stopped_by_wf: Option<Uuid>,

    #[serde(rename = "halted-by-wf", default, skip_serializing_if = "Option::is_none")]
    pub halted_by_wf: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_history: Vec<TaskHistoryEntry>,

    #[serde(flatten)]
    pub extensions: Map<String, JsonValue>,
}

impl ExtraData {
    pub fn mark(&mut self, mark: Mark, value: impl Into<JsonValue>) {
        self.marks.insert(mark, value.into());
    }

    pub fn unmark(&mut self, mark: Mark) {
        self.marks.remove(&mark);
    }

    /// `Some(b)` when the mark holds a boolean, `None` when unset or non-boolean.
    pub fn flag(&self, mark: Mark) -> Option<bool> {
        self.marks.get(&mark).and_then(JsonValue::as_bool)
    }

    pub fn is_marked(&self, mark: Mark) -> bool {
        self.flag(mark).unwrap_or(false)
    }
}

/* ===================== Workflow object ===================== */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowObject {
    pub id: Uuid,
    pub workflow_name: String,
    pub data: JsonValue,
    pub extra_data: ExtraData,
    pub status: ObjectStatus,
    pub callback_pos: Vec<usize>,
    pub id_workflow: Uuid,
    pub id_parent: Option<Uuid>,
    pub id_user: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl WorkflowObject {
    pub fn new(params: CreateObjectParams) -> Self {
        let now = Utc::now();
        Self {
            id: params.id.unwrap_or_else(Uuid::new_v4),
            workflow_name: params.workflow_name,
            data: params.data,
            extra_data: params.extra_data,
            status: ObjectStatus::Initial,
            callback_pos: Vec::new(),
            id_workflow: params.id_workflow.unwrap_or_else(Uuid::new_v4),
            id_parent: params.id_parent,
            id_user: params.id_user,
            created_at: now,
            modified_at: now,
        }
    }

    /// Acquisition source from bookkeeping, falling back to the record itself.
    pub fn source(&self) -> Option<String> {
        self.extra_data.source.clone().or_else(|| {
            self.data
                .pointer("/acquisition_source/source")
                .and_then(JsonValue::as_str)
                .map(|s| s.to_string())
        })
    }

    pub fn control_number(&self) -> Option<i64> {
        self.data.get("control_number").and_then(JsonValue::as_i64)
    }

    pub fn current_halt(&self) -> Option<HaltAction> {
        self.extra_data.halt.as_ref().map(|h| h.action)
    }

    /// Completed because another workflow superseded it.
    pub fn is_superseded(&self) -> bool {
        self.status == ObjectStatus::Completed && self.extra_data.stopped_by_wf.is_some()
    }

    /// Human-readable status, distinguishing supersession from natural completion.
    pub fn status_label(&self) -> String {
        match (self.status, &self.extra_data.halt, self.extra_data.stopped_by_wf) {
            (ObjectStatus::Completed, _, Some(by)) => format!("completed (stopped by {})", by),
            (status, Some(halt), _) if status.is_suspended() => {
                format!("{} ({})", status, halt.action)
            }
            (status, _, _) => status.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateObjectParams {
    pub id: Option<Uuid>,
    pub workflow_name: String,
    pub data: JsonValue,
    pub extra_data: ExtraData,
    pub id_workflow: Option<Uuid>,
    pub id_parent: Option<Uuid>,
    pub id_user: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectListFilter {
    pub workflow_name: Option<String>,
    pub status: Option<ObjectStatus>,
    pub not_completed: bool,
    pub limit: Option<i64>,
}

impl ObjectListFilter {
    pub fn matches(&self, obj: &WorkflowObject) -> bool {
        if let Some(name) = &self.workflow_name {
            if &obj.workflow_name != name {
                return false;
            }
        }
        if let Some(status) = self.status {
            if obj.status != status {
                return false;
            }
        }
        !(self.not_completed && obj.status == ObjectStatus::Completed)
    }
}
