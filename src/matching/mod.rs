//! Duplicate detection against the catalog and the holding pen

pub mod criteria;
pub mod fuzzy;

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::config::MatchingConfig;
use crate::external::{ExternalError, RecordIndex, WorkflowIndex};
use crate::types::{FuzzyCandidate, Mark, ObjectStatus, WorkflowObject};
use criteria::{criteria_for, Criterion};

/// Outcome of combining exact and fuzzy results.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResolution {
    NoMatch,
    Exact(i64),
    /// Several records share a strong identifier. Never auto-picked.
    Ambiguous(Vec<i64>),
    /// Only loose candidates. Always needs a curator.
    Fuzzy(Vec<FuzzyCandidate>),
}

/// How many index candidates to pull per requested fuzzy result.
const FUZZY_PREFETCH_FACTOR: usize = 10;

pub struct DuplicateMatcher {
    records: Arc<dyn RecordIndex>,
    workflows: Arc<dyn WorkflowIndex>,
    config: MatchingConfig,
}

impl DuplicateMatcher {
    pub fn new(
        records: Arc<dyn RecordIndex>,
        workflows: Arc<dyn WorkflowIndex>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            records,
            workflows,
            config,
        }
    }

    pub fn criteria(&self, obj: &WorkflowObject) -> Vec<Criterion> {
        criteria_for(&obj.data, &self.config.exact_fields)
    }

    /// Control numbers sharing a strong identifier with `obj`, ascending and unique.
    pub async fn exact_match(&self, obj: &WorkflowObject) -> Result<Vec<i64>, ExternalError> {
        let criteria = self.criteria(obj);
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        let mut found = self.records.exact_match(&criteria).await?;
        found.sort_unstable();
        found.dedup();
        if let Some(own) = obj.control_number() {
            found.retain(|cn| *cn != own);
        }
        debug!(workflow_id = %obj.id, matches = ?found, "exact_match");
        Ok(found)
    }

    pub async fn fuzzy_match(&self, obj: &WorkflowObject) -> Result<Vec<FuzzyCandidate>, ExternalError> {
        let limit = self.config.fuzzy_limit;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let candidates = self
            .records
            .fuzzy_match(&obj.data, limit.saturating_mul(FUZZY_PREFETCH_FACTOR))
            .await?;
        let mut ranked = fuzzy::rank(&obj.data, &candidates, self.config.fuzzy_threshold, limit);
        if let Some(own) = obj.control_number() {
            ranked.retain(|c| c.control_number != own);
        }
        debug!(workflow_id = %obj.id, candidates = ranked.len(), "fuzzy_match");
        Ok(ranked)
    }

    /// Not-completed objects of the same workflow type sharing an identifier with `obj`.
    ///
    /// The index is refreshed first so objects created moments ago are seen.
    pub async fn pending_in_holding_pen<F>(
        &self,
        obj: &WorkflowObject,
        predicate: F,
    ) -> Result<Vec<Uuid>, ExternalError>
    where
        F: Fn(&WorkflowObject) -> bool,
    {
        let criteria = self.criteria(obj);
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        self.workflows.refresh().await?;
        let found = self.workflows.search_not_completed(&criteria).await?;
        Ok(found
            .into_iter()
            .filter(|other| other.id != obj.id)
            .filter(|other| other.workflow_name == obj.workflow_name)
            .filter(|other| other.status != ObjectStatus::Completed)
            .filter(|other| predicate(other))
            .map(|other| other.id)
            .collect())
    }

    /// Completed objects for the same record that a curator rejected.
    pub async fn previously_rejected(
        &self,
        obj: &WorkflowObject,
    ) -> Result<Vec<WorkflowObject>, ExternalError> {
        let criteria = self.criteria(obj);
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        self.workflows.refresh().await?;
        let found = self.workflows.search(&criteria, true).await?;
        Ok(found
            .into_iter()
            .filter(|other| other.id != obj.id)
            .filter(|other| other.workflow_name == obj.workflow_name)
            .filter(|other| other.status == ObjectStatus::Completed)
            .filter(|other| other.extra_data.stopped_by_wf.is_none())
            .filter(|other| other.extra_data.flag(Mark::Approved) == Some(false))
            .collect())
    }

    /// Exact wins over fuzzy; fuzzy is only consulted without exact matches.
    pub fn resolve(exact: &[i64], fuzzy: &[FuzzyCandidate]) -> MatchResolution {
        match exact {
            [single] => MatchResolution::Exact(*single),
            [] if fuzzy.is_empty() => MatchResolution::NoMatch,
            [] => MatchResolution::Fuzzy(fuzzy.to_vec()),
            many => MatchResolution::Ambiguous(many.to_vec()),
        }
    }
}
