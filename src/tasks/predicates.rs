//! Branch conditions of the article program

use serde_json::Value as JsonValue;

use crate::engine::Predicate;
use crate::matching::criteria::values_at;
use crate::types::{Mark, WorkflowObject};

/// arXiv categories listed on the record.
pub fn arxiv_categories(data: &JsonValue) -> Vec<String> {
    values_at(data, "arxiv_eprints.categories")
        .into_iter()
        .filter_map(JsonValue::as_str)
        .map(|s| s.to_string())
        .collect()
}

pub fn in_core_categories(data: &JsonValue, core_categories: &[String]) -> bool {
    arxiv_categories(data)
        .iter()
        .any(|c| core_categories.iter().any(|core| core.eq_ignore_ascii_case(c)))
}

pub fn is_arxiv(obj: &WorkflowObject) -> bool {
    obj.source()
        .map(|s| s.eq_ignore_ascii_case("arxiv"))
        .unwrap_or(false)
}

pub fn is_submission() -> Predicate {
    Predicate::new("is_submission", |obj| obj.extra_data.is_marked(Mark::IsSubmission))
}

pub fn has_holdingpen_matches() -> Predicate {
    Predicate::new("has_holdingpen_matches", |obj| {
        !obj.extra_data.holdingpen_matches.is_empty()
    })
}

pub fn has_several_exact_matches() -> Predicate {
    Predicate::new("has_several_exact_matches", |obj| {
        obj.extra_data.matches.exact.len() > 1
    })
}

pub fn has_single_exact_match() -> Predicate {
    Predicate::new("has_single_exact_match", |obj| {
        obj.extra_data.matches.exact.len() == 1
    })
}

pub fn has_fuzzy_matches() -> Predicate {
    Predicate::new("has_fuzzy_matches", |obj| {
        !obj.extra_data.matches.fuzzy.is_empty()
    })
}

pub fn is_update() -> Predicate {
    Predicate::new("is_update", |obj| {
        obj.extra_data.is_marked(Mark::IsUpdate) && obj.extra_data.matches.approved.is_some()
    })
}

pub fn has_conflicts() -> Predicate {
    Predicate::new("has_conflicts", |obj| !obj.extra_data.conflicts.is_empty())
}

/// The update brings a core category to a head that was not core.
pub fn gains_core(core_categories: Vec<String>) -> Predicate {
    Predicate::new("gains_core", move |obj| {
        let head_core = obj
            .extra_data
            .extensions
            .get("head_core")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        !head_core && in_core_categories(&obj.data, &core_categories)
    })
}

/// arXiv records in a core category skip the HEP approval when enabled.
pub fn should_auto_approve(enabled: bool, core_categories: Vec<String>) -> Predicate {
    Predicate::new("should_auto_approve", move |obj| {
        enabled && is_arxiv(obj) && in_core_categories(&obj.data, &core_categories)
    })
}

/// A curator or a rule already answered approve/reject.
pub fn is_decided() -> Predicate {
    Predicate::new("is_decided", |obj| obj.extra_data.flag(Mark::Approved).is_some())
}

pub fn is_approved() -> Predicate {
    Predicate::new("is_approved", |obj| obj.extra_data.is_marked(Mark::Approved))
}

pub fn is_core() -> Predicate {
    Predicate::new("is_core", |obj| obj.extra_data.is_marked(Mark::Core))
}
