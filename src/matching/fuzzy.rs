//! Token-similarity scoring for fuzzy duplicate detection
//!
//! Each field is reduced to a token set and compared with Jaccard similarity.
//! Field weights are renormalized over the fields both records carry, so a
//! record without an abstract is not penalized for it.

use serde_json::{json, Value as JsonValue};
use std::collections::BTreeSet;

use super::criteria::values_at;
use crate::external::IndexedRecord;
use crate::types::FuzzyCandidate;

const TITLE_WEIGHT: f64 = 0.5;
const AUTHORS_WEIGHT: f64 = 0.3;
const ABSTRACT_WEIGHT: f64 = 0.2;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "at", "by", "for", "from", "in", "of", "on", "or", "the", "to", "with",
];

pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn tokens_under(data: &JsonValue, path: &str) -> BTreeSet<String> {
    values_at(data, path)
        .into_iter()
        .filter_map(JsonValue::as_str)
        .flat_map(tokenize)
        .collect()
}

pub fn title_tokens(data: &JsonValue) -> BTreeSet<String> {
    tokens_under(data, "titles.title")
}

pub fn abstract_tokens(data: &JsonValue) -> BTreeSet<String> {
    tokens_under(data, "abstracts.value")
}

/// Lowercased family names. `"Smith, J."` and `"J. Smith"` both yield `smith`.
pub fn author_names(data: &JsonValue) -> BTreeSet<String> {
    values_at(data, "authors.full_name")
        .into_iter()
        .filter_map(JsonValue::as_str)
        .filter_map(|name| {
            let family = match name.split_once(',') {
                Some((last, _)) => last.trim(),
                None => name.split_whitespace().last().unwrap_or(""),
            };
            let family = family.to_lowercase();
            if family.is_empty() {
                None
            } else {
                Some(family)
            }
        })
        .collect()
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub total: f64,
    pub title: Option<f64>,
    pub authors: Option<f64>,
    pub abstract_: Option<f64>,
}

impl Score {
    pub fn fields(&self) -> JsonValue {
        json!({
            "title": self.title,
            "authors": self.authors,
            "abstract": self.abstract_,
        })
    }
}

pub fn score(record: &JsonValue, candidate: &JsonValue) -> Score {
    let mut weighted = 0.0;
    let mut weights = 0.0;

    let mut field = |a: BTreeSet<String>, b: BTreeSet<String>, weight: f64| -> Option<f64> {
        if a.is_empty() || b.is_empty() {
            return None;
        }
        let similarity = jaccard(&a, &b);
        weighted += similarity * weight;
        weights += weight;
        Some(similarity)
    };

    let title = field(title_tokens(record), title_tokens(candidate), TITLE_WEIGHT);
    let authors = field(author_names(record), author_names(candidate), AUTHORS_WEIGHT);
    let abstract_ = field(abstract_tokens(record), abstract_tokens(candidate), ABSTRACT_WEIGHT);

    let total = if weights > 0.0 { weighted / weights } else { 0.0 };
    Score {
        total,
        title,
        authors,
        abstract_,
    }
}

/// Score, threshold and rank candidates. Ties break on the lower control number.
pub fn rank(
    record: &JsonValue,
    candidates: &[IndexedRecord],
    threshold: f64,
    limit: usize,
) -> Vec<FuzzyCandidate> {
    let mut ranked: Vec<FuzzyCandidate> = candidates
        .iter()
        .filter_map(|candidate| {
            let s = score(record, &candidate.data);
            if s.total >= threshold && s.total > 0.0 {
                Some(FuzzyCandidate {
                    control_number: candidate.control_number,
                    score: s.total,
                    fields: s.fields(),
                })
            } else {
                None
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.control_number.cmp(&b.control_number))
    });
    ranked.dedup_by_key(|c| c.control_number);
    ranked.truncate(limit);
    ranked
}
