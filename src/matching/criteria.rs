//! Strong-identifier criteria extracted from records
//!
//! Paths are dotted (`arxiv_eprints.value`). Arrays met along a path are
//! flattened, so a path yields every value reachable under it.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub path: String,
    pub value: JsonValue,
}

impl Criterion {
    pub fn new(path: impl Into<String>, value: JsonValue) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }

    pub fn matches(&self, data: &JsonValue) -> bool {
        values_at(data, &self.path)
            .into_iter()
            .any(|v| v == &self.value)
    }

    /// SQL/JSON path filter for Postgres `jsonb_path_exists`, comparing with `$v`.
    ///
    /// Lax mode unwraps arrays on member access, matching `values_at`.
    pub fn json_path(&self) -> String {
        let members: Vec<String> = self
            .path
            .split('.')
            .map(|segment| format!("\"{}\"", segment.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("$.{} ? (@ == $v)", members.join("."))
    }
}

/// Every value reachable under `path`, with arrays flattened.
pub fn values_at<'a>(data: &'a JsonValue, path: &str) -> Vec<&'a JsonValue> {
    let mut current = vec![data];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            collect_member(value, segment, &mut next);
        }
        current = next;
    }

    let mut flattened = Vec::new();
    for value in current {
        flatten_into(value, &mut flattened);
    }
    flattened
}

fn collect_member<'a>(value: &'a JsonValue, segment: &str, out: &mut Vec<&'a JsonValue>) {
    match value {
        JsonValue::Object(map) => {
            if let Some(member) = map.get(segment) {
                out.push(member);
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                collect_member(item, segment, out);
            }
        }
        _ => {}
    }
}

fn flatten_into<'a>(value: &'a JsonValue, out: &mut Vec<&'a JsonValue>) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        JsonValue::Null => {}
        other => out.push(other),
    }
}

/// Criteria for every non-empty scalar found under the configured paths.
pub fn criteria_for(data: &JsonValue, fields: &[String]) -> Vec<Criterion> {
    let mut criteria: Vec<Criterion> = Vec::new();
    for field in fields {
        for value in values_at(data, field) {
            let usable = match value {
                JsonValue::String(s) => !s.trim().is_empty(),
                JsonValue::Number(_) | JsonValue::Bool(_) => true,
                _ => false,
            };
            if !usable {
                continue;
            }
            let criterion = Criterion::new(field.clone(), value.clone());
            if !criteria.contains(&criterion) {
                criteria.push(criterion);
            }
        }
    }
    criteria
}

pub fn matches_any(criteria: &[Criterion], data: &JsonValue) -> bool {
    criteria.iter().any(|c| c.matches(data))
}
