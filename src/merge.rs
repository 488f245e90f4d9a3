//! Merging an incoming update into the stored head record
//!
//! Values only the update carries are taken. Equal values are kept. Objects
//! are merged key by key. For anything else that differs, an update from the
//! head's own source wins; from another source, lists are unioned and scalars
//! keep the head's value and produce a [`Conflict`] for a curator.
//!
//! `control_number` always comes from the head, `acquisition_source` from
//! the update.

use serde_json::{Map, Value as JsonValue};

use crate::types::{Conflict, ConflictOp};

/// Top-level keys set after the merge, never compared.
const MANAGED_KEYS: [&str; 2] = ["control_number", "acquisition_source"];

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub data: JsonValue,
    pub conflicts: Vec<Conflict>,
}

pub fn merge_records(
    head: &JsonValue,
    update: &JsonValue,
    head_source: &str,
    update_source: &str,
) -> MergeResult {
    let same_source = head_source.eq_ignore_ascii_case(update_source);
    let mut conflicts = Vec::new();

    let mut data = match (head, update) {
        (JsonValue::Object(h), JsonValue::Object(u)) => {
            let u: Map<String, JsonValue> = u
                .iter()
                .filter(|(key, _)| !MANAGED_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            JsonValue::Object(merge_objects("", h, &u, same_source, &mut conflicts))
        }
        _ => merge_value("", head, update, same_source, &mut conflicts),
    };

    if let JsonValue::Object(map) = &mut data {
        match head.get("control_number") {
            Some(cn) => {
                map.insert("control_number".to_string(), cn.clone());
            }
            None => {
                map.remove("control_number");
            }
        }
        if let Some(source) = update.get("acquisition_source") {
            map.insert("acquisition_source".to_string(), source.clone());
        }
    }

    MergeResult { data, conflicts }
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn merge_value(
    path: &str,
    head: &JsonValue,
    update: &JsonValue,
    same_source: bool,
    conflicts: &mut Vec<Conflict>,
) -> JsonValue {
    if head == update {
        return head.clone();
    }

    match (head, update) {
        (JsonValue::Object(h), JsonValue::Object(u)) => {
            JsonValue::Object(merge_objects(path, h, u, same_source, conflicts))
        }
        (_, JsonValue::Null) => {
            if same_source {
                JsonValue::Null
            } else {
                conflicts.push(Conflict {
                    path: path.to_string(),
                    op: ConflictOp::Remove,
                    head: head.clone(),
                    update: JsonValue::Null,
                });
                head.clone()
            }
        }
        (JsonValue::Array(h), JsonValue::Array(u)) => {
            if same_source {
                update.clone()
            } else {
                let mut union = h.clone();
                for item in u {
                    if !union.contains(item) {
                        union.push(item.clone());
                    }
                }
                JsonValue::Array(union)
            }
        }
        _ => {
            if same_source {
                update.clone()
            } else {
                conflicts.push(Conflict {
                    path: path.to_string(),
                    op: ConflictOp::Replace,
                    head: head.clone(),
                    update: update.clone(),
                });
                head.clone()
            }
        }
    }
}

fn merge_objects(
    path: &str,
    head: &Map<String, JsonValue>,
    update: &Map<String, JsonValue>,
    same_source: bool,
    conflicts: &mut Vec<Conflict>,
) -> Map<String, JsonValue> {
    let mut merged = head.clone();
    for (key, value) in update {
        let merged_value = match head.get(key) {
            None => value.clone(),
            Some(existing) => merge_value(&child_path(path, key), existing, value, same_source, conflicts),
        };
        if merged_value.is_null() && same_source {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), merged_value);
        }
    }
    merged
}
