use serde_json::Value as JsonValue;

use crate::matching::criteria::values_at;

/// Checks a record before it enters matching. Returns human-readable problems.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, data: &JsonValue) -> Vec<String>;
}

/// Structural checks only: required fields present, identifiers well typed.
#[derive(Debug, Clone)]
pub struct RequiredFieldsValidator {
    required: Vec<String>,
}

impl RequiredFieldsValidator {
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }
}

impl RecordValidator for RequiredFieldsValidator {
    fn validate(&self, data: &JsonValue) -> Vec<String> {
        let mut errors = Vec::new();

        if !data.is_object() {
            errors.push("record must be a JSON object".to_string());
            return errors;
        }

        for field in &self.required {
            let present = values_at(data, field).into_iter().any(|v| match v {
                JsonValue::String(s) => !s.trim().is_empty(),
                JsonValue::Object(map) => !map.is_empty(),
                _ => true,
            });
            if !present {
                errors.push(format!("'{}' is a required property", field));
            }
        }

        if let Some(cn) = data.get("control_number") {
            if !cn.is_i64() {
                errors.push(format!("control_number must be an integer, got {}", cn));
            }
        }

        for eprint in values_at(data, "arxiv_eprints.value") {
            if !eprint.is_string() {
                errors.push(format!("arxiv_eprints.value must be a string, got {}", eprint));
            }
        }

        errors
    }
}
