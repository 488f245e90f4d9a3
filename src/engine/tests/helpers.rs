//! Test helpers for engine tests
//!
//! Programs are built from `fn_task` closures that append their name to
//! `data.trace`, so a test can read back exactly which tasks ran and in what
//! order, across halts and resumes.

use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::engine::{fn_task, Engine, InMemoryCollaborators, Outcome, Predicate, Step, StepProgram, task};
use crate::types::{CreateObjectParams, HaltAction, WorkflowObject};

pub const TEST_WORKFLOW: &str = "test";

/// Engine over in-memory collaborators with `program` registered.
pub fn engine_with(program: StepProgram) -> (Engine, InMemoryCollaborators) {
    let collaborators = InMemoryCollaborators::new();
    let mut engine = Engine::new(collaborators.environment(Config::default()));
    engine.register(program);
    (engine, collaborators)
}

pub fn params() -> CreateObjectParams {
    CreateObjectParams {
        workflow_name: TEST_WORKFLOW.to_string(),
        data: json!({"trace": []}),
        ..Default::default()
    }
}

fn push_trace(obj: &mut WorkflowObject, name: &str) {
    match obj.data.get_mut("trace").and_then(JsonValue::as_array_mut) {
        Some(trace) => trace.push(json!(name)),
        None => obj.data["trace"] = json!([name]),
    }
}

/// Names of the tasks that ran, in order.
pub fn trace(obj: &WorkflowObject) -> Vec<String> {
    obj.data["trace"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// A task that records its name and continues.
pub fn step(name: &'static str) -> Step {
    task(fn_task(name, move |obj| {
        push_trace(obj, name);
        Ok(Outcome::Continue)
    }))
}

/// A task that records its name, then halts.
pub fn halting(name: &'static str, action: HaltAction) -> Step {
    task(fn_task(name, move |obj| {
        push_trace(obj, name);
        Ok(Outcome::halt(action, format!("{} needs an answer", name)))
    }))
}

/// A task that records its name and returns `outcome`.
pub fn returning(name: &'static str, outcome: fn() -> Outcome) -> Step {
    task(fn_task(name, move |obj| {
        push_trace(obj, name);
        Ok(outcome())
    }))
}

/// Predicate on `data.flag`, counting every evaluation.
pub fn counted_flag(counter: Arc<AtomicUsize>) -> Predicate {
    Predicate::new("flag_set", move |obj| {
        counter.fetch_add(1, Ordering::SeqCst);
        obj.data.get("flag").and_then(JsonValue::as_bool).unwrap_or(false)
    })
}
