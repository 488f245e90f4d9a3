//! Step programs
//!
//! A program is an immutable tree of steps built once per workflow type and
//! shared by every object running it. Objects point into the tree with a
//! cursor (`callback_pos`):
//!
//! - a `Sequence` at index `i` contributes `i`, followed by the cursor inside it;
//! - a `Condition` at index `i` contributes `i`, the chosen branch (`0` then,
//!   `1` else), followed by the cursor inside that branch;
//! - the last element is the index of the next step within its block.
//!
//! Because the branch is part of the cursor, resuming never re-evaluates a
//! predicate that was already decided.

use std::fmt;
use std::sync::Arc;

use super::task::{Predicate, Task};

pub const THEN_BRANCH: usize = 0;
pub const ELSE_BRANCH: usize = 1;

#[derive(Clone)]
pub enum Step {
    Task(Arc<dyn Task>),
    Condition {
        predicate: Predicate,
        then_branch: Vec<Step>,
        else_branch: Vec<Step>,
    },
    Sequence(Vec<Step>),
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Task(task) => write!(f, "Task({})", task.name()),
            Step::Condition {
                predicate,
                then_branch,
                else_branch,
            } => f
                .debug_struct("Condition")
                .field("predicate", &predicate.name())
                .field("then", then_branch)
                .field("else", else_branch)
                .finish(),
            Step::Sequence(steps) => f.debug_tuple("Sequence").field(steps).finish(),
        }
    }
}

/* ===================== Builders ===================== */

pub fn task<T: Task + 'static>(task: T) -> Step {
    Step::Task(Arc::new(task))
}

pub fn when(predicate: Predicate, then_branch: Vec<Step>) -> Step {
    Step::Condition {
        predicate,
        then_branch,
        else_branch: Vec::new(),
    }
}

pub fn if_else(predicate: Predicate, then_branch: Vec<Step>, else_branch: Vec<Step>) -> Step {
    Step::Condition {
        predicate,
        then_branch,
        else_branch,
    }
}

pub fn seq(steps: Vec<Step>) -> Step {
    Step::Sequence(steps)
}

/* ===================== Program ===================== */

/// The block that holds the last element of a cursor.
#[derive(Debug)]
pub struct Block<'a> {
    pub steps: &'a [Step],
    /// Cursor elements to drop from the end, once the block is exhausted, to
    /// land on the index of the enclosing step: 0 for the root, 1 inside a
    /// sequence, 2 inside a branch.
    pub span: usize,
}

#[derive(Debug)]
pub struct StepProgram {
    name: String,
    root: Vec<Step>,
}

impl StepProgram {
    pub fn new(name: impl Into<String>, root: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            root,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &[Step] {
        &self.root
    }

    /// Resolve the block holding `cursor`'s last element.
    ///
    /// Returns `None` if the cursor walks through a task or an out-of-range
    /// index. The last element itself may be past the end of its block, which
    /// means the block is exhausted.
    pub fn block_at(&self, cursor: &[usize]) -> Option<Block<'_>> {
        let (_, prefix) = cursor.split_last()?;

        let mut steps: &[Step] = &self.root;
        let mut span = 0;
        let mut i = 0;
        while i < prefix.len() {
            match steps.get(prefix[i])? {
                Step::Sequence(children) => {
                    steps = children;
                    span = 1;
                    i += 1;
                }
                Step::Condition {
                    then_branch,
                    else_branch,
                    ..
                } => {
                    let branch = *prefix.get(i + 1)?;
                    steps = match branch {
                        THEN_BRANCH => then_branch,
                        ELSE_BRANCH => else_branch,
                        _ => return None,
                    };
                    span = 2;
                    i += 2;
                }
                Step::Task(_) => return None,
            }
        }

        Some(Block { steps, span })
    }

    /// Task names in execution order, branches flattened. Used for display.
    pub fn task_names(&self) -> Vec<String> {
        fn walk(steps: &[Step], out: &mut Vec<String>) {
            for step in steps {
                match step {
                    Step::Task(task) => out.push(task.name().to_string()),
                    Step::Condition {
                        then_branch,
                        else_branch,
                        ..
                    } => {
                        walk(then_branch, out);
                        walk(else_branch, out);
                    }
                    Step::Sequence(children) => walk(children, out),
                }
            }
        }

        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out
    }
}
