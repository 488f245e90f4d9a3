//! Program run on an object superseded by another one from the same source

use crate::config::Config;
use crate::engine::{task, RetryPolicy, StepProgram, TaskExt};
use crate::tasks::{CloseTicket, MarkStopped, RunNextIfNecessary};

pub const STOP_WORKFLOW: &str = "stop";

pub fn stop_program(config: &Config) -> StepProgram {
    let ticketing = &config.ticketing;
    StepProgram::new(
        STOP_WORKFLOW,
        vec![
            task(MarkStopped),
            task(
                CloseTicket
                    .with_timeout(ticketing.timeout())
                    .with_retry(RetryPolicy::from(&ticketing.retry))
                    .do_not_repeat("close_ticket"),
            ),
            task(RunNextIfNecessary),
        ],
    )
}
