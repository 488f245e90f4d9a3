//! The literature ingestion program
//!
//! The main sequence runs intake, holding-pen coordination, matching and the
//! curator decision, then stores or rejects the record. A `Skip` anywhere
//! directly in it ends processing early; releasing blocked objects always
//! runs afterwards.

use crate::config::Config;
use crate::engine::{if_else, seq, task, when, RetryPolicy, StepProgram, TaskExt};
use crate::tasks::predicates::{
    gains_core, has_conflicts, has_fuzzy_matches, has_holdingpen_matches,
    has_several_exact_matches, has_single_exact_match, is_approved, is_core, is_decided,
    is_submission, is_update, should_auto_approve,
};
use crate::tasks::{
    ApproveExactMatch, ApproveUpdate, AutoApprove, CheckPreviouslyRejected, CloseTicket,
    CreateCurationTicket, CreateSubmissionTicket, ExactMatch, FuzzyMatch, HaltFor,
    HaltForMatchApproval, HandleMatchedHoldingpenWfs, MergeWithHead, ReplyToSubmitter,
    RunNextIfNecessary, SendRobotUpload, SetAcquisitionSource, SetHoldingpenMatches,
    StoreRecord, ValidateRecord, WaitForBlockers,
};

pub const ARTICLE_WORKFLOW: &str = "article";

pub fn article_program(config: &Config) -> StepProgram {
    let ticketing = &config.ticketing;
    let ticket_retry = RetryPolicy::from(&ticketing.retry);
    let upload_retry = RetryPolicy::from(&config.upload.retry);
    let core_categories = config.workflow.core_categories.clone();
    let index_timeout = config.matching.index_timeout();

    let matching = vec![
        task(ExactMatch.with_timeout(index_timeout)),
        if_else(
            has_several_exact_matches(),
            vec![task(HaltForMatchApproval)],
            vec![if_else(
                has_single_exact_match(),
                vec![task(ApproveExactMatch)],
                vec![
                    task(FuzzyMatch.with_timeout(index_timeout)),
                    when(has_fuzzy_matches(), vec![task(HaltForMatchApproval)]),
                ],
            )],
        ),
    ];

    let update = vec![
        task(MergeWithHead.logged().with_timeout(index_timeout)),
        when(has_conflicts(), vec![task(HaltFor::merge_approval())]),
        when(
            gains_core(core_categories.clone()),
            vec![task(HaltFor::core_approval())],
        ),
        task(ApproveUpdate),
    ];

    let new_record = vec![
        when(
            should_auto_approve(config.workflow.auto_approve, core_categories),
            vec![task(AutoApprove), task(HaltFor::core_selection())],
        ),
        when(is_decided().not(), vec![task(HaltFor::hep_approval())]),
    ];

    let accepted = vec![
        task(StoreRecord.logged().with_timeout(index_timeout)),
        when(
            is_core(),
            vec![task(
                CreateCurationTicket
                    .with_timeout(ticketing.timeout())
                    .with_retry(ticket_retry.clone())
                    .do_not_repeat("curation_ticket"),
            )],
        ),
        task(
            ReplyToSubmitter
                .with_timeout(ticketing.timeout())
                .with_retry(ticket_retry.clone())
                .do_not_repeat("reply_accepted"),
        ),
        task(
            CloseTicket
                .with_timeout(ticketing.timeout())
                .with_retry(ticket_retry.clone())
                .do_not_repeat("close_submission_ticket"),
        ),
        task(
            SendRobotUpload
                .with_timeout(config.upload.timeout())
                .with_retry(upload_retry),
        ),
    ];

    let rejected = vec![
        task(
            ReplyToSubmitter
                .with_timeout(ticketing.timeout())
                .with_retry(ticket_retry.clone())
                .do_not_repeat("reply_rejected"),
        ),
        task(
            CloseTicket
                .with_timeout(ticketing.timeout())
                .with_retry(ticket_retry.clone())
                .do_not_repeat("close_submission_ticket"),
        ),
    ];

    let main = vec![
        task(SetAcquisitionSource),
        when(
            is_submission(),
            vec![task(
                CreateSubmissionTicket
                    .with_timeout(ticketing.timeout())
                    .with_retry(ticket_retry)
                    .do_not_repeat("submission_ticket"),
            )],
        ),
        task(ValidateRecord),
        task(SetHoldingpenMatches.with_timeout(index_timeout)),
        when(
            has_holdingpen_matches(),
            vec![task(HandleMatchedHoldingpenWfs)],
        ),
        task(WaitForBlockers),
        task(CheckPreviouslyRejected.with_timeout(index_timeout)),
        seq(matching),
        if_else(is_update(), update, new_record),
        if_else(is_approved(), accepted, rejected),
    ];

    StepProgram::new(
        ARTICLE_WORKFLOW,
        vec![seq(main), task(RunNextIfNecessary)],
    )
}
