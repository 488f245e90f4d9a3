//! Tasks and predicates the built-in programs are made of

pub mod coordination;
pub mod curation;
pub mod matching;
pub mod predicates;
pub mod record;

pub use coordination::{HandleMatchedHoldingpenWfs, RunNextIfNecessary, SetHoldingpenMatches, WaitForBlockers};
pub use curation::{
    AutoApprove, CloseTicket, CreateCurationTicket, CreateSubmissionTicket, HaltFor, MarkStopped,
    ReplyToSubmitter, SetAcquisitionSource, ValidateRecord,
};
pub use matching::{ApproveExactMatch, CheckPreviouslyRejected, ExactMatch, FuzzyMatch, HaltForMatchApproval};
pub use record::{ApproveUpdate, MergeWithHead, SendRobotUpload, StoreRecord};
