//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Submission is already in the posting queue.
    #[error("submission {0} is already queued")]
    AlreadyQueued(i64),

    /// Submission targets a website with no registry entry.
    #[error("submission {id} targets unknown website: {website}")]
    UnknownWebsite { id: i64, website: String },
}
