//! Collaborator contracts consumed by the scheduler.
//!
//! Network posting, notification rendering, and job storage live behind
//! these traits; the scheduler never talks to a website or a database
//! directly.

use async_trait::async_trait;

use crate::{CoreError, Submission};

/// Successful post result.
#[derive(Debug, Clone, Default)]
pub struct PostSuccess {
    /// URL of the created post, consumed by dependent websites.
    pub source_url: Option<String>,
}

/// Failed post result.
#[derive(Debug, Clone)]
pub struct PostFailure {
    /// Error detail recorded on the submission.
    pub error: String,
    /// Message worth surfacing to the user, if any.
    pub user_message: Option<String>,
}

impl std::fmt::Display for PostFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.error)
    }
}

/// Posts a submission to one website.
///
/// Implementations own authentication, request building, response parsing,
/// and their network timeout.
#[async_trait]
pub trait Poster: Send + Sync {
    async fn post(
        &self,
        website: &str,
        submission: &Submission,
    ) -> Result<PostSuccess, PostFailure>;
}

/// Outcome category of a finished submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Failure,
    Cancelled,
}

/// Surfaces posting outcomes to the user.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Announce a finished submission.
    async fn notify(&self, kind: NotificationKind, submission: &Submission);

    /// Surface a website-specific error message mid-run.
    async fn notify_error(&self, website: &str, message: &str, label: &str);
}

/// Removal interface of the external submission store.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn delete(&self, id: i64) -> Result<(), CoreError>;
}
