//! Log-backed notifier.
//!
//! Desktop notification rendering is an external concern; the daemon
//! surfaces outcomes through structured log lines instead.

use async_trait::async_trait;
use tracing::{error, info, warn};

use crosspost_core::{NotificationKind, Notifier, Submission};

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, kind: NotificationKind, submission: &Submission) {
        let label = submission.label();
        match kind {
            NotificationKind::Success => {
                info!(id = submission.id(), %label, "posted everywhere");
            }
            NotificationKind::Failure => {
                let failed = submission.stats().fail.join(", ");
                warn!(id = submission.id(), %label, failed = %failed, "finished with failures");
            }
            NotificationKind::Cancelled => {
                warn!(id = submission.id(), %label, "cancelled");
            }
        }
    }

    async fn notify_error(&self, website: &str, message: &str, label: &str) {
        error!(website, %label, "{}", message);
    }
}
