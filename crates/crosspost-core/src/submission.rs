//! The submission entity and its change-notification stream.
//!
//! A [`Submission`] is one user submission queued for posting to multiple
//! websites. Every mutation goes through a typed setter that diffs old
//! against new and publishes a [`SubmissionChange`] event; persistence and
//! UI layers subscribe to that stream instead of polling.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Buffered change events per subscriber before lagging kicks in.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Content rating of a submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    #[default]
    General,
    Mature,
    Adult,
    Extreme,
}

/// A file attached to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Original file name, used as the notification label fallback.
    pub name: String,
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Path on disk, if the file has been materialized.
    #[serde(default)]
    pub path: Option<String>,
}

/// Per-website posting options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostOptions {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Website-specific options the scheduler never interprets.
    #[serde(default)]
    pub options: Value,
}

/// The per-destination form data of a submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormData {
    /// Destinations still pending a post, by website id.
    pub websites: Vec<String>,
    /// Login profile to post under.
    #[serde(default)]
    pub login_profile: Option<String>,
    /// Default options applied to every website.
    #[serde(default)]
    pub defaults: PostOptions,
    /// Per-website overrides, keyed by website id.
    #[serde(default)]
    pub overrides: HashMap<String, PostOptions>,
}

/// Posting statistics accumulated while a submission is queued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostStats {
    /// Website ids that succeeded, in completion order.
    pub success: Vec<String>,
    /// Website ids that failed.
    pub fail: Vec<String>,
    /// Destination count at enqueue time, used for progress display.
    pub original_count: usize,
    /// Free-form error strings from failed posts.
    pub errors: Vec<String>,
    /// URLs returned by completed posts, consumed by dependent websites.
    pub source_urls: Vec<String>,
}

/// A change-tracked field of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Rating,
    Schedule,
    FileInfo,
    FormData,
    Problems,
    Queued,
    PostStats,
}

/// A change event published on a submission's change stream.
///
/// `no_update` marks a forced refresh with no value diff, used to trigger
/// persistence after an in-place mutation of a composite field.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionChange {
    pub field: Field,
    pub old: Value,
    pub current: Value,
    pub validate: bool,
    pub no_update: bool,
}

/// Storage representation of a submission, loaded by an external loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub rating: Rating,
    #[serde(default)]
    pub schedule: Option<DateTime<Utc>>,
    #[serde(default)]
    pub file_info: Option<FileInfo>,
    #[serde(default)]
    pub additional_files: Vec<FileInfo>,
    #[serde(default)]
    pub form_data: FormData,
    #[serde(default)]
    pub post_stats: Option<PostStats>,
}

#[derive(Debug, Default)]
struct Fields {
    title: String,
    rating: Rating,
    schedule: Option<DateTime<Utc>>,
    file_info: Option<FileInfo>,
    additional_files: Vec<FileInfo>,
    form_data: FormData,
    problems: Vec<String>,
    queued: bool,
    stats: PostStats,
}

/// One user submission targeted at multiple websites.
///
/// Shared by reference between the scheduler, its decomposition, and UI
/// observers; torn down explicitly once removed from the queue and from
/// storage.
pub struct Submission {
    id: i64,
    fields: RwLock<Fields>,
    changes: Mutex<Option<broadcast::Sender<SubmissionChange>>>,
}

impl Submission {
    /// Build a submission from its storage record.
    ///
    /// Websites that previously failed are restored into the pending list
    /// (recovery after a hard reset), the list is sorted, and
    /// `original_count` is recomputed from the restored list. Recorded
    /// source URLs are carried over.
    pub fn from_record(record: SubmissionRecord) -> Self {
        let mut form_data = record.form_data;
        let mut stats = PostStats::default();

        if let Some(recorded) = record.post_stats {
            for website in &recorded.fail {
                if !form_data.websites.contains(website) {
                    form_data.websites.push(website.clone());
                }
            }
            if !recorded.fail.is_empty() {
                form_data.websites.sort();
            }
            stats.source_urls = recorded.source_urls;
            stats.errors = recorded.errors;
        }

        stats.original_count = form_data.websites.len();

        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            id: record.id,
            fields: RwLock::new(Fields {
                title: record.title.trim().to_string(),
                rating: record.rating,
                schedule: record.schedule,
                file_info: record.file_info,
                additional_files: record.additional_files,
                form_data,
                problems: Vec::new(),
                queued: false,
                stats,
            }),
            changes: Mutex::new(Some(tx)),
        }
    }

    /// Storage representation of the current state.
    pub fn to_record(&self) -> SubmissionRecord {
        let f = self.read();
        SubmissionRecord {
            id: self.id,
            title: f.title.clone(),
            rating: f.rating,
            schedule: f.schedule,
            file_info: f.file_info.clone(),
            additional_files: f.additional_files.clone(),
            form_data: f.form_data.clone(),
            post_stats: Some(f.stats.clone()),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn title(&self) -> String {
        self.read().title.clone()
    }

    /// Label used in notifications: title, or the primary file name.
    pub fn label(&self) -> String {
        let f = self.read();
        if !f.title.is_empty() {
            f.title.clone()
        } else if let Some(ref info) = f.file_info {
            info.name.clone()
        } else {
            "Untitled".to_string()
        }
    }

    pub fn rating(&self) -> Rating {
        self.read().rating
    }

    pub fn schedule(&self) -> Option<DateTime<Utc>> {
        self.read().schedule
    }

    pub fn file_info(&self) -> Option<FileInfo> {
        self.read().file_info.clone()
    }

    pub fn additional_files(&self) -> Vec<FileInfo> {
        self.read().additional_files.clone()
    }

    pub fn form_data(&self) -> FormData {
        self.read().form_data.clone()
    }

    /// Destinations still pending a post.
    pub fn websites(&self) -> Vec<String> {
        self.read().form_data.websites.clone()
    }

    pub fn problems(&self) -> Vec<String> {
        self.read().problems.clone()
    }

    pub fn queued(&self) -> bool {
        self.read().queued
    }

    pub fn stats(&self) -> PostStats {
        self.read().stats.clone()
    }

    pub fn set_title(&self, title: impl Into<String>) {
        let title = title.into().trim().to_string();
        let old = {
            let mut f = self.write();
            std::mem::replace(&mut f.title, title.clone())
        };
        self.emit_diff(Field::Title, &old, &title, false);
    }

    pub fn set_rating(&self, rating: Rating) {
        let old = {
            let mut f = self.write();
            std::mem::replace(&mut f.rating, rating)
        };
        self.emit_diff(Field::Rating, &old, &rating, true);
    }

    pub fn set_schedule(&self, schedule: Option<DateTime<Utc>>) {
        let old = {
            let mut f = self.write();
            std::mem::replace(&mut f.schedule, schedule)
        };
        self.emit_diff(Field::Schedule, &old, &schedule, true);
    }

    pub fn set_file_info(&self, file_info: Option<FileInfo>) {
        let old = {
            let mut f = self.write();
            std::mem::replace(&mut f.file_info, file_info.clone())
        };
        self.emit_diff(Field::FileInfo, &old, &file_info, true);
    }

    pub fn set_form_data(&self, form_data: FormData) {
        let old = {
            let mut f = self.write();
            std::mem::replace(&mut f.form_data, form_data.clone())
        };
        self.emit_diff(Field::FormData, &old, &form_data, true);
    }

    /// Replace the pending website list, publishing a form-data change.
    pub fn set_websites(&self, websites: Vec<String>) {
        let (old, current) = {
            let mut f = self.write();
            let old = f.form_data.clone();
            f.form_data.websites = websites;
            (old, f.form_data.clone())
        };
        self.emit_diff(Field::FormData, &old, &current, true);
    }

    pub fn set_problems(&self, problems: Vec<String>) {
        self.write().problems = problems;
        self.flag_update(Field::Problems);
    }

    pub fn set_queued(&self, queued: bool) {
        self.write().queued = queued;
        self.flag_update(Field::Queued);
    }

    /// Mutate the posting statistics in place without publishing.
    ///
    /// Callers follow up with `flag_update(Field::PostStats)` once a batch
    /// of mutations should be persisted.
    pub fn update_stats(&self, f: impl FnOnce(&mut PostStats)) {
        f(&mut self.write().stats);
    }

    /// Publish a `no_update` event for a field whose value was mutated in
    /// place, forcing downstream persistence/UI refresh.
    pub fn flag_update(&self, field: Field) {
        self.emit(SubmissionChange {
            field,
            old: Value::Null,
            current: Value::Null,
            validate: false,
            no_update: true,
        });
    }

    /// Subscribe to the change stream. Returns `None` after teardown.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<SubmissionChange>> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|tx| tx.subscribe())
    }

    /// Close the change stream. Idempotent; no events are delivered after
    /// teardown.
    pub fn tear_down(&self) {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Fields> {
        self.fields.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Fields> {
        self.fields.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_diff<T: PartialEq + Serialize>(&self, field: Field, old: &T, current: &T, validate: bool) {
        if old == current {
            return;
        }
        self.emit(SubmissionChange {
            field,
            old: serde_json::to_value(old).unwrap_or(Value::Null),
            current: serde_json::to_value(current).unwrap_or(Value::Null),
            validate,
            no_update: false,
        });
    }

    fn emit(&self, change: SubmissionChange) {
        let guard = self.changes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            // Send fails when no subscriber is listening; that is fine.
            let _ = tx.send(change);
        }
    }
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("id", &self.id)
            .field("title", &self.title())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(id: i64, websites: &[&str]) -> SubmissionRecord {
        SubmissionRecord {
            id,
            title: "Test".to_string(),
            rating: Rating::General,
            schedule: None,
            file_info: None,
            additional_files: Vec::new(),
            form_data: FormData {
                websites: websites.iter().map(|w| w.to_string()).collect(),
                ..Default::default()
            },
            post_stats: None,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SubmissionChange>) -> Vec<SubmissionChange> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn setter_publishes_on_diff_only() {
        let submission = Submission::from_record(record(1, &["alpha"]));
        let mut rx = submission.subscribe().unwrap();

        submission.set_title("New Title");
        submission.set_title("New Title"); // same value, no event

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].field, Field::Title);
        assert_eq!(events[0].old, Value::String("Test".to_string()));
        assert_eq!(events[0].current, Value::String("New Title".to_string()));
        assert!(!events[0].no_update);
    }

    #[test]
    fn title_is_trimmed() {
        let submission = Submission::from_record(record(1, &[]));
        submission.set_title("  padded  ");
        assert_eq!(submission.title(), "padded");
    }

    #[test]
    fn flag_update_always_publishes() {
        let submission = Submission::from_record(record(1, &["alpha"]));
        let mut rx = submission.subscribe().unwrap();

        submission.flag_update(Field::PostStats);
        submission.flag_update(Field::PostStats);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.no_update));
        assert!(events.iter().all(|e| e.old == Value::Null));
    }

    #[test]
    fn queued_setter_publishes_no_update_event() {
        let submission = Submission::from_record(record(1, &["alpha"]));
        let mut rx = submission.subscribe().unwrap();

        submission.set_queued(true);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].field, Field::Queued);
        assert!(events[0].no_update);
        assert!(submission.queued());
    }

    #[test]
    fn tear_down_is_idempotent_and_stops_events() {
        let submission = Submission::from_record(record(1, &["alpha"]));
        let mut rx = submission.subscribe().unwrap();

        submission.tear_down();
        submission.tear_down();
        submission.set_title("after teardown");

        assert!(drain(&mut rx).is_empty());
        assert!(submission.subscribe().is_none());
        // The mutation itself still applies; only the stream is closed.
        assert_eq!(submission.title(), "after teardown");
    }

    #[test]
    fn from_record_restores_failed_websites() {
        let mut rec = record(7, &["beta", "delta"]);
        rec.post_stats = Some(PostStats {
            success: vec!["omega".to_string()],
            fail: vec!["alpha".to_string(), "beta".to_string()],
            original_count: 4,
            errors: vec!["boom".to_string()],
            source_urls: vec!["https://example.com/1".to_string()],
        });

        let submission = Submission::from_record(rec);
        // "alpha" restored, "beta" not duplicated, list sorted.
        assert_eq!(submission.websites(), vec!["alpha", "beta", "delta"]);

        let stats = submission.stats();
        assert_eq!(stats.original_count, 3);
        assert!(stats.success.is_empty());
        assert!(stats.fail.is_empty());
        assert_eq!(stats.errors, vec!["boom"]);
        assert_eq!(stats.source_urls, vec!["https://example.com/1"]);
    }

    #[test]
    fn set_websites_publishes_form_data_change() {
        let submission = Submission::from_record(record(1, &["alpha", "beta"]));
        let mut rx = submission.subscribe().unwrap();

        submission.set_websites(vec!["beta".to_string()]);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].field, Field::FormData);
        assert!(events[0].validate);
        assert_eq!(submission.websites(), vec!["beta"]);
    }

    #[test]
    fn update_stats_is_silent_until_flagged() {
        let submission = Submission::from_record(record(1, &["alpha"]));
        let mut rx = submission.subscribe().unwrap();

        submission.update_stats(|stats| stats.success.push("alpha".to_string()));
        assert!(drain(&mut rx).is_empty());

        submission.flag_update(Field::PostStats);
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(submission.stats().success, vec!["alpha"]);
    }
}
