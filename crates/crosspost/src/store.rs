//! JSON-file submission storage.
//!
//! Holds the pending submissions the daemon loads at startup, mirrors
//! submission changes back to disk by subscribing to each change stream,
//! and removes records the scheduler finished with.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crosspost_core::{CoreError, Submission, SubmissionRecord, SubmissionStore};

pub struct JsonSubmissionStore {
    path: PathBuf,
    records: Mutex<BTreeMap<i64, SubmissionRecord>>,
}

impl JsonSubmissionStore {
    /// Open the store, loading any existing records. A missing file
    /// starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let mut records = BTreeMap::new();

        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let loaded: Vec<SubmissionRecord> =
                    serde_json::from_str(&raw).map_err(|source| CoreError::ConfigParse {
                        path: path.display().to_string(),
                        source,
                    })?;
                for record in loaded {
                    records.insert(record.id, record);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CoreError::ConfigRead {
                    path: path.display().to_string(),
                    source,
                });
            }
        }

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// All stored records, in id order.
    pub async fn pending(&self) -> Vec<SubmissionRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    /// Insert or replace a record and rewrite the file.
    pub async fn upsert(&self, record: SubmissionRecord) {
        let mut records = self.records.lock().await;
        records.insert(record.id, record);
        self.persist(&records).await;
    }

    /// Mirror a submission's changes back to this store until its change
    /// stream closes.
    pub fn watch(self: Arc<Self>, submission: &Arc<Submission>) {
        let Some(mut rx) = submission.subscribe() else {
            return;
        };
        let store = self;
        let submission = Arc::clone(submission);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        debug!(id = submission.id(), field = ?change.field, "persisting change");
                        store.upsert(submission.to_record()).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(id = submission.id(), skipped, "change stream lagged, persisting current state");
                        store.upsert(submission.to_record()).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    async fn persist(&self, records: &BTreeMap<i64, SubmissionRecord>) {
        let list: Vec<&SubmissionRecord> = records.values().collect();
        let serialized = match serde_json::to_string_pretty(&list) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to serialize submission store");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.path, serialized).await {
            warn!(path = %self.path.display(), error = %e, "failed to write submission store");
        }
    }
}

#[async_trait]
impl SubmissionStore for JsonSubmissionStore {
    async fn delete(&self, id: i64) -> Result<(), CoreError> {
        let mut records = self.records.lock().await;
        if records.remove(&id).is_some() {
            self.persist(&records).await;
        }
        Ok(())
    }
}
