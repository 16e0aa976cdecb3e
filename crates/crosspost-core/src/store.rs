//! Last-post-time bookkeeping per website.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tracing::warn;

use crate::CoreError;

/// Durable key-value lookup of the last successful post time per website,
/// in unix milliseconds. Read and written only by the destination limiter.
pub trait PostTimeStore: Send + Sync {
    /// Last recorded post time for a website, if any.
    fn get(&self, website: &str) -> Option<i64>;

    /// Record a post time. Best-effort; implementations log failures
    /// instead of propagating them.
    fn set(&self, website: &str, millis: i64);
}

/// In-memory store, used in tests and as a fallback.
#[derive(Debug, Default)]
pub struct MemoryPostTimeStore {
    times: DashMap<String, i64>,
}

impl MemoryPostTimeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PostTimeStore for MemoryPostTimeStore {
    fn get(&self, website: &str) -> Option<i64> {
        self.times.get(website).map(|t| *t)
    }

    fn set(&self, website: &str, millis: i64) {
        self.times.insert(website.to_string(), millis);
    }
}

/// JSON-file-backed store. The whole map is rewritten on every update;
/// post times change at most once per dispatch per website, so churn is
/// negligible.
#[derive(Debug)]
pub struct FilePostTimeStore {
    path: PathBuf,
    times: DashMap<String, i64>,
}

impl FilePostTimeStore {
    /// Open a store, loading any existing contents. A missing file starts
    /// empty; a corrupt file is logged and starts empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref().to_path_buf();
        let times = DashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, i64>>(&raw) {
                Ok(map) => {
                    for (website, millis) in map {
                        times.insert(website, millis);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring corrupt post-time store");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CoreError::ConfigRead {
                    path: path.display().to_string(),
                    source,
                });
            }
        }

        Ok(Self { path, times })
    }

    fn persist(&self) {
        let map: HashMap<String, i64> = self
            .times
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let serialized = match serde_json::to_string_pretty(&map) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to serialize post-time store");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, serialized) {
            warn!(path = %self.path.display(), error = %e, "failed to write post-time store");
        }
    }
}

impl PostTimeStore for FilePostTimeStore {
    fn get(&self, website: &str) -> Option<i64> {
        self.times.get(website).map(|t| *t)
    }

    fn set(&self, website: &str, millis: i64) {
        self.times.insert(website.to_string(), millis);
        self.persist();
    }
}
