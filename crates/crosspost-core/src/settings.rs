//! Global settings read by the scheduler.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// User-facing settings affecting scheduling policy.
///
/// Read-only to the scheduler; a settings UI mutates them through the
/// shared handle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Settings {
    /// User override for the wait between posts, in minutes. Zero means
    /// no override.
    #[serde(default)]
    pub post_interval_minutes: u64,
    /// Cancel everything queued after a submission that fails.
    #[serde(default)]
    pub clear_queue_on_failure: bool,
    /// Request shutdown once the queue drains.
    #[serde(default)]
    pub auto_close_on_empty_queue: bool,
}

/// Shared, mutable settings handle.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings(Arc<RwLock<Settings>>);

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    /// Current snapshot.
    pub fn get(&self) -> Settings {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, settings: Settings) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_updates() {
        let shared = SharedSettings::default();
        assert_eq!(shared.get().post_interval_minutes, 0);

        shared.set(Settings {
            post_interval_minutes: 3,
            clear_queue_on_failure: true,
            auto_close_on_empty_queue: false,
        });

        let snapshot = shared.get();
        assert_eq!(snapshot.post_interval_minutes, 3);
        assert!(snapshot.clear_queue_on_failure);
    }
}
