//! The posting queue orchestrator.
//!
//! `PostQueue` owns the FIFO queue of decomposed submissions and the
//! per-website buckets. Every queue mutation — enqueue, dequeue, fill
//! pass, bucket release — runs under one async mutex, so fill passes
//! never interleave. Buckets signal completions over an mpsc channel
//! drained by a background task.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crosspost_core::{
    Field, NotificationKind, Notifier, PostTimeStore, Poster, SharedSettings, Submission,
    SubmissionStore, WebsiteRegistry,
};

use crate::SchedulerError;
use crate::bucket::{Bucket, QueueSignal};
use crate::packet::{PostPacket, SubmissionPacket};

/// Grace period before an auto-close shutdown request, allowing storage
/// writers to flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Buffered queue snapshots per subscriber.
const UPDATE_CHANNEL_CAPACITY: usize = 32;

/// Progress view of one queued submission, published on every queue
/// change for UI display.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueSnapshot {
    pub id: i64,
    pub title: String,
    pub original_count: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub waiting: usize,
    pub cancelled: bool,
}

/// The scheduler orchestrator.
pub struct PostQueue {
    queue: Mutex<Vec<Arc<SubmissionPacket>>>,
    buckets: HashMap<String, Arc<Bucket>>,
    registry: Arc<WebsiteRegistry>,
    settings: SharedSettings,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn SubmissionStore>,
    updates: broadcast::Sender<Vec<QueueSnapshot>>,
    shutdown: watch::Sender<bool>,
}

impl PostQueue {
    /// Build the queue, one bucket per registered website, and start the
    /// signal loop.
    pub fn new(
        registry: Arc<WebsiteRegistry>,
        settings: SharedSettings,
        poster: Arc<dyn Poster>,
        times: Arc<dyn PostTimeStore>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn SubmissionStore>,
        shutdown: watch::Sender<bool>,
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let buckets = registry
            .iter()
            .map(|config| {
                let bucket = Bucket::new(
                    config,
                    Arc::clone(&poster),
                    Arc::clone(&times),
                    settings.clone(),
                    Arc::clone(&notifier),
                    signal_tx.clone(),
                );
                (config.name.clone(), Arc::new(bucket))
            })
            .collect();

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        let queue = Arc::new(Self {
            queue: Mutex::new(Vec::new()),
            buckets,
            registry,
            settings,
            notifier,
            store,
            updates,
            shutdown,
        });

        tokio::spawn(Self::signal_loop(Arc::downgrade(&queue), signal_rx));

        queue
    }

    /// Add a submission to the tail of the queue and start filling
    /// buckets.
    ///
    /// Duplicate websites are dropped with a warning (they indicate an
    /// upstream bug); statistics are reset for the new run.
    pub async fn enqueue(&self, submission: Arc<Submission>) -> Result<(), SchedulerError> {
        let mut queue = self.queue.lock().await;

        if queue.iter().any(|sp| sp.id() == submission.id()) {
            return Err(SchedulerError::AlreadyQueued(submission.id()));
        }

        let websites = submission.websites();
        for website in &websites {
            if !self.registry.contains(website) {
                return Err(SchedulerError::UnknownWebsite {
                    id: submission.id(),
                    website: website.clone(),
                });
            }
        }

        let mut deduped: Vec<String> = Vec::with_capacity(websites.len());
        for website in websites {
            if deduped.contains(&website) {
                warn!(id = submission.id(), website = %website, "dropping duplicate website");
            } else {
                deduped.push(website);
            }
        }

        let count = deduped.len();
        submission.set_websites(deduped);
        submission.update_stats(|stats| {
            stats.original_count = count;
            stats.success.clear();
            stats.fail.clear();
        });
        submission.flag_update(Field::PostStats);

        let sp = Arc::new(SubmissionPacket::new(
            Arc::clone(&submission),
            &self.registry,
        ));
        submission.set_queued(true);
        queue.push(sp);
        info!(id = submission.id(), websites = count, "submission enqueued");

        self.fill(&queue);
        self.publish(&queue);
        Ok(())
    }

    /// Remove a submission from the queue.
    ///
    /// Its pending website list is restored to the unposted set (including
    /// failures) and every unfinished packet is cancelled. `cancelled`
    /// selects the cancellation notification wording downstream.
    pub async fn dequeue(&self, id: i64, cancelled: bool) {
        let mut queue = self.queue.lock().await;
        self.dequeue_locked(&mut queue, id, cancelled);
        self.publish(&queue);
    }

    /// Decomposition for a queued submission, if present.
    pub async fn decomposition_for(&self, id: i64) -> Option<Arc<SubmissionPacket>> {
        self.queue
            .lock()
            .await
            .iter()
            .find(|sp| sp.id() == id)
            .cloned()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Queue-state stream for progress display.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<QueueSnapshot>> {
        self.updates.subscribe()
    }

    fn dequeue_locked(
        &self,
        queue: &mut Vec<Arc<SubmissionPacket>>,
        id: i64,
        cancelled: bool,
    ) -> Option<Arc<SubmissionPacket>> {
        let index = queue.iter().position(|sp| sp.id() == id)?;
        let sp = queue.remove(index);
        let submission = sp.submission();

        submission.set_queued(false);

        let mut websites = sp.unposted_websites();
        websites.sort();
        websites.dedup();
        submission.set_websites(websites);

        if cancelled {
            sp.cancel();
        } else {
            sp.clean_up();
        }

        info!(id, cancelled, "submission dequeued");
        Some(sp)
    }

    /// Hand every currently eligible packet to its bucket.
    ///
    /// For each website the earliest-queued decomposition with a Waiting
    /// packet wins, so a later submission never overtakes an earlier one
    /// on the same website. Eligibility is re-checked per packet at
    /// submit time; the whole pass runs under the queue lock.
    fn fill(&self, queue: &[Arc<SubmissionPacket>]) {
        let mut schedule: BTreeMap<String, (Arc<SubmissionPacket>, Arc<PostPacket>)> =
            BTreeMap::new();

        for sp in queue {
            for packet in sp.waiting_packets() {
                schedule
                    .entry(packet.website().to_string())
                    .or_insert_with(|| (Arc::clone(sp), packet));
            }
        }

        for (website, (sp, packet)) in schedule {
            if !sp.can_dispatch(&packet) {
                continue;
            }
            if let Some(bucket) = self.buckets.get(&website) {
                Arc::clone(bucket).submit(packet);
            }
        }
    }

    fn publish(&self, queue: &[Arc<SubmissionPacket>]) {
        let snapshots = queue
            .iter()
            .map(|sp| {
                let stats = sp.submission().stats();
                QueueSnapshot {
                    id: sp.id(),
                    title: sp.submission().title(),
                    original_count: stats.original_count,
                    succeeded: stats.success.len(),
                    failed: stats.fail.len(),
                    waiting: sp.waiting_packets().len(),
                    cancelled: sp.was_cancelled(),
                }
            })
            .collect();
        // No subscribers is fine.
        let _ = self.updates.send(snapshots);
    }

    async fn signal_loop(
        queue: std::sync::Weak<Self>,
        mut signals: mpsc::UnboundedReceiver<QueueSignal>,
    ) {
        while let Some(signal) = signals.recv().await {
            let Some(queue) = queue.upgrade() else { break };
            match signal {
                QueueSignal::PacketFailed(id) => queue.handle_packet_failed(id).await,
                QueueSignal::BucketFree(packet) => queue.handle_bucket_free(packet).await,
            }
        }
        debug!("queue signal loop stopped");
    }

    /// A bucket released a packet: finalize its submission if every unit
    /// is terminal, then keep the queue moving. This is the sole re-entry
    /// point after the initial fill at enqueue.
    async fn handle_bucket_free(self: Arc<Self>, packet: Arc<PostPacket>) {
        let finished = {
            let mut queue = self.queue.lock().await;

            let candidate = queue.iter().find(|sp| sp.id() == packet.id()).cloned();
            let finished = match candidate {
                Some(sp) if sp.next_waiting().is_none() && sp.is_completable() => {
                    self.dequeue_locked(&mut queue, sp.id(), false);
                    Some(sp)
                }
                _ => None,
            };

            self.fill(&queue);
            self.publish(&queue);
            finished
        };

        if let Some(sp) = finished {
            self.finalize(sp).await;
        }
    }

    /// Notify about a finished submission and clean it up if nothing is
    /// left for the user.
    async fn finalize(self: Arc<Self>, sp: Arc<SubmissionPacket>) {
        let submission = Arc::clone(sp.submission());
        let stats = submission.stats();

        let kind = if sp.was_cancelled() {
            NotificationKind::Cancelled
        } else if stats.fail.is_empty() {
            NotificationKind::Success
        } else {
            NotificationKind::Failure
        };
        self.notifier.notify(kind, &submission).await;

        if submission.websites().is_empty() && stats.fail.is_empty() {
            // Fully posted: the record has no remaining purpose.
            submission.tear_down();
            if let Err(e) = self.store.delete(submission.id()).await {
                warn!(id = submission.id(), error = %e, "failed to delete finished submission");
            }
            info!(id = submission.id(), "submission fully posted");
        } else {
            info!(
                id = submission.id(),
                pending = submission.websites().len(),
                failed = stats.fail.len(),
                "submission finished with work left for the user"
            );
        }

        self.maybe_schedule_auto_close().await;
    }

    /// When the queue drained and the auto-close policy is on, request a
    /// shutdown after a grace period, re-checking both conditions first.
    async fn maybe_schedule_auto_close(self: Arc<Self>) {
        if !self.settings.get().auto_close_on_empty_queue {
            return;
        }
        if !self.queue.lock().await.is_empty() {
            return;
        }

        tokio::spawn(async move {
            sleep(SHUTDOWN_GRACE).await;
            if !self.settings.get().auto_close_on_empty_queue {
                return;
            }
            if !self.queue.lock().await.is_empty() {
                return;
            }
            info!("queue drained, requesting shutdown");
            let _ = self.shutdown.send(true);
        });
    }

    /// A packet failed: under the clear-queue policy, cancel everything
    /// queued after the failed submission.
    async fn handle_packet_failed(&self, id: i64) {
        if !self.settings.get().clear_queue_on_failure {
            return;
        }

        let cancelled: Vec<Arc<SubmissionPacket>> = {
            let mut queue = self.queue.lock().await;
            let Some(index) = queue.iter().position(|sp| sp.id() == id) else {
                return;
            };

            let ids: Vec<i64> = queue[index + 1..].iter().map(|sp| sp.id()).collect();
            let mut cancelled = Vec::with_capacity(ids.len());
            for cancel_id in ids {
                if let Some(sp) = self.dequeue_locked(&mut queue, cancel_id, true) {
                    cancelled.push(sp);
                }
            }
            self.publish(&queue);
            cancelled
        };

        for sp in cancelled {
            warn!(id = sp.id(), "cancelled by clear-queue-on-failure policy");
            self.notifier
                .notify(NotificationKind::Cancelled, sp.submission())
                .await;
        }
    }
}
