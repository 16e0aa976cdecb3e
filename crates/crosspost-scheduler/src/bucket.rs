//! Per-website rate limiting.
//!
//! One `Bucket` exists per website for the life of the process. It holds
//! at most one packet at a time, spaces dispatches by the website's
//! minimum wait interval, and reports releases back to the orchestrator
//! over a signal channel.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, warn};

use crosspost_core::{
    Field, Notifier, PostTimeStore, Poster, SharedSettings, WebsiteConfig,
};

use crate::packet::{PacketStatus, PostPacket};

/// Floor on every computed dispatch delay, in milliseconds.
const MIN_POST_DELAY_MS: u64 = 5_000;

/// Signals sent from a bucket to the orchestrator.
#[derive(Debug)]
pub(crate) enum QueueSignal {
    /// The bucket released its packet (posted, failed, or cancelled).
    BucketFree(Arc<PostPacket>),
    /// A packet resolved to Failed; drives the clear-queue policy.
    PacketFailed(i64),
}

#[derive(Debug, Default)]
struct BucketState {
    current: Option<Arc<PostPacket>>,
    /// Armed after the first completed dispatch; the next wait computation
    /// may then use the user's override interval.
    use_override_interval: bool,
}

/// Single-slot dispatcher for one website.
pub(crate) struct Bucket {
    website: String,
    min_interval_ms: u64,
    poster: Arc<dyn Poster>,
    times: Arc<dyn PostTimeStore>,
    settings: SharedSettings,
    notifier: Arc<dyn Notifier>,
    signals: mpsc::UnboundedSender<QueueSignal>,
    state: Mutex<BucketState>,
}

impl Bucket {
    pub(crate) fn new(
        config: &WebsiteConfig,
        poster: Arc<dyn Poster>,
        times: Arc<dyn PostTimeStore>,
        settings: SharedSettings,
        notifier: Arc<dyn Notifier>,
        signals: mpsc::UnboundedSender<QueueSignal>,
    ) -> Self {
        Self {
            website: config.name.clone(),
            min_interval_ms: config.post_wait_interval_ms,
            poster,
            times,
            settings,
            notifier,
            signals,
            state: Mutex::new(BucketState::default()),
        }
    }

    /// Offer a packet to this bucket.
    ///
    /// Ignored while a packet is already held. A packet that arrives
    /// already cancelled is released immediately without dispatching.
    pub(crate) fn submit(self: Arc<Self>, packet: Arc<PostPacket>) {
        if packet.is_cancelled() {
            self.signal(QueueSignal::BucketFree(packet));
            return;
        }

        let wait_ms = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.current.is_some() {
                return;
            }
            state.current = Some(Arc::clone(&packet));

            let use_override = state.use_override_interval;
            state.use_override_interval = false;

            let now_ms = Utc::now().timestamp_millis();
            let elapsed_ms = now_ms - self.times.get(&self.website).unwrap_or(0);
            let override_ms = self.settings.get().post_interval_minutes * 60_000;
            wait_millis(elapsed_ms, self.min_interval_ms, override_ms, use_override)
        };

        packet.set_posting_time(Utc::now() + chrono::Duration::milliseconds(wait_ms as i64));
        debug!(
            website = %self.website,
            id = packet.id(),
            wait_ms,
            "packet accepted, dispatch timer armed"
        );

        tokio::spawn(async move {
            self.dispatch_after(packet, wait_ms).await;
        });
    }

    /// Wait out the dispatch delay, bailing early on cancellation, then
    /// post.
    async fn dispatch_after(self: Arc<Self>, packet: Arc<PostPacket>, wait_ms: u64) {
        let mut status_rx = packet.subscribe();

        tokio::select! {
            _ = sleep(Duration::from_millis(wait_ms)) => {}
            _ = wait_for_cancellation(&mut status_rx) => {
                debug!(website = %self.website, id = packet.id(), "cancelled before dispatch");
                self.clear_current();
                self.signal(QueueSignal::BucketFree(packet));
                return;
            }
        }

        // The timer can win the race against a cancellation that has
        // already landed.
        if packet.is_cancelled() {
            self.clear_current();
            self.signal(QueueSignal::BucketFree(packet));
            return;
        }

        self.dispatch(packet).await;
    }

    async fn dispatch(&self, packet: Arc<PostPacket>) {
        packet.about_to_post();
        self.times.set(&self.website, Utc::now().timestamp_millis());

        let submission = Arc::clone(packet.submission());
        debug!(website = %self.website, id = packet.id(), "posting");

        let mut failed = false;
        match self.poster.post(&self.website, &submission).await {
            Ok(success) => {
                if let Some(url) = success.source_url {
                    submission.update_stats(|stats| stats.source_urls.push(url));
                }
                packet.post_completed();
            }
            Err(failure) => {
                failed = true;
                packet.post_failed();
                submission.update_stats(|stats| stats.errors.push(failure.error.clone()));
                warn!(website = %self.website, id = packet.id(), error = %failure, "post failed");

                // Cancellation arrived mid-post and the post never landed;
                // give the website back to the pending list.
                if packet.cancel_requested() {
                    let mut websites = submission.websites();
                    websites.push(self.website.clone());
                    websites.sort();
                    submission.set_websites(websites);
                }

                if let Some(message) = failure.user_message {
                    self.notifier
                        .notify_error(&self.website, &message, &submission.label())
                        .await;
                }
            }
        }

        // The success/fail lists were mutated in place; force a refresh so
        // persistence sees the composite object.
        submission.flag_update(Field::PostStats);

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.use_override_interval = true;
            state.current = None;
        }

        if failed {
            self.signal(QueueSignal::PacketFailed(packet.id()));
        }
        self.signal(QueueSignal::BucketFree(packet));
    }

    fn clear_current(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current = None;
    }

    fn signal(&self, signal: QueueSignal) {
        // The orchestrator outlives the buckets; a closed channel only
        // happens during teardown.
        let _ = self.signals.send(signal);
    }
}

/// Resolves once the packet reports Cancelled; otherwise never.
async fn wait_for_cancellation(rx: &mut watch::Receiver<PacketStatus>) {
    loop {
        if *rx.borrow() == PacketStatus::Cancelled {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone; nothing to observe anymore.
            std::future::pending::<()>().await;
        }
    }
}

/// Dispatch delay for a website given the time since its last post.
///
/// When the interval has already elapsed the delay is the 5-second floor,
/// or the user override once the bucket has completed a dispatch.
/// Otherwise the delay is `|min_interval - elapsed|`, floored — the
/// absolute value means a last-post time recorded in the future widens
/// the wait instead of shortening it. Kept bit-for-bit compatible with
/// stored timestamps from earlier releases.
fn wait_millis(elapsed_ms: i64, min_interval_ms: u64, override_ms: u64, use_override: bool) -> u64 {
    let override_active = use_override && override_ms > 0;

    if elapsed_ms >= min_interval_ms as i64 {
        if override_active {
            override_ms
        } else {
            MIN_POST_DELAY_MS
        }
    } else {
        let calculated = (min_interval_ms as i64 - elapsed_ms)
            .unsigned_abs()
            .max(MIN_POST_DELAY_MS);
        if override_active { override_ms } else { calculated }
    }
}
