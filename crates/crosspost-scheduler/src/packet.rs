//! Work units and submission decomposition.
//!
//! A [`PostPacket`] tracks posting progress for a single website; a
//! [`SubmissionPacket`] owns the ordered set of packets derived from one
//! submission and answers dispatch-eligibility questions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crosspost_core::{Submission, WebsiteRegistry};

/// Posting status of a work unit.
///
/// `Waiting` is the only re-enterable state (a limiter re-confirms it when
/// scheduling a dispatch time); once a packet leaves `Waiting` it never
/// returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    Waiting,
    Posting,
    Complete,
    Failed,
    Cancelled,
}

impl PacketStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

/// The posting task for one (submission, website) pair.
pub struct PostPacket {
    website: String,
    submission: Arc<Submission>,
    /// True when this website does not consume another website's posted
    /// URL and may therefore run independently.
    is_async: bool,
    status: watch::Sender<PacketStatus>,
    /// Set when cancellation arrives while the packet is mid-post; the
    /// in-flight call still resolves, bookkeeping corrects afterwards.
    cancel_requested: AtomicBool,
    posting_time: RwLock<Option<DateTime<Utc>>>,
}

impl PostPacket {
    pub(crate) fn new(submission: Arc<Submission>, website: String, is_async: bool) -> Self {
        let (status, _) = watch::channel(PacketStatus::Waiting);
        Self {
            website,
            submission,
            is_async,
            status,
            cancel_requested: AtomicBool::new(false),
            posting_time: RwLock::new(None),
        }
    }

    /// Id of the owning submission.
    pub fn id(&self) -> i64 {
        self.submission.id()
    }

    pub fn website(&self) -> &str {
        &self.website
    }

    pub fn submission(&self) -> &Arc<Submission> {
        &self.submission
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn status(&self) -> PacketStatus {
        *self.status.borrow()
    }

    /// Status stream; the receiver sees the current value immediately.
    pub fn subscribe(&self) -> watch::Receiver<PacketStatus> {
        self.status.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == PacketStatus::Cancelled
    }

    /// Whether cancellation was requested, regardless of whether the
    /// status could honor it at the time.
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn posting_time(&self) -> Option<DateTime<Utc>> {
        *self
            .posting_time
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Posting, or Waiting while already held by a limiter.
    pub fn is_in_flight(&self) -> bool {
        match self.status() {
            PacketStatus::Posting => true,
            PacketStatus::Waiting => self.posting_time().is_some(),
            _ => false,
        }
    }

    /// Record the scheduled dispatch time and re-confirm Waiting.
    pub fn set_posting_time(&self, time: DateTime<Utc>) {
        *self
            .posting_time
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(time);
        // Re-notify subscribers without ever re-entering Waiting from
        // another state.
        self.status
            .send_if_modified(|status| matches!(*status, PacketStatus::Waiting));
    }

    /// Waiting -> Posting. Removes this website from the submission's
    /// pending list, publishing the shrink for persistence.
    pub fn about_to_post(&self) {
        let mut websites = self.submission.websites();
        if let Some(index) = websites.iter().position(|w| w == &self.website) {
            websites.remove(index);
            self.submission.set_websites(websites);
        }
        self.transition(PacketStatus::Waiting, PacketStatus::Posting);
    }

    /// Posting -> Complete. Records the website in the success list.
    pub fn post_completed(&self) {
        let website = self.website.clone();
        self.submission.update_stats(|stats| stats.success.push(website));
        self.transition(PacketStatus::Posting, PacketStatus::Complete);
    }

    /// Posting -> Failed. Records the website in the fail list.
    pub fn post_failed(&self) {
        let website = self.website.clone();
        self.submission.update_stats(|stats| stats.fail.push(website));
        self.transition(PacketStatus::Posting, PacketStatus::Failed);
    }

    /// Request cancellation. Only effective from Waiting; a packet that is
    /// already Posting keeps running and resolves from its outcome.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.transition(PacketStatus::Waiting, PacketStatus::Cancelled);
    }

    fn transition(&self, from: PacketStatus, to: PacketStatus) -> bool {
        self.status.send_if_modified(|status| {
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        })
    }
}

impl std::fmt::Debug for PostPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostPacket")
            .field("id", &self.id())
            .field("website", &self.website)
            .field("is_async", &self.is_async)
            .field("status", &self.status())
            .finish()
    }
}

/// The ordered decomposition of one submission into work units.
///
/// Built once at enqueue time. Independent websites sort before dependent
/// ones, alphabetically within each group; the order drives completion
/// detection, not per-website timing.
pub struct SubmissionPacket {
    submission: Arc<Submission>,
    packets: Vec<Arc<PostPacket>>,
    cancelled: AtomicBool,
    /// True iff no packet depends on another website's result.
    is_async: bool,
}

impl SubmissionPacket {
    pub fn new(submission: Arc<Submission>, registry: &WebsiteRegistry) -> Self {
        let accepts = |website: &str| {
            registry
                .get(website)
                .map(|config| config.accepts_source_url)
                .unwrap_or(false)
        };

        let mut websites = submission.websites();
        websites.sort_by(|a, b| {
            accepts(a)
                .cmp(&accepts(b))
                .then_with(|| a.cmp(b))
        });

        let packets: Vec<Arc<PostPacket>> = websites
            .into_iter()
            .map(|website| {
                let is_async = !accepts(&website);
                Arc::new(PostPacket::new(Arc::clone(&submission), website, is_async))
            })
            .collect();

        let is_async = packets.iter().all(|p| p.is_async());

        Self {
            submission,
            packets,
            cancelled: AtomicBool::new(false),
            is_async,
        }
    }

    pub fn id(&self) -> i64 {
        self.submission.id()
    }

    pub fn submission(&self) -> &Arc<Submission> {
        &self.submission
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Whether the whole decomposition was cancelled (drives notification
    /// wording).
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// All packets in decomposition order.
    pub fn packets(&self) -> &[Arc<PostPacket>] {
        &self.packets
    }

    /// Packets still Waiting, in decomposition order.
    pub fn waiting_packets(&self) -> Vec<Arc<PostPacket>> {
        self.packets
            .iter()
            .filter(|p| p.status() == PacketStatus::Waiting)
            .cloned()
            .collect()
    }

    /// First packet still Waiting, used to detect unprocessed units.
    pub fn next_waiting(&self) -> Option<Arc<PostPacket>> {
        self.packets
            .iter()
            .find(|p| p.status() == PacketStatus::Waiting)
            .cloned()
    }

    /// True when every packet is terminal.
    pub fn is_completable(&self) -> bool {
        !self
            .packets
            .iter()
            .any(|p| matches!(p.status(), PacketStatus::Waiting | PacketStatus::Posting))
    }

    /// May this packet be handed to its website's limiter right now?
    ///
    /// Independent packets always may. A dependent packet consumes a URL
    /// produced by the independent posts, so it must wait until none of
    /// them is Waiting or Posting; dependent packets additionally exclude
    /// each other, so at most one is in flight per submission.
    pub fn can_dispatch(&self, packet: &PostPacket) -> bool {
        if self.is_async || packet.is_async() {
            return true;
        }

        let independent_pending = self.packets.iter().any(|p| {
            p.is_async()
                && matches!(p.status(), PacketStatus::Waiting | PacketStatus::Posting)
        });
        if independent_pending {
            return false;
        }

        !self
            .packets
            .iter()
            .any(|p| !p.is_async() && p.website() != packet.website() && p.is_in_flight())
    }

    /// Websites that never posted: the remaining pending list plus the
    /// recorded failures.
    pub fn unposted_websites(&self) -> Vec<String> {
        let mut websites = self.submission.websites();
        websites.extend(self.submission.stats().fail);
        websites
    }

    /// Cancel every non-terminal packet and mark the decomposition
    /// cancelled. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_packets();
    }

    /// Cancel every non-terminal packet without marking the decomposition
    /// cancelled. Idempotent.
    pub fn clean_up(&self) {
        self.cancel_packets();
    }

    fn cancel_packets(&self) {
        for packet in self
            .packets
            .iter()
            .filter(|p| !matches!(p.status(), PacketStatus::Complete | PacketStatus::Failed))
        {
            packet.cancel();
        }
    }
}

impl std::fmt::Debug for SubmissionPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionPacket")
            .field("id", &self.id())
            .field("packets", &self.packets.len())
            .field("is_async", &self.is_async)
            .finish()
    }
}
