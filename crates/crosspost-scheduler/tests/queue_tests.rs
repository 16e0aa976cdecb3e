//! End-to-end scheduler tests over scripted collaborators.
//!
//! Time is paused (`start_paused`), so dispatch timers and posting delays
//! elapse instantly in virtual time while ordering and overlap remain
//! observable.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout};

use crosspost_core::{
    CoreError, FormData, MemoryPostTimeStore, NotificationKind, Notifier, PostFailure,
    PostSuccess, Poster, Settings, SharedSettings, Submission, SubmissionRecord, SubmissionStore,
    WebsiteConfig, WebsiteRegistry,
};
use crosspost_scheduler::{PostQueue, SchedulerError};

/// One recorded poster invocation, with its virtual-time interval.
#[derive(Debug, Clone)]
struct PostCall {
    website: String,
    id: i64,
    start: Instant,
    end: Instant,
}

#[derive(Default)]
struct FakePoster {
    delay_ms: u64,
    failing: Mutex<HashSet<String>>,
    source_urls: HashMap<String, String>,
    calls: Mutex<Vec<PostCall>>,
    active: Mutex<HashMap<String, usize>>,
    max_active: Mutex<HashMap<String, usize>>,
}

impl FakePoster {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    fn with_failing(self, websites: &[&str]) -> Self {
        self.failing
            .lock()
            .unwrap()
            .extend(websites.iter().map(|w| w.to_string()));
        self
    }

    fn with_source_url(mut self, website: &str, url: &str) -> Self {
        self.source_urls
            .insert(website.to_string(), url.to_string());
        self
    }

    fn set_failing(&self, websites: &[&str]) {
        let mut failing = self.failing.lock().unwrap();
        failing.clear();
        failing.extend(websites.iter().map(|w| w.to_string()));
    }

    fn calls(&self) -> Vec<PostCall> {
        self.calls.lock().unwrap().clone()
    }

    fn call_order(&self) -> Vec<(String, i64)> {
        self.calls()
            .into_iter()
            .map(|c| (c.website, c.id))
            .collect()
    }

    fn max_active(&self, website: &str) -> usize {
        self.max_active
            .lock()
            .unwrap()
            .get(website)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Poster for FakePoster {
    async fn post(
        &self,
        website: &str,
        submission: &Submission,
    ) -> Result<PostSuccess, PostFailure> {
        let start = Instant::now();
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(website.to_string()).or_insert(0);
            *count += 1;
            let mut max = self.max_active.lock().unwrap();
            let slot = max.entry(website.to_string()).or_insert(0);
            *slot = (*slot).max(*count);
        }

        if self.delay_ms > 0 {
            sleep(Duration::from_millis(self.delay_ms)).await;
        }

        if let Some(count) = self.active.lock().unwrap().get_mut(website) {
            *count -= 1;
        }
        self.calls.lock().unwrap().push(PostCall {
            website: website.to_string(),
            id: submission.id(),
            start,
            end: Instant::now(),
        });

        if self.failing.lock().unwrap().contains(website) {
            Err(PostFailure {
                error: format!("{} rejected the upload", website),
                user_message: None,
            })
        } else {
            Ok(PostSuccess {
                source_url: self.source_urls.get(website).cloned(),
            })
        }
    }
}

#[derive(Default)]
struct CollectingNotifier {
    notifications: Mutex<Vec<(NotificationKind, i64)>>,
}

impl CollectingNotifier {
    fn notifications(&self) -> Vec<(NotificationKind, i64)> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn notify(&self, kind: NotificationKind, submission: &Submission) {
        self.notifications
            .lock()
            .unwrap()
            .push((kind, submission.id()));
    }

    async fn notify_error(&self, _website: &str, _message: &str, _label: &str) {}
}

#[derive(Default)]
struct CollectingStore {
    deleted: Mutex<Vec<i64>>,
}

impl CollectingStore {
    fn deleted(&self) -> Vec<i64> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubmissionStore for CollectingStore {
    async fn delete(&self, id: i64) -> Result<(), CoreError> {
        self.deleted.lock().unwrap().push(id);
        Ok(())
    }
}

struct Harness {
    queue: Arc<PostQueue>,
    poster: Arc<FakePoster>,
    notifier: Arc<CollectingNotifier>,
    store: Arc<CollectingStore>,
    shutdown_rx: watch::Receiver<bool>,
}

fn website(name: &str, wait_ms: u64, accepts_source_url: bool) -> WebsiteConfig {
    WebsiteConfig {
        name: name.to_string(),
        post_wait_interval_ms: wait_ms,
        accepts_source_url,
    }
}

fn harness(websites: Vec<WebsiteConfig>, poster: FakePoster, settings: Settings) -> Harness {
    let registry = Arc::new(WebsiteRegistry::new(websites).unwrap());
    let poster = Arc::new(poster);
    let notifier = Arc::new(CollectingNotifier::default());
    let store = Arc::new(CollectingStore::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let queue = PostQueue::new(
        registry,
        SharedSettings::new(settings),
        Arc::clone(&poster) as Arc<dyn Poster>,
        Arc::new(MemoryPostTimeStore::new()),
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        Arc::clone(&store) as Arc<dyn SubmissionStore>,
        shutdown_tx,
    );

    Harness {
        queue,
        poster,
        notifier,
        store,
        shutdown_rx,
    }
}

fn submission(id: i64, websites: &[&str]) -> Arc<Submission> {
    Arc::new(Submission::from_record(SubmissionRecord {
        id,
        title: format!("Submission {id}"),
        rating: Default::default(),
        schedule: None,
        file_info: None,
        additional_files: Vec::new(),
        form_data: FormData {
            websites: websites.iter().map(|w| w.to_string()).collect(),
            ..Default::default()
        },
        post_stats: None,
    }))
}

/// Wait for the queue to drain and finalization signals to settle.
async fn drain(queue: &PostQueue) {
    timeout(Duration::from_secs(3600), async {
        while !queue.is_empty().await {
            sleep(Duration::from_millis(200)).await;
        }
        sleep(Duration::from_millis(200)).await;
    })
    .await
    .expect("queue did not drain");
}

#[tokio::test(start_paused = true)]
async fn posts_every_website_and_deletes_finished() {
    let h = harness(
        vec![website("alpha", 60_000, false), website("beta", 30_000, false)],
        FakePoster::new(),
        Settings::default(),
    );

    let sub = submission(1, &["alpha", "beta"]);
    h.queue.enqueue(Arc::clone(&sub)).await.unwrap();
    assert!(sub.queued());

    drain(&h.queue).await;

    let stats = sub.stats();
    assert_eq!(stats.success.len() + stats.fail.len(), stats.original_count);
    assert_eq!(stats.fail.len(), 0);
    assert_eq!(stats.original_count, 2);

    assert!(sub.websites().is_empty());
    assert!(!sub.queued());
    assert_eq!(h.notifier.notifications(), vec![(NotificationKind::Success, 1)]);
    assert_eq!(h.store.deleted(), vec![1]);
    // Torn down after removal from queue and storage.
    assert!(sub.subscribe().is_none());
}

#[tokio::test(start_paused = true)]
async fn failure_keeps_record_for_user() {
    let h = harness(
        vec![website("alpha", 10_000, false)],
        FakePoster::new().with_failing(&["alpha"]),
        Settings::default(),
    );

    let sub = submission(1, &["alpha"]);
    h.queue.enqueue(Arc::clone(&sub)).await.unwrap();
    drain(&h.queue).await;

    let stats = sub.stats();
    assert_eq!(stats.fail, vec!["alpha"]);
    assert_eq!(stats.errors.len(), 1);
    // The failed website is restored into the pending list for retry.
    assert_eq!(sub.websites(), vec!["alpha"]);
    assert_eq!(h.notifier.notifications(), vec![(NotificationKind::Failure, 1)]);
    assert!(h.store.deleted().is_empty());
    assert!(!sub.queued());
}

#[tokio::test(start_paused = true)]
async fn retry_after_failure_reposts_failed_website() {
    let h = harness(
        vec![website("alpha", 10_000, false)],
        FakePoster::new().with_failing(&["alpha"]),
        Settings::default(),
    );

    let sub = submission(1, &["alpha"]);
    h.queue.enqueue(Arc::clone(&sub)).await.unwrap();
    drain(&h.queue).await;
    assert_eq!(sub.stats().fail, vec!["alpha"]);

    // Retry is a user action: re-enqueue recomputes the decomposition
    // from the restored website list.
    h.poster.set_failing(&[]);
    h.queue.enqueue(Arc::clone(&sub)).await.unwrap();
    drain(&h.queue).await;

    let stats = sub.stats();
    assert_eq!(stats.success, vec!["alpha"]);
    assert!(stats.fail.is_empty());
    assert_eq!(h.store.deleted(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn fifo_fairness_per_website() {
    let h = harness(
        vec![website("delta", 30_000, false)],
        FakePoster::new().with_delay(500),
        Settings::default(),
    );

    let first = submission(1, &["delta"]);
    let second = submission(2, &["delta"]);
    h.queue.enqueue(first).await.unwrap();
    h.queue.enqueue(second).await.unwrap();

    drain(&h.queue).await;

    assert_eq!(
        h.poster.call_order(),
        vec![("delta".to_string(), 1), ("delta".to_string(), 2)]
    );
}

#[tokio::test(start_paused = true)]
async fn single_slot_per_website() {
    let h = harness(
        vec![website("delta", 5_000, false)],
        FakePoster::new().with_delay(1_000),
        Settings::default(),
    );

    for id in 1..=3 {
        h.queue.enqueue(submission(id, &["delta"])).await.unwrap();
    }
    drain(&h.queue).await;

    assert_eq!(h.poster.calls().len(), 3);
    assert_eq!(h.poster.max_active("delta"), 1);
}

#[tokio::test(start_paused = true)]
async fn dependent_website_posts_after_independents() {
    let h = harness(
        vec![
            website("xsite", 5_000, false),
            website("ysite", 5_000, false),
            website("zsite", 5_000, true),
        ],
        FakePoster::new()
            .with_delay(500)
            .with_source_url("xsite", "https://xsite.example/42"),
        Settings::default(),
    );

    let sub = submission(1, &["zsite", "ysite", "xsite"]);
    h.queue.enqueue(Arc::clone(&sub)).await.unwrap();
    drain(&h.queue).await;

    let calls = h.poster.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].website, "zsite");

    // The dependent post starts only after both independents finished.
    let z = &calls[2];
    for independent in &calls[..2] {
        assert!(independent.end <= z.start);
    }

    // The produced URL was recorded for the dependent post to consume.
    assert_eq!(sub.stats().source_urls, vec!["https://xsite.example/42"]);
}

#[tokio::test(start_paused = true)]
async fn dependent_websites_never_overlap() {
    let h = harness(
        vec![
            website("xsite", 5_000, false),
            website("dep1", 5_000, true),
            website("dep2", 5_000, true),
        ],
        FakePoster::new().with_delay(1_000),
        Settings::default(),
    );

    h.queue
        .enqueue(submission(1, &["dep2", "dep1", "xsite"]))
        .await
        .unwrap();
    drain(&h.queue).await;

    let calls = h.poster.calls();
    assert_eq!(calls.len(), 3);

    let dep_calls: Vec<&PostCall> = calls
        .iter()
        .filter(|c| c.website.starts_with("dep"))
        .collect();
    assert_eq!(dep_calls.len(), 2);
    let (a, b) = (dep_calls[0], dep_calls[1]);
    assert!(a.end <= b.start || b.end <= a.start, "dependent posts overlapped");
}

#[tokio::test(start_paused = true)]
async fn cancel_while_timer_pending_preserves_website() {
    let h = harness(
        vec![website("alpha", 60_000, false)],
        FakePoster::new(),
        Settings::default(),
    );

    let sub = submission(1, &["alpha"]);
    h.queue.enqueue(Arc::clone(&sub)).await.unwrap();
    // Cancel before the dispatch timer fires.
    h.queue.dequeue(1, true).await;

    sleep(Duration::from_secs(120)).await;

    assert!(h.poster.calls().is_empty());
    assert_eq!(sub.websites(), vec!["alpha"]);
    assert!(!sub.queued());
    assert!(h.queue.is_empty().await);
    assert!(h.queue.decomposition_for(1).await.is_none());
    // User-initiated dequeue never produces a completion notification.
    assert!(h.notifier.notifications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_posting_failure_restores_website() {
    let h = harness(
        vec![website("alpha", 10_000, false)],
        FakePoster::new().with_delay(2_000).with_failing(&["alpha"]),
        Settings::default(),
    );

    let sub = submission(1, &["alpha"]);
    h.queue.enqueue(Arc::clone(&sub)).await.unwrap();

    // Past the 5s dispatch delay: the post is in flight.
    sleep(Duration::from_secs(6)).await;
    h.queue.dequeue(1, true).await;

    // Cancellation never aborts the in-flight call; let it resolve.
    sleep(Duration::from_secs(5)).await;

    assert_eq!(h.poster.calls().len(), 1);
    // The post failed and had been cancelled mid-flight: the website goes
    // back to the pending list.
    assert_eq!(sub.stats().fail, vec!["alpha"]);
    assert_eq!(sub.websites(), vec!["alpha"]);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_posting_success_still_counts() {
    let h = harness(
        vec![website("alpha", 10_000, false)],
        FakePoster::new().with_delay(2_000),
        Settings::default(),
    );

    let sub = submission(1, &["alpha"]);
    h.queue.enqueue(Arc::clone(&sub)).await.unwrap();

    sleep(Duration::from_secs(6)).await;
    h.queue.dequeue(1, true).await;
    sleep(Duration::from_secs(5)).await;

    // The in-flight post landed; the website is not given back.
    assert_eq!(sub.stats().success, vec!["alpha"]);
    assert!(sub.websites().is_empty());
    // The user pulled the submission mid-run, so no finalization happened.
    assert!(h.store.deleted().is_empty());
    assert!(h.notifier.notifications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn clear_queue_on_failure_cancels_later_submissions() {
    let h = harness(
        vec![website("delta", 10_000, false)],
        FakePoster::new().with_failing(&["delta"]),
        Settings {
            clear_queue_on_failure: true,
            ..Default::default()
        },
    );

    let first = submission(1, &["delta"]);
    let second = submission(2, &["delta"]);
    h.queue.enqueue(Arc::clone(&first)).await.unwrap();
    h.queue.enqueue(Arc::clone(&second)).await.unwrap();

    drain(&h.queue).await;

    // Only the first submission ever reached the poster.
    assert_eq!(h.poster.call_order(), vec![("delta".to_string(), 1)]);

    let notifications = h.notifier.notifications();
    assert!(notifications.contains(&(NotificationKind::Cancelled, 2)));
    assert!(notifications.contains(&(NotificationKind::Failure, 1)));

    // The cancelled submission keeps its full website list.
    assert_eq!(second.websites(), vec!["delta"]);
    assert!(!second.queued());
}

#[tokio::test(start_paused = true)]
async fn duplicate_websites_are_dropped_at_enqueue() {
    let h = harness(
        vec![website("alpha", 5_000, false)],
        FakePoster::new(),
        Settings::default(),
    );

    let sub = submission(1, &["alpha", "alpha"]);
    h.queue.enqueue(Arc::clone(&sub)).await.unwrap();
    assert_eq!(sub.stats().original_count, 1);

    drain(&h.queue).await;

    assert_eq!(h.poster.calls().len(), 1);
    let stats = sub.stats();
    assert_eq!(stats.success.len() + stats.fail.len(), stats.original_count);
}

#[tokio::test(start_paused = true)]
async fn enqueue_rejects_queued_submission() {
    let h = harness(
        vec![website("alpha", 60_000, false)],
        FakePoster::new(),
        Settings::default(),
    );

    let sub = submission(1, &["alpha"]);
    h.queue.enqueue(Arc::clone(&sub)).await.unwrap();
    let err = h.queue.enqueue(Arc::clone(&sub)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::AlreadyQueued(1)));
}

#[tokio::test(start_paused = true)]
async fn enqueue_rejects_unknown_website() {
    let h = harness(
        vec![website("alpha", 60_000, false)],
        FakePoster::new(),
        Settings::default(),
    );

    let sub = submission(1, &["alpha", "nowhere"]);
    let err = h.queue.enqueue(Arc::clone(&sub)).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::UnknownWebsite { id: 1, website } if website == "nowhere"
    ));
    assert!(!sub.queued());
    assert!(h.queue.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn auto_close_requests_shutdown_after_grace() {
    let h = harness(
        vec![website("alpha", 5_000, false)],
        FakePoster::new(),
        Settings {
            auto_close_on_empty_queue: true,
            ..Default::default()
        },
    );

    h.queue.enqueue(submission(1, &["alpha"])).await.unwrap();
    drain(&h.queue).await;

    assert!(!*h.shutdown_rx.borrow());
    sleep(Duration::from_secs(20)).await;
    assert!(*h.shutdown_rx.borrow());
}

#[tokio::test(start_paused = true)]
async fn override_interval_spaces_dispatches() {
    let h = harness(
        vec![website("alpha", 60_000, false)],
        FakePoster::new(),
        Settings {
            post_interval_minutes: 2,
            ..Default::default()
        },
    );

    h.queue.enqueue(submission(1, &["alpha"])).await.unwrap();
    h.queue.enqueue(submission(2, &["alpha"])).await.unwrap();
    drain(&h.queue).await;

    let calls = h.poster.calls();
    assert_eq!(calls.len(), 2);
    // The first dispatch of a fresh limiter ignores the override; every
    // later one honors it.
    assert!(calls[1].start - calls[0].end >= Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn queue_updates_reflect_progress() {
    let h = harness(
        vec![website("alpha", 5_000, false)],
        FakePoster::new(),
        Settings::default(),
    );
    let mut updates = h.queue.subscribe();

    h.queue.enqueue(submission(1, &["alpha"])).await.unwrap();

    let snapshots = updates.recv().await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].id, 1);
    assert_eq!(snapshots[0].original_count, 1);

    drain(&h.queue).await;

    // The final snapshot shows an empty queue.
    let mut last = None;
    while let Ok(snapshot) = updates.try_recv() {
        last = Some(snapshot);
    }
    assert_eq!(last.unwrap().len(), 0);
}
