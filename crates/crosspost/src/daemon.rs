//! Daemon wiring: load config, enqueue pending submissions, run the
//! queue until it drains or a shutdown signal arrives.

use std::sync::Arc;

use miette::{IntoDiagnostic, Result};
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{debug, info, warn};

use crosspost_core::{FilePostTimeStore, Settings, SharedSettings, Submission};
use crosspost_scheduler::PostQueue;

use crate::config;
use crate::notifier::LogNotifier;
use crate::poster::HttpPoster;
use crate::store::JsonSubmissionStore;

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub websites_path: String,
    pub submissions_path: String,
    pub post_times_path: String,
    pub post_interval_minutes: u64,
    pub clear_queue_on_failure: bool,
    pub auto_close: bool,
}

/// Run the daemon.
pub async fn run(config: DaemonConfig) -> Result<()> {
    info!("starting crosspost daemon");

    let websites = config::load_websites(&config.websites_path)?;
    let registry = Arc::new(websites.registry);
    let settings = SharedSettings::new(Settings {
        post_interval_minutes: config.post_interval_minutes,
        clear_queue_on_failure: config.clear_queue_on_failure,
        auto_close_on_empty_queue: config.auto_close,
    });

    let times = Arc::new(FilePostTimeStore::open(&config.post_times_path).into_diagnostic()?);
    let store = Arc::new(JsonSubmissionStore::open(&config.submissions_path).into_diagnostic()?);
    let poster = Arc::new(HttpPoster::new(websites.endpoints).into_diagnostic()?);

    // Shutdown channel: ctrl-c and the queue's auto-close both feed it.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = ctrl_c_tx.send(true);
    });

    let queue = PostQueue::new(
        registry,
        settings,
        poster,
        times,
        Arc::new(LogNotifier),
        Arc::clone(&store) as Arc<dyn crosspost_core::SubmissionStore>,
        shutdown_tx,
    );

    // Progress logging from the queue-state stream.
    let mut updates = queue.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(snapshots) => {
                    for s in &snapshots {
                        debug!(
                            id = s.id,
                            title = %s.title,
                            succeeded = s.succeeded,
                            failed = s.failed,
                            waiting = s.waiting,
                            of = s.original_count,
                            "queue progress"
                        );
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let records = store.pending().await;
    if records.is_empty() {
        info!("nothing to post");
        return Ok(());
    }
    info!(count = records.len(), "loaded pending submissions");

    for record in records {
        let submission = Arc::new(Submission::from_record(record));
        Arc::clone(&store).watch(&submission);
        if let Err(e) = queue.enqueue(Arc::clone(&submission)).await {
            warn!(id = submission.id(), error = %e, "skipping submission");
        }
    }

    if queue.is_empty().await {
        info!("no submission could be queued");
        return Ok(());
    }

    // Wait for ctrl-c or the queue's auto-close request.
    loop {
        if shutdown_rx.changed().await.is_err() || *shutdown_rx.borrow() {
            break;
        }
    }

    info!("daemon shut down gracefully");
    Ok(())
}

/// Validate the config files without posting anything.
pub async fn check(websites_path: &str, submissions_path: &str) -> Result<()> {
    let websites = config::load_websites(websites_path)?;
    info!(count = websites.registry.len(), "website registry ok");

    let store = JsonSubmissionStore::open(submissions_path).into_diagnostic()?;
    let records = store.pending().await;

    let mut problems = 0usize;
    for record in &records {
        for website in &record.form_data.websites {
            if !websites.registry.contains(website) {
                warn!(id = record.id, website = %website, "unknown website");
                problems += 1;
            } else if !websites.endpoints.contains_key(website) {
                warn!(id = record.id, website = %website, "no endpoint configured");
                problems += 1;
            }
        }
    }

    info!(submissions = records.len(), "pending submissions ok");
    if problems > 0 {
        Err(miette::miette!("{} problems found", problems))
    } else {
        Ok(())
    }
}
