//! Background feed updater for Granary.
//!
//! Periodically refreshes every stored subscription. Unlike a detached
//! spawn, `start_updater` hands back a handle so the caller can stop the
//! loop and wait for it to exit.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::db::Database;
use crate::feed::fetcher::FeedFetcher;
use crate::feed::service::RefreshService;

/// Default refresh interval in seconds (15 minutes).
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 900;

/// Periodic background refresher.
pub struct FeedUpdater {
    db: Arc<Database>,
    fetcher: Arc<dyn FeedFetcher>,
    update_interval: Duration,
    max_concurrent: usize,
}

impl FeedUpdater {
    /// Create a new updater with the default interval.
    pub fn new(db: Arc<Database>, fetcher: Arc<dyn FeedFetcher>) -> Self {
        Self {
            db,
            fetcher,
            update_interval: Duration::from_secs(DEFAULT_UPDATE_INTERVAL_SECS),
            max_concurrent: 8,
        }
    }

    /// Set a custom refresh interval.
    pub fn with_interval(mut self, interval_secs: u64) -> Self {
        self.update_interval = Duration::from_secs(interval_secs);
        self
    }

    /// Set the fetch concurrency ceiling passed to each refresh.
    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Run the refresh loop until `stop` flips to true or its sender is
    /// dropped.
    ///
    /// The first refresh runs immediately; subsequent ones follow the
    /// configured interval. A refresh in flight when the stop signal
    /// arrives finishes before the loop exits.
    async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            "Feed updater started (interval: {} seconds)",
            self.update_interval.as_secs()
        );

        let mut timer = interval(self.update_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.refresh_once().await;
                }
                result = stop.changed() => {
                    if result.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Feed updater stopped");
    }

    async fn refresh_once(&self) {
        let service = RefreshService::new(&self.db, Arc::clone(&self.fetcher))
            .with_concurrency(self.max_concurrent);

        match service.refresh_all(None).await {
            Ok(outcome) => {
                if outcome.articles_added > 0 {
                    info!(
                        "Background refresh added {} article(s)",
                        outcome.articles_added
                    );
                } else {
                    debug!("Background refresh: no new articles");
                }
            }
            Err(e) => error!("Background refresh failed: {}", e),
        }
    }
}

/// Handle to a running updater task.
///
/// Dropping the handle also stops the loop, at the next iteration.
pub struct UpdaterHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl UpdaterHandle {
    /// Stop the updater and wait for the loop to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }

    /// Whether the updater task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Start the updater as a background task.
pub fn start_updater(updater: FeedUpdater) -> UpdaterHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(updater.run(stop_rx));
    UpdaterHandle {
        stop: stop_tx,
        task,
    }
}
