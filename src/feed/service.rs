//! Refresh orchestration for Granary.
//!
//! `RefreshService` fans out one fetch task per feed, caps concurrency with
//! a semaphore, aggregates completions over a channel, reports progress and
//! folds the whole batch into the store with a single merge call.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use super::fetcher::{FeedFetcher, FetchOutcome};
use super::repository::FeedRepository;
use super::types::{Feed, FetchedArticle, FetchedFeed, MergeOutcome, RefreshProgress};
use crate::db::Database;
use crate::error::{GranaryError, Result};

/// Fallback ceiling on simultaneous fetches.
const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Where progress reports go. Unbounded so a slow or dropped observer can
/// never stall a refresh.
pub type ProgressSink = mpsc::UnboundedSender<RefreshProgress>;

/// Service for refreshing feed subscriptions.
pub struct RefreshService<'a> {
    db: &'a Database,
    fetcher: Arc<dyn FeedFetcher>,
    max_concurrent: usize,
}

impl<'a> RefreshService<'a> {
    /// Create a new refresh service.
    pub fn new(db: &'a Database, fetcher: Arc<dyn FeedFetcher>) -> Self {
        Self {
            db,
            fetcher,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    /// Set the ceiling on simultaneous fetches.
    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        // A ceiling of zero would park the whole batch forever.
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Look up a feed by URL, subscribing first if it is unknown, then
    /// refresh it once and return the resulting state.
    ///
    /// A fetch failure returns the prior state unchanged; only store
    /// failures propagate as errors.
    pub async fn retrieve_or_refresh(&self, url: &str) -> Result<Feed> {
        let url = url.trim();
        if url.is_empty() {
            return Err(GranaryError::Validation(
                "feed URL must not be empty".to_string(),
            ));
        }

        let repo = FeedRepository::new(self.db.pool());
        let feed = match repo.get_by_url(url).await? {
            Some(feed) => feed,
            None => Feed::subscription(url),
        };

        self.refresh_single(feed).await
    }

    /// Refresh one feed and return its stored state.
    ///
    /// On fetch failure the input is returned unchanged. On success the
    /// result is merged as a single-element batch and re-read from the
    /// store.
    pub async fn refresh_single(&self, feed: Feed) -> Result<Feed> {
        match self.fetcher.fetch(&feed.url).await {
            Ok((fetched, articles)) => {
                let repo = FeedRepository::new(self.db.pool());
                repo.merge_batch(&[fetched], &articles).await?;
                repo.get_by_url(&feed.url)
                    .await?
                    .ok_or_else(|| GranaryError::NotFound(format!("merged feed {}", feed.url)))
            }
            Err(e) => {
                warn!("Failed to refresh {}: {}", feed.url, e);
                Ok(feed)
            }
        }
    }

    /// Refresh every stored feed.
    pub async fn refresh_all(&self, progress: Option<ProgressSink>) -> Result<MergeOutcome> {
        let feeds = FeedRepository::new(self.db.pool()).list_all().await?;
        self.refresh_batch(feeds, progress).await
    }

    /// Refresh a batch of feeds concurrently.
    ///
    /// One report per settled fetch goes to `progress` (with `completed`
    /// strictly increasing), followed by a terminal report with
    /// `feed == None` once the batch has been merged. Per-feed fetch
    /// failures are counted and logged, never fatal; only a store failure
    /// makes the whole call fail, and then no terminal report is sent.
    pub async fn refresh_batch(
        &self,
        feeds: Vec<Feed>,
        progress: Option<ProgressSink>,
    ) -> Result<MergeOutcome> {
        let total = feeds.len();

        if total == 0 {
            debug!("No feeds to refresh");
            emit(
                &progress,
                RefreshProgress {
                    completed: 0,
                    total: 0,
                    failed: 0,
                    feed: None,
                },
            );
            return Ok(MergeOutcome::default());
        }

        info!("Refreshing {} feed(s)", total);

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let (tx, mut rx) = mpsc::unbounded_channel::<(Feed, Result<FetchOutcome>)>();

        let mut handles = Vec::with_capacity(total);
        for feed in feeds {
            let worker_feed = feed.clone();
            let semaphore = Arc::clone(&semaphore);
            let fetcher = Arc::clone(&self.fetcher);
            let tx = tx.clone();

            let handle = tokio::spawn(async move {
                // Acquire fails only if the semaphore is closed, which
                // never happens here.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                // If the batch was dropped there is nobody to report to;
                // skip the fetch instead of doing invisible work.
                if tx.is_closed() {
                    return;
                }
                let result = fetcher.fetch(&worker_feed.url).await;
                let _ = tx.send((worker_feed, result));
            });

            handles.push((feed, handle));
        }
        drop(tx);

        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut fetched_feeds: Vec<FetchedFeed> = Vec::new();
        let mut fetched_articles: Vec<FetchedArticle> = Vec::new();

        // This loop is the single aggregator: the counters live here, so
        // emitted progress is monotonic by construction.
        while let Some((feed, result)) = rx.recv().await {
            completed += 1;
            match result {
                Ok((fetched, articles)) => {
                    debug!("Fetched {} ({} article(s))", feed.url, articles.len());
                    fetched_feeds.push(fetched);
                    fetched_articles.extend(articles);
                }
                Err(e) => {
                    failed += 1;
                    warn!("Failed to refresh {}: {}", feed.url, e);
                }
            }
            emit(
                &progress,
                RefreshProgress {
                    completed,
                    total,
                    failed,
                    feed: Some(feed),
                },
            );
        }

        // The channel has closed, so every worker has finished or died.
        // Reap the handles so a panicked fetch still settles its slot.
        for (feed, handle) in handles {
            if let Err(e) = handle.await {
                completed += 1;
                failed += 1;
                warn!("Fetch task for {} failed: {}", feed.url, e);
                emit(
                    &progress,
                    RefreshProgress {
                        completed,
                        total,
                        failed,
                        feed: Some(feed),
                    },
                );
            }
        }

        let repo = FeedRepository::new(self.db.pool());
        let outcome = repo.merge_batch(&fetched_feeds, &fetched_articles).await?;

        info!(
            "Refresh complete: {}/{} feed(s) ok, {} article(s) added, {} updated",
            total - failed,
            total,
            outcome.articles_added,
            outcome.articles_updated
        );

        emit(
            &progress,
            RefreshProgress {
                completed,
                total,
                failed,
                feed: None,
            },
        );

        Ok(outcome)
    }
}

fn emit(progress: &Option<ProgressSink>, report: RefreshProgress) {
    if let Some(sink) = progress {
        let _ = sink.send(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::repository::ArticleRepository;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fetcher that serves scripted outcomes per URL and records how many
    /// fetches ran at once.
    struct ScriptedFetcher {
        outcomes: HashMap<String, Option<FetchOutcome>>,
        panic_on: HashSet<String>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new() -> Self {
            Self {
                outcomes: HashMap::new(),
                panic_on: HashSet::new(),
                delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn ok(mut self, url: &str, title: &str, guids: &[&str]) -> Self {
            let feed = FetchedFeed::new(url, title);
            let articles = guids
                .iter()
                .map(|g| FetchedArticle::new(url, *g, format!("Article {g}")))
                .collect();
            self.outcomes.insert(url.to_string(), Some((feed, articles)));
            self
        }

        fn fail(mut self, url: &str) -> Self {
            self.outcomes.insert(url.to_string(), None);
            self
        }

        fn panic_on(mut self, url: &str) -> Self {
            self.panic_on.insert(url.to_string());
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn max_observed(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FeedFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchOutcome> {
            if self.panic_on.contains(url) {
                panic!("scripted panic for {url}");
            }

            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.outcomes.get(url) {
                Some(Some(outcome)) => Ok(outcome.clone()),
                Some(None) => Err(GranaryError::Fetch(format!("scripted failure for {url}"))),
                None => Err(GranaryError::Fetch(format!("no scripted response for {url}"))),
            }
        }
    }

    async fn setup_db() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn subscriptions(urls: &[&str]) -> Vec<Feed> {
        urls.iter().map(|u| Feed::subscription(*u)).collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RefreshProgress>) -> Vec<RefreshProgress> {
        let mut reports = Vec::new();
        while let Ok(report) = rx.try_recv() {
            reports.push(report);
        }
        reports
    }

    #[tokio::test]
    async fn test_refresh_batch_reports_progress_then_terminal() {
        let db = setup_db().await;
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .ok("https://a.example.com/feed.xml", "A", &["a-1"])
                .ok("https://b.example.com/feed.xml", "B", &["b-1", "b-2"])
                .ok("https://c.example.com/feed.xml", "C", &[]),
        );
        let service = RefreshService::new(&db, fetcher);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let feeds = subscriptions(&[
            "https://a.example.com/feed.xml",
            "https://b.example.com/feed.xml",
            "https://c.example.com/feed.xml",
        ]);
        let outcome = service.refresh_batch(feeds, Some(tx)).await.unwrap();

        assert_eq!(outcome.feeds_added, 3);
        assert_eq!(outcome.articles_added, 3);

        let reports = drain(&mut rx);
        assert_eq!(reports.len(), 4);
        for (i, report) in reports.iter().take(3).enumerate() {
            assert_eq!(report.completed, i + 1);
            assert_eq!(report.total, 3);
            assert_eq!(report.failed, 0);
            assert!(report.feed.is_some());
        }
        let terminal = &reports[3];
        assert!(terminal.is_terminal());
        assert_eq!(terminal.completed, 3);
        assert_eq!(terminal.total, 3);
        assert_eq!(terminal.failed, 0);
    }

    #[tokio::test]
    async fn test_refresh_batch_isolates_failures() {
        let db = setup_db().await;
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .ok("https://a.example.com/feed.xml", "A", &["a-1", "a-2"])
                .fail("https://b.example.com/feed.xml")
                .ok("https://c.example.com/feed.xml", "C", &["c-1"]),
        );
        let service = RefreshService::new(&db, fetcher);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let feeds = subscriptions(&[
            "https://a.example.com/feed.xml",
            "https://b.example.com/feed.xml",
            "https://c.example.com/feed.xml",
        ]);
        let outcome = service.refresh_batch(feeds, Some(tx)).await.unwrap();

        assert_eq!(outcome.feeds_added, 2);
        assert_eq!(outcome.articles_added, 3);

        let repo = FeedRepository::new(db.pool());
        assert!(repo
            .get_by_url("https://a.example.com/feed.xml")
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .get_by_url("https://b.example.com/feed.xml")
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .get_by_url("https://c.example.com/feed.xml")
            .await
            .unwrap()
            .is_some());

        let reports = drain(&mut rx);
        let terminal = reports.last().unwrap();
        assert!(terminal.is_terminal());
        assert_eq!(terminal.completed, 3);
        assert_eq!(terminal.failed, 1);
    }

    #[tokio::test]
    async fn test_refresh_batch_empty() {
        let db = setup_db().await;
        let fetcher = Arc::new(ScriptedFetcher::new());
        let service = RefreshService::new(&db, fetcher);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = service.refresh_batch(Vec::new(), Some(tx)).await.unwrap();

        assert_eq!(outcome, MergeOutcome::default());

        let reports = drain(&mut rx);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_terminal());
        assert_eq!(reports[0].completed, 0);
        assert_eq!(reports[0].total, 0);
        assert_eq!(reports[0].failed, 0);

        assert_eq!(FeedRepository::new(db.pool()).count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_batch_without_sink() {
        let db = setup_db().await;
        let fetcher = Arc::new(ScriptedFetcher::new().ok(
            "https://a.example.com/feed.xml",
            "A",
            &["a-1"],
        ));
        let service = RefreshService::new(&db, fetcher);

        let feeds = subscriptions(&["https://a.example.com/feed.xml"]);
        let outcome = service.refresh_batch(feeds, None).await.unwrap();
        assert_eq!(outcome.feeds_added, 1);
    }

    #[tokio::test]
    async fn test_refresh_batch_survives_dropped_sink() {
        let db = setup_db().await;
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .ok("https://a.example.com/feed.xml", "A", &["a-1"])
                .ok("https://b.example.com/feed.xml", "B", &[]),
        );
        let service = RefreshService::new(&db, fetcher);

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let feeds = subscriptions(&[
            "https://a.example.com/feed.xml",
            "https://b.example.com/feed.xml",
        ]);
        let outcome = service.refresh_batch(feeds, Some(tx)).await.unwrap();
        assert_eq!(outcome.feeds_added, 2);
    }

    #[tokio::test]
    async fn test_refresh_batch_respects_concurrency_ceiling() {
        let db = setup_db().await;
        let mut fetcher = ScriptedFetcher::new().with_delay(Duration::from_millis(20));
        let mut urls = Vec::new();
        for i in 0..8 {
            let url = format!("https://s{i}.example.com/feed.xml");
            fetcher = fetcher.ok(&url, &format!("S{i}"), &[]);
            urls.push(url);
        }
        let fetcher = Arc::new(fetcher);
        let service = RefreshService::new(&db, fetcher.clone()).with_concurrency(2);

        let feeds = urls.iter().map(Feed::subscription).collect();
        service.refresh_batch(feeds, None).await.unwrap();

        assert!(fetcher.max_observed() >= 1);
        assert!(fetcher.max_observed() <= 2);
    }

    #[tokio::test]
    async fn test_refresh_batch_progress_is_monotonic_under_concurrency() {
        let db = setup_db().await;
        let mut fetcher = ScriptedFetcher::new().with_delay(Duration::from_millis(5));
        let mut urls = Vec::new();
        for i in 0..6 {
            let url = format!("https://s{i}.example.com/feed.xml");
            fetcher = fetcher.ok(&url, &format!("S{i}"), &[]);
            urls.push(url);
        }
        let service = RefreshService::new(&db, Arc::new(fetcher)).with_concurrency(4);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let feeds = urls.iter().map(Feed::subscription).collect();
        service.refresh_batch(feeds, Some(tx)).await.unwrap();

        let reports = drain(&mut rx);
        assert_eq!(reports.len(), 7);
        for (i, report) in reports.iter().take(6).enumerate() {
            assert_eq!(report.completed, i + 1);
        }
        assert!(reports[6].is_terminal());
    }

    #[tokio::test]
    async fn test_refresh_batch_counts_panicked_worker_as_failure() {
        let db = setup_db().await;
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .ok("https://a.example.com/feed.xml", "A", &["a-1"])
                .panic_on("https://b.example.com/feed.xml")
                .ok("https://c.example.com/feed.xml", "C", &[]),
        );
        let service = RefreshService::new(&db, fetcher);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let feeds = subscriptions(&[
            "https://a.example.com/feed.xml",
            "https://b.example.com/feed.xml",
            "https://c.example.com/feed.xml",
        ]);
        let outcome = service.refresh_batch(feeds, Some(tx)).await.unwrap();

        assert_eq!(outcome.feeds_added, 2);

        let reports = drain(&mut rx);
        assert_eq!(reports.len(), 4);
        let terminal = reports.last().unwrap();
        assert!(terminal.is_terminal());
        assert_eq!(terminal.completed, 3);
        assert_eq!(terminal.failed, 1);
    }

    #[tokio::test]
    async fn test_refresh_twice_is_idempotent() {
        let db = setup_db().await;
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .ok("https://a.example.com/feed.xml", "A", &["a-1", "a-2"])
                .ok("https://b.example.com/feed.xml", "B", &["b-1"]),
        );
        let service = RefreshService::new(&db, fetcher);

        let urls = &[
            "https://a.example.com/feed.xml",
            "https://b.example.com/feed.xml",
        ];
        let first = service
            .refresh_batch(subscriptions(urls), None)
            .await
            .unwrap();
        assert_eq!(first.feeds_added, 2);
        assert_eq!(first.articles_added, 3);

        let second = service
            .refresh_batch(subscriptions(urls), None)
            .await
            .unwrap();
        assert_eq!(second.feeds_added, 0);
        assert_eq!(second.feeds_updated, 2);
        assert_eq!(second.articles_added, 0);

        assert_eq!(FeedRepository::new(db.pool()).count().await.unwrap(), 2);
        assert_eq!(ArticleRepository::new(db.pool()).count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_refresh_all_uses_stored_feeds() {
        let db = setup_db().await;
        let repo = FeedRepository::new(db.pool());
        repo.merge_batch(
            &[
                FetchedFeed::new("https://a.example.com/feed.xml", "A"),
                FetchedFeed::new("https://b.example.com/feed.xml", "B"),
            ],
            &[],
        )
        .await
        .unwrap();

        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .ok("https://a.example.com/feed.xml", "A", &["a-1"])
                .ok("https://b.example.com/feed.xml", "B", &["b-1"]),
        );
        let service = RefreshService::new(&db, fetcher);

        let outcome = service.refresh_all(None).await.unwrap();
        assert_eq!(outcome.feeds_updated, 2);
        assert_eq!(outcome.articles_added, 2);
    }

    #[tokio::test]
    async fn test_retrieve_or_refresh_creates_unknown_feed() {
        let db = setup_db().await;
        let fetcher = Arc::new(ScriptedFetcher::new().ok(
            "https://new.example.com/feed.xml",
            "Brand New",
            &["n-1", "n-2"],
        ));
        let service = RefreshService::new(&db, fetcher);

        let feed = service
            .retrieve_or_refresh("https://new.example.com/feed.xml")
            .await
            .unwrap();

        assert!(feed.is_stored());
        assert_eq!(feed.title, "Brand New");

        assert_eq!(FeedRepository::new(db.pool()).count().await.unwrap(), 1);
        assert_eq!(
            ArticleRepository::new(db.pool())
                .count_by_feed(feed.id)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_retrieve_or_refresh_existing_feed_keeps_row() {
        let db = setup_db().await;
        let repo = FeedRepository::new(db.pool());
        repo.merge_batch(
            &[FetchedFeed::new("https://a.example.com/feed.xml", "Old Title")],
            &[],
        )
        .await
        .unwrap();
        let before = repo
            .get_by_url("https://a.example.com/feed.xml")
            .await
            .unwrap()
            .unwrap();

        let fetcher = Arc::new(ScriptedFetcher::new().ok(
            "https://a.example.com/feed.xml",
            "New Title",
            &[],
        ));
        let service = RefreshService::new(&db, fetcher);

        let feed = service
            .retrieve_or_refresh("https://a.example.com/feed.xml")
            .await
            .unwrap();

        assert_eq!(feed.id, before.id);
        assert_eq!(feed.title, "New Title");
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retrieve_or_refresh_rejects_blank_url() {
        let db = setup_db().await;
        let fetcher = Arc::new(ScriptedFetcher::new());
        let service = RefreshService::new(&db, fetcher);

        let result = service.retrieve_or_refresh("").await;
        assert!(matches!(result, Err(GranaryError::Validation(_))));

        let result = service.retrieve_or_refresh("   ").await;
        assert!(matches!(result, Err(GranaryError::Validation(_))));

        assert_eq!(FeedRepository::new(db.pool()).count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_single_fetch_failure_returns_prior_state() {
        let db = setup_db().await;
        let repo = FeedRepository::new(db.pool());
        repo.merge_batch(
            &[FetchedFeed::new("https://a.example.com/feed.xml", "Stable")],
            &[],
        )
        .await
        .unwrap();
        let stored = repo
            .get_by_url("https://a.example.com/feed.xml")
            .await
            .unwrap()
            .unwrap();

        let fetcher = Arc::new(ScriptedFetcher::new().fail("https://a.example.com/feed.xml"));
        let service = RefreshService::new(&db, fetcher);

        let feed = service.refresh_single(stored.clone()).await.unwrap();
        assert_eq!(feed.id, stored.id);
        assert_eq!(feed.title, "Stable");

        // The stored row is untouched
        let after = repo
            .get_by_url("https://a.example.com/feed.xml")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.title, "Stable");
    }

    #[tokio::test]
    async fn test_refresh_batch_all_failing_reaches_terminal() {
        let db = setup_db().await;
        let fetcher = Arc::new(
            ScriptedFetcher::new()
                .fail("https://a.example.com/feed.xml")
                .fail("https://b.example.com/feed.xml"),
        );
        let service = RefreshService::new(&db, fetcher);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let feeds = subscriptions(&[
            "https://a.example.com/feed.xml",
            "https://b.example.com/feed.xml",
        ]);
        let outcome = service.refresh_batch(feeds, Some(tx)).await.unwrap();

        assert_eq!(outcome, MergeOutcome::default());

        let reports = drain(&mut rx);
        let terminal = reports.last().unwrap();
        assert!(terminal.is_terminal());
        assert_eq!(terminal.completed, 2);
        assert_eq!(terminal.failed, 2);

        assert_eq!(FeedRepository::new(db.pool()).count().await.unwrap(), 0);
    }
}
