//! Feed subscription and refresh module for Granary.
//!
//! This module provides feed fetching, storage and the concurrent batch
//! refresh pipeline.

pub mod fetcher;
pub mod repository;
pub mod service;
pub mod types;
pub mod updater;

pub use fetcher::{validate_url, FeedFetcher, FetchOutcome, HttpFeedFetcher};
pub use repository::{ArticleRepository, FeedRepository};
pub use service::{ProgressSink, RefreshService};
pub use types::{
    Article, Feed, FetchedArticle, FetchedFeed, MergeOutcome, RefreshProgress, MAX_BODY_LENGTH,
    MAX_ICON_SIZE,
};
pub use updater::{start_updater, FeedUpdater, UpdaterHandle, DEFAULT_UPDATE_INTERVAL_SECS};
