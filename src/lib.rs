//! Granary - feed reader cache service
//!
//! Concurrent refresh, merge and storage for RSS/Atom subscriptions.

pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod logging;

pub use config::Config;
pub use db::Database;
pub use error::{GranaryError, Result};
pub use feed::{
    start_updater, Article, ArticleRepository, Feed, FeedFetcher, FeedRepository, FeedUpdater,
    FetchOutcome, FetchedArticle, FetchedFeed, HttpFeedFetcher, MergeOutcome, ProgressSink,
    RefreshProgress, RefreshService, UpdaterHandle,
};
