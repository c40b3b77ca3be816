//! Feed domain types for Granary.

use chrono::{DateTime, Utc};

/// Maximum length in characters for article body content.
pub const MAX_BODY_LENGTH: usize = 65_536;

/// Maximum feed icon size in bytes (512KB).
pub const MAX_ICON_SIZE: u64 = 512 * 1024;

/// A subscribed feed source.
///
/// The canonical subscription URL is the stable identity; the surrogate
/// `id` is assigned by the store on first merge and preserved afterwards.
#[derive(Debug, Clone)]
pub struct Feed {
    /// Surrogate row id (0 for a not-yet-persisted subscription).
    pub id: i64,
    /// Canonical subscription URL.
    pub url: String,
    /// Feed title.
    pub title: String,
    /// Site URL (the website the feed belongs to).
    pub site_url: Option<String>,
    /// Feed description.
    pub description: Option<String>,
    /// Cached icon image bytes.
    pub icon: Option<Vec<u8>>,
    /// Last time the feed was successfully fetched and merged.
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// When the feed row was created.
    pub created_at: DateTime<Utc>,
    /// When the feed row was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Feed {
    /// Build a subscription for an identity that is not stored yet.
    ///
    /// `id` stays 0 until a merge persists the source; everything except
    /// the URL is empty.
    pub fn subscription(url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            url: url.into(),
            title: String::new(),
            site_url: None,
            description: None,
            icon: None,
            last_fetched_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this feed has been persisted.
    pub fn is_stored(&self) -> bool {
        self.id > 0
    }
}

/// An article observed in a feed document.
///
/// `title`, `link`, `author`, `body` and `published_at` come from the
/// document and are overwritten on re-observation; `is_read` and
/// `is_favorite` are user state and are never touched by a refresh.
#[derive(Debug, Clone)]
pub struct Article {
    /// Article row id.
    pub id: i64,
    /// Feed this article belongs to.
    pub feed_id: i64,
    /// Document-provided stable key (RSS guid or Atom id).
    pub guid: String,
    /// Article title.
    pub title: String,
    /// Link to the original article.
    pub link: Option<String>,
    /// Author name.
    pub author: Option<String>,
    /// Article body; may contain markup.
    pub body: Option<String>,
    /// When the article was published.
    pub published_at: Option<DateTime<Utc>>,
    /// Whether the user has read the article.
    pub is_read: bool,
    /// Whether the user has marked the article as a favorite.
    pub is_favorite: bool,
    /// When the article was last observed in a fetch.
    pub fetched_at: DateTime<Utc>,
}

/// Feed source descriptor as parsed from a fetched document.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    /// Canonical subscription URL, echoed from the fetch input.
    pub url: String,
    /// Feed title.
    pub title: String,
    /// Site URL.
    pub site_url: Option<String>,
    /// Feed description.
    pub description: Option<String>,
    /// Icon image bytes, when the document advertised one and it was
    /// retrieved.
    pub icon: Option<Vec<u8>>,
}

impl FetchedFeed {
    /// Create a fetched feed descriptor.
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            site_url: None,
            description: None,
            icon: None,
        }
    }

    /// Set the site URL.
    pub fn with_site_url(mut self, site_url: impl Into<String>) -> Self {
        self.site_url = Some(site_url.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the icon bytes.
    pub fn with_icon(mut self, icon: Vec<u8>) -> Self {
        self.icon = Some(icon);
        self
    }
}

/// Article as parsed from a fetched document, keyed by owner feed URL
/// until the merge resolves the surrogate id.
#[derive(Debug, Clone)]
pub struct FetchedArticle {
    /// Canonical URL of the owning feed.
    pub feed_url: String,
    /// Document-provided stable key.
    pub guid: String,
    /// Article title.
    pub title: String,
    /// Link to the original article.
    pub link: Option<String>,
    /// Author name.
    pub author: Option<String>,
    /// Article body; markup is preserved.
    pub body: Option<String>,
    /// When the article was published.
    pub published_at: Option<DateTime<Utc>>,
}

impl FetchedArticle {
    /// Create a fetched article.
    pub fn new(
        feed_url: impl Into<String>,
        guid: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            feed_url: feed_url.into(),
            guid: guid.into(),
            title: title.into(),
            link: None,
            author: None,
            body: None,
            published_at: None,
        }
    }

    /// Set the link.
    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    /// Set the author.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Set the body, truncating overlong content.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        if body.chars().count() > MAX_BODY_LENGTH {
            self.body = Some(body.chars().take(MAX_BODY_LENGTH).collect());
        } else {
            self.body = Some(body);
        }
        self
    }

    /// Set the published date.
    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }
}

/// Progress report emitted while a batch refresh runs.
///
/// One report is emitted per settled fetch attempt with `feed` set to the
/// source that just settled; a final terminal report with `feed == None`
/// follows once the batch has been merged.
#[derive(Debug, Clone)]
pub struct RefreshProgress {
    /// Number of fetch attempts settled so far.
    pub completed: usize,
    /// Batch size, fixed when the batch starts.
    pub total: usize,
    /// Number of settled attempts that failed so far.
    pub failed: usize,
    /// The source that just settled, or None for the terminal report.
    pub feed: Option<Feed>,
}

impl RefreshProgress {
    /// Whether this is the terminal report of a batch.
    pub fn is_terminal(&self) -> bool {
        self.feed.is_none()
    }
}

/// Row counts produced by a merge batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Feed sources inserted.
    pub feeds_added: usize,
    /// Existing feed sources whose origin metadata was refreshed.
    pub feeds_updated: usize,
    /// Articles inserted.
    pub articles_added: usize,
    /// Existing articles whose origin fields were refreshed.
    pub articles_updated: usize,
}
