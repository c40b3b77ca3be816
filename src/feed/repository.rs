//! Feed and article repositories for Granary.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::types::{Article, Feed, FetchedArticle, FetchedFeed, MergeOutcome};
use crate::db::DbPool;
use crate::error::{GranaryError, Result};

/// Row type for a feed from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct FeedRow {
    id: i64,
    url: String,
    title: String,
    site_url: Option<String>,
    description: Option<String>,
    icon: Option<Vec<u8>>,
    last_fetched_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<FeedRow> for Feed {
    fn from(row: FeedRow) -> Self {
        Feed {
            id: row.id,
            url: row.url,
            title: row.title,
            site_url: row.site_url,
            description: row.description,
            icon: row.icon,
            last_fetched_at: row.last_fetched_at.and_then(|s| parse_datetime(&s)),
            created_at: parse_datetime(&row.created_at).unwrap_or_else(Utc::now),
            updated_at: parse_datetime(&row.updated_at).unwrap_or_else(Utc::now),
        }
    }
}

/// Row type for an article from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ArticleRow {
    id: i64,
    feed_id: i64,
    guid: String,
    title: String,
    link: Option<String>,
    author: Option<String>,
    body: Option<String>,
    published_at: Option<String>,
    is_read: bool,
    is_favorite: bool,
    fetched_at: String,
}

impl From<ArticleRow> for Article {
    fn from(row: ArticleRow) -> Self {
        Article {
            id: row.id,
            feed_id: row.feed_id,
            guid: row.guid,
            title: row.title,
            link: row.link,
            author: row.author,
            body: row.body,
            published_at: row.published_at.and_then(|s| parse_datetime(&s)),
            is_read: row.is_read,
            is_favorite: row.is_favorite,
            fetched_at: parse_datetime(&row.fetched_at).unwrap_or_else(Utc::now),
        }
    }
}

/// Repository for feed operations.
pub struct FeedRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> FeedRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Get a feed by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Feed>> {
        let row = sqlx::query_as::<_, FeedRow>(
            r#"
            SELECT id, url, title, site_url, description, icon,
                   last_fetched_at, created_at, updated_at
            FROM feeds
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(row.map(Feed::from))
    }

    /// Get a feed by its canonical subscription URL.
    pub async fn get_by_url(&self, url: &str) -> Result<Option<Feed>> {
        let row = sqlx::query_as::<_, FeedRow>(
            r#"
            SELECT id, url, title, site_url, description, icon,
                   last_fetched_at, created_at, updated_at
            FROM feeds
            WHERE url = $1
            "#,
        )
        .bind(url)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(row.map(Feed::from))
    }

    /// List all feeds (ordered by subscription order).
    pub async fn list_all(&self) -> Result<Vec<Feed>> {
        let rows = sqlx::query_as::<_, FeedRow>(
            r#"
            SELECT id, url, title, site_url, description, icon,
                   last_fetched_at, created_at, updated_at
            FROM feeds
            ORDER BY id ASC
            "#,
        )
        .fetch_all(self.pool)
        .await
        .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(Feed::from).collect())
    }

    /// Count all feeds.
    pub async fn count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds")
            .fetch_one(self.pool)
            .await
            .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(count.0)
    }

    /// Delete a feed (unsubscribe). Articles cascade.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = $1")
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Fold one refresh batch into the store, atomically.
    ///
    /// Feeds are matched by canonical URL: existing rows get their origin
    /// metadata overwritten (the cached icon is kept when the fetch produced
    /// none), unknown URLs become new rows. Articles are matched by
    /// `(feed_id, guid)`: unseen ones are inserted unread, re-observed ones
    /// get an origin-field update that leaves `is_read` and `is_favorite`
    /// untouched. An article whose owner URL is neither in this batch nor
    /// already stored aborts the whole merge.
    ///
    /// Everything happens inside a single transaction; on any error no rows
    /// from the batch become visible.
    pub async fn merge_batch(
        &self,
        feeds: &[FetchedFeed],
        articles: &[FetchedArticle],
    ) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome::default();
        let now = Utc::now().to_rfc3339();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| GranaryError::Database(e.to_string()))?;

        // Canonical URL -> feed id for every row this batch touches.
        let mut feed_ids: HashMap<String, i64> = HashMap::new();

        for feed in feeds {
            let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM feeds WHERE url = $1")
                .bind(&feed.url)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| GranaryError::Database(e.to_string()))?;

            let id = match existing {
                Some((id,)) => {
                    sqlx::query(
                        r#"
                        UPDATE feeds
                        SET title = $1, site_url = $2, description = $3,
                            last_fetched_at = $4, updated_at = $5
                        WHERE id = $6
                        "#,
                    )
                    .bind(&feed.title)
                    .bind(&feed.site_url)
                    .bind(&feed.description)
                    .bind(&now)
                    .bind(&now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| GranaryError::Database(e.to_string()))?;

                    // A document that stops advertising an icon does not
                    // erase the cached one.
                    if let Some(ref icon) = feed.icon {
                        sqlx::query("UPDATE feeds SET icon = $1 WHERE id = $2")
                            .bind(icon.as_slice())
                            .bind(id)
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| GranaryError::Database(e.to_string()))?;
                    }

                    outcome.feeds_updated += 1;
                    id
                }
                None => {
                    let id: i64 = sqlx::query_scalar(
                        r#"
                        INSERT INTO feeds (url, title, site_url, description, icon, last_fetched_at)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        RETURNING id
                        "#,
                    )
                    .bind(&feed.url)
                    .bind(&feed.title)
                    .bind(&feed.site_url)
                    .bind(&feed.description)
                    .bind(&feed.icon)
                    .bind(&now)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| GranaryError::Database(e.to_string()))?;

                    outcome.feeds_added += 1;
                    id
                }
            };

            feed_ids.insert(feed.url.clone(), id);
        }

        for article in articles {
            let feed_id = match feed_ids.get(&article.feed_url) {
                Some(id) => *id,
                None => {
                    let row: Option<(i64,)> =
                        sqlx::query_as("SELECT id FROM feeds WHERE url = $1")
                            .bind(&article.feed_url)
                            .fetch_optional(&mut *tx)
                            .await
                            .map_err(|e| GranaryError::Database(e.to_string()))?;

                    match row {
                        Some((id,)) => {
                            feed_ids.insert(article.feed_url.clone(), id);
                            id
                        }
                        None => {
                            // Dropping the transaction rolls back everything
                            // merged so far.
                            return Err(GranaryError::Validation(format!(
                                "article {} references unknown feed {}",
                                article.guid, article.feed_url
                            )));
                        }
                    }
                }
            };

            let published_at = article.published_at.map(|dt| dt.to_rfc3339());

            let existing: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM articles WHERE feed_id = $1 AND guid = $2")
                    .bind(feed_id)
                    .bind(&article.guid)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| GranaryError::Database(e.to_string()))?;

            match existing {
                Some((id,)) => {
                    // Origin fields only. is_read and is_favorite are user
                    // state and must survive every refresh.
                    sqlx::query(
                        r#"
                        UPDATE articles
                        SET title = $1, link = $2, author = $3, body = $4,
                            published_at = $5, fetched_at = $6
                        WHERE id = $7
                        "#,
                    )
                    .bind(&article.title)
                    .bind(&article.link)
                    .bind(&article.author)
                    .bind(&article.body)
                    .bind(&published_at)
                    .bind(&now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| GranaryError::Database(e.to_string()))?;

                    outcome.articles_updated += 1;
                }
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO articles
                            (feed_id, guid, title, link, author, body, published_at, fetched_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        "#,
                    )
                    .bind(feed_id)
                    .bind(&article.guid)
                    .bind(&article.title)
                    .bind(&article.link)
                    .bind(&article.author)
                    .bind(&article.body)
                    .bind(&published_at)
                    .bind(&now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| GranaryError::Database(e.to_string()))?;

                    outcome.articles_added += 1;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(outcome)
    }
}

/// Repository for article operations.
pub struct ArticleRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> ArticleRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Get an article by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Article>> {
        let row = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT id, feed_id, guid, title, link, author, body, published_at,
                   is_read, is_favorite, fetched_at
            FROM articles
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(row.map(Article::from))
    }

    /// Get an article by feed ID and guid.
    pub async fn get_by_guid(&self, feed_id: i64, guid: &str) -> Result<Option<Article>> {
        let row = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT id, feed_id, guid, title, link, author, body, published_at,
                   is_read, is_favorite, fetched_at
            FROM articles
            WHERE feed_id = $1 AND guid = $2
            "#,
        )
        .bind(feed_id)
        .bind(guid)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(row.map(Article::from))
    }

    /// List articles for a feed (newest first).
    pub async fn list_by_feed(
        &self,
        feed_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Article>> {
        let rows = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT id, feed_id, guid, title, link, author, body, published_at,
                   is_read, is_favorite, fetched_at
            FROM articles
            WHERE feed_id = $1
            ORDER BY COALESCE(published_at, fetched_at) DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(feed_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(self.pool)
        .await
        .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(Article::from).collect())
    }

    /// Count all articles.
    pub async fn count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(self.pool)
            .await
            .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(count.0)
    }

    /// Count articles for a feed.
    pub async fn count_by_feed(&self, feed_id: i64) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles WHERE feed_id = $1")
            .bind(feed_id)
            .fetch_one(self.pool)
            .await
            .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(count.0)
    }

    /// Count unread articles for a feed.
    pub async fn count_unread(&self, feed_id: i64) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM articles WHERE feed_id = $1 AND is_read = 0")
                .bind(feed_id)
                .fetch_one(self.pool)
                .await
                .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(count.0)
    }

    /// Set the read flag on an article.
    pub async fn mark_read(&self, id: i64, read: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE articles SET is_read = $1 WHERE id = $2")
            .bind(read)
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Set the favorite flag on an article.
    pub async fn mark_favorite(&self, id: i64, favorite: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE articles SET is_favorite = $1 WHERE id = $2")
            .bind(favorite)
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| GranaryError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

/// Parse a datetime string to DateTime<Utc>.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // RFC3339 first, then the SQLite datetime('now') format
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    None
}
