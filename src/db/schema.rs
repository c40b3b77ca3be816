//! Database schema and migrations for Granary.
//!
//! Migrations are applied sequentially when the database is opened.
//! The schema_version table tracks which migrations have been applied.

/// Database migrations.
///
/// Each migration is a SQL script executed in order, one transaction per
/// migration.
pub const MIGRATIONS: &[&str] = &[
    // v1: Initial schema - feeds and articles
    r#"
-- Subscribed feed sources, identified by their canonical URL
CREATE TABLE feeds (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    url             TEXT NOT NULL UNIQUE,
    title           TEXT NOT NULL DEFAULT '',
    site_url        TEXT,
    description     TEXT,
    last_fetched_at TEXT,
    created_at      TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Articles observed in feed documents; (feed_id, guid) is the identity.
-- is_read / is_favorite are user state and survive refreshes.
CREATE TABLE articles (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    feed_id      INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    guid         TEXT NOT NULL,
    title        TEXT NOT NULL DEFAULT '',
    link         TEXT,
    author       TEXT,
    body         TEXT,
    published_at TEXT,
    is_read      INTEGER NOT NULL DEFAULT 0,
    is_favorite  INTEGER NOT NULL DEFAULT 0,
    fetched_at   TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(feed_id, guid)
);

CREATE INDEX idx_articles_feed_id ON articles(feed_id);
CREATE INDEX idx_articles_published_at ON articles(published_at);
"#,
    // v2: Cached feed icon image
    r#"
ALTER TABLE feeds ADD COLUMN icon BLOB;
"#,
    // v3: Index for unread lookups
    r#"
CREATE INDEX idx_articles_unread ON articles(feed_id, is_read);
"#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_not_empty() {
        assert!(!MIGRATIONS.is_empty());
    }

    #[test]
    fn test_first_migration_creates_core_tables() {
        let first = MIGRATIONS[0];
        assert!(first.contains("CREATE TABLE feeds"));
        assert!(first.contains("CREATE TABLE articles"));
        assert!(first.contains("url"));
        assert!(first.contains("guid"));
    }

    #[test]
    fn test_feed_identity_is_unique() {
        assert!(MIGRATIONS[0].contains("url             TEXT NOT NULL UNIQUE"));
    }

    #[test]
    fn test_article_identity_is_unique_per_feed() {
        assert!(MIGRATIONS[0].contains("UNIQUE(feed_id, guid)"));
    }

    #[test]
    fn test_articles_cascade_on_feed_delete() {
        assert!(MIGRATIONS[0].contains("ON DELETE CASCADE"));
    }

    #[test]
    fn test_icon_migration() {
        assert!(MIGRATIONS[1].contains("ADD COLUMN icon BLOB"));
    }

    #[test]
    fn test_no_migration_is_blank() {
        for migration in MIGRATIONS {
            assert!(!migration.trim().is_empty());
        }
    }
}
