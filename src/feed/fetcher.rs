//! Feed fetching for Granary.
//!
//! Retrieves and parses RSS/Atom documents over HTTP with SSRF protection
//! and resource limits. The `FeedFetcher` trait is the seam the refresh
//! orchestrator works against; `HttpFeedFetcher` is the production
//! implementation.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use feed_rs::parser;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::RefreshConfig;
use crate::error::{GranaryError, Result};
use crate::feed::types::{FetchedArticle, FetchedFeed, MAX_ICON_SIZE};

/// User agent string for outbound requests.
const USER_AGENT: &str = "granary/0.1 (+https://github.com/granary/granary)";

/// Result of fetching one feed source: the updated source descriptor and
/// the full list of articles currently present in the document.
pub type FetchOutcome = (FetchedFeed, Vec<FetchedArticle>);

/// Turns one feed-source URL into fetched feed data, or a failure.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Fetch and parse the feed at `url`.
    async fn fetch(&self, url: &str) -> Result<FetchOutcome>;
}

/// HTTP feed fetcher.
pub struct HttpFeedFetcher {
    client: Client,
    max_feed_size: u64,
    max_articles: usize,
    fetch_icons: bool,
    allow_private_hosts: bool,
}

impl HttpFeedFetcher {
    /// Create a fetcher from the refresh configuration.
    pub fn new(config: &RefreshConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .timeout(Duration::from_secs(config.total_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| GranaryError::Fetch(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_feed_size: config.max_feed_size_bytes,
            max_articles: config.max_articles_per_feed,
            fetch_icons: config.fetch_icons,
            allow_private_hosts: config.allow_private_hosts,
        })
    }

    /// GET a URL, enforcing validation and a size cap.
    async fn download(&self, url: &str, max_size: u64) -> Result<Vec<u8>> {
        validate_url(url, self.allow_private_hosts)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GranaryError::Fetch(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GranaryError::Fetch(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        // Declared size first, actual size after the read; either can lie
        // independently.
        if let Some(length) = response.content_length() {
            if length > max_size {
                return Err(GranaryError::Fetch(format!(
                    "response too large: {length} bytes (max {max_size})"
                )));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GranaryError::Fetch(format!("failed to read response: {e}")))?;

        if bytes.len() as u64 > max_size {
            return Err(GranaryError::Fetch(format!(
                "response too large: {} bytes (max {max_size})",
                bytes.len()
            )));
        }

        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchOutcome> {
        debug!("Fetching feed {}", url);

        let body = self.download(url, self.max_feed_size).await?;
        let parsed = parse_document(url, &body, self.max_articles)?;

        let mut feed = parsed.feed;
        if self.fetch_icons {
            if let Some(icon_url) = parsed.icon_url {
                match self.download(&icon_url, MAX_ICON_SIZE).await {
                    Ok(bytes) if !bytes.is_empty() => feed.icon = Some(bytes),
                    Ok(_) => {}
                    Err(e) => warn!("Failed to fetch icon for {}: {}", url, e),
                }
            }
        }

        Ok((feed, parsed.articles))
    }
}

/// Validate a URL before fetching.
///
/// Rejects non-HTTP schemes and, unless `allow_private_hosts` is set,
/// private/reserved addresses and hostnames that resolve inside typical
/// intranets.
pub fn validate_url(url: &str, allow_private_hosts: bool) -> Result<()> {
    let parsed =
        url::Url::parse(url).map_err(|e| GranaryError::Fetch(format!("invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(GranaryError::Fetch(format!(
                "unsupported URL scheme: {scheme}"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| GranaryError::Fetch("URL has no host".to_string()))?;

    if allow_private_hosts {
        return Ok(());
    }

    match host {
        url::Host::Domain(domain) => {
            if is_reserved_hostname(domain) {
                return Err(GranaryError::Fetch(format!(
                    "refusing to fetch from host: {domain}"
                )));
            }
        }
        url::Host::Ipv4(ip) => {
            if is_reserved_ip(&IpAddr::V4(ip)) {
                return Err(GranaryError::Fetch(format!(
                    "refusing to fetch from address: {ip}"
                )));
            }
        }
        url::Host::Ipv6(ip) => {
            if is_reserved_ip(&IpAddr::V6(ip)) {
                return Err(GranaryError::Fetch(format!(
                    "refusing to fetch from address: {ip}"
                )));
            }
        }
    }

    Ok(())
}

/// Hostname suffixes that never belong to a public feed.
const RESERVED_SUFFIXES: &[&str] = &[
    ".localhost",
    ".local",
    ".internal",
    ".intranet",
    ".lan",
    ".home",
    ".corp",
];

fn is_reserved_hostname(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "localhost" || RESERVED_SUFFIXES.iter().any(|s| host.ends_with(s))
}

fn is_reserved_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.octets()[0] >= 224
                || is_documentation_ip(v4)
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || (segments[0] & 0xfe00) == 0xfc00
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

// TEST-NET-1 through TEST-NET-3
fn is_documentation_ip(v4: &Ipv4Addr) -> bool {
    matches!(
        v4.octets(),
        [192, 0, 2, _] | [198, 51, 100, _] | [203, 0, 113, _]
    )
}

/// Parsed form of one fetched document.
struct ParsedDocument {
    feed: FetchedFeed,
    articles: Vec<FetchedArticle>,
    icon_url: Option<String>,
}

/// Parse feed document bytes into the transient fetch types.
///
/// `url` is the canonical subscription URL the articles are keyed by.
fn parse_document(url: &str, bytes: &[u8], max_articles: usize) -> Result<ParsedDocument> {
    let document = parser::parse(bytes)
        .map_err(|e| GranaryError::Fetch(format!("failed to parse feed: {e}")))?;

    let title = document
        .title
        .map(|t| t.content)
        .unwrap_or_else(|| "Untitled Feed".to_string());

    let mut feed = FetchedFeed::new(url, title);
    if let Some(link) = document.links.first() {
        feed = feed.with_site_url(link.href.clone());
    }
    if let Some(description) = document.description {
        feed = feed.with_description(description.content);
    }

    let icon_url = document
        .icon
        .map(|i| i.uri)
        .or_else(|| document.logo.map(|l| l.uri));

    let articles = document
        .entries
        .into_iter()
        .take(max_articles)
        .map(|entry| {
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());

            let mut article = FetchedArticle::new(url, entry.id, title);
            if let Some(link) = entry.links.first() {
                article = article.with_link(link.href.clone());
            }
            if let Some(author) = entry.authors.first() {
                article = article.with_author(author.name.clone());
            }
            let body = entry
                .summary
                .map(|t| t.content)
                .or(entry.content.and_then(|c| c.body));
            if let Some(body) = body {
                article = article.with_body(body);
            }
            if let Some(published_at) = entry.published.or(entry.updated) {
                article = article.with_published_at(published_at);
            }
            article
        })
        .collect();

    Ok(ParsedDocument {
        feed,
        articles,
        icon_url,
    })
}
