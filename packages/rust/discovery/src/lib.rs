//! Sitemap discovery for sitemap crawl origins.
//!
//! A sitemap origin enumerates its pages up front instead of scraping links.
//! [`HttpSitemapReader`] fetches the sitemap, and when it is a sitemap index,
//! fetches each child sitemap one level deep.

mod parser;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};
use url::Url;

use webindex_crawler::{is_ssrf_target, status_error};
use webindex_shared::{IndexError, Result};

pub use parser::SitemapDocument;

/// Maximum number of redirects to follow when fetching a sitemap.
const MAX_REDIRECTS: usize = 3;

/// Default timeout in seconds for fetching a sitemap.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum response size we consider valid (50 MB, the protocol limit).
const MAX_RESPONSE_SIZE: u64 = 50 * 1024 * 1024;

/// Maximum URLs returned for one origin.
const MAX_URLS: usize = 50_000;

/// User-Agent string for discovery requests.
const USER_AGENT: &str = concat!("webindex/", env!("CARGO_PKG_VERSION"));

/// Enumerate the page URLs listed by a sitemap.
#[async_trait]
pub trait SitemapReader: Send + Sync {
    async fn read(&self, url: &str) -> Result<Vec<String>>;
}

/// Configuration for the HTTP sitemap reader.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Timeout for HTTP requests in seconds.
    pub timeout_secs: u64,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    pub allow_localhost: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            allow_localhost: false,
        }
    }
}

/// Reads `<urlset>` and `<sitemapindex>` documents over HTTP.
pub struct HttpSitemapReader {
    client: Client,
    allow_localhost: bool,
}

impl HttpSitemapReader {
    pub fn new(opts: &DiscoveryOptions) -> Result<Self> {
        Ok(Self {
            client: build_client(opts)?,
            allow_localhost: opts.allow_localhost,
        })
    }

    async fn fetch_document(&self, url: &str) -> Result<SitemapDocument> {
        let parsed = Url::parse(url)
            .map_err(|e| IndexError::validation(format!("invalid sitemap url '{url}': {e}")))?;
        if !self.allow_localhost && is_ssrf_target(&parsed) {
            return Err(IndexError::validation(format!(
                "blocked non-public sitemap url '{url}'"
            )));
        }

        let body = fetch_and_validate(&self.client, parsed.as_str()).await?;
        parser::parse_sitemap(&body)
    }
}

#[async_trait]
impl SitemapReader for HttpSitemapReader {
    #[instrument(skip_all, fields(url = %url))]
    async fn read(&self, url: &str) -> Result<Vec<String>> {
        let mut urls = Vec::new();

        match self.fetch_document(url).await? {
            SitemapDocument::UrlSet(locs) => urls.extend(locs),
            SitemapDocument::Index(children) => {
                info!(children = children.len(), "sitemap index found");
                for child in children {
                    match self.fetch_document(&child).await {
                        Ok(SitemapDocument::UrlSet(locs)) => urls.extend(locs),
                        Ok(SitemapDocument::Index(_)) => {
                            debug!(%child, "nested sitemap index ignored");
                        }
                        Err(e) => warn!(%child, error = %e, "child sitemap failed"),
                    }
                }
            }
        }

        let urls = dedupe_http_urls(urls);
        info!(count = urls.len(), "sitemap read");
        Ok(urls)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Keep absolute http(s) URLs, first occurrence order, capped at [`MAX_URLS`].
fn dedupe_http_urls(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for url in urls {
        let keep = Url::parse(&url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false);
        if !keep {
            debug!(%url, "skipping non-http sitemap entry");
            continue;
        }
        if seen.insert(url.clone()) {
            out.push(url);
            if out.len() == MAX_URLS {
                warn!(max = MAX_URLS, "sitemap url cap reached");
                break;
            }
        }
    }
    out
}

/// Build a reqwest client with appropriate settings.
fn build_client(opts: &DiscoveryOptions) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(opts.timeout_secs))
        .build()
        .map_err(|e| IndexError::Network(format!("failed to build HTTP client: {e}")))
}

/// Fetch a URL and return its body, enforcing the size limit.
async fn fetch_and_validate(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| IndexError::Network(format!("{url}: {e}")))?;

    if let Some(err) = status_error(response.status(), url) {
        return Err(err);
    }

    if let Some(len) = response.content_length() {
        if len > MAX_RESPONSE_SIZE {
            return Err(IndexError::validation(format!(
                "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
            )));
        }
    }

    response
        .text()
        .await
        .map_err(|e| IndexError::Network(format!("{url}: failed to read body: {e}")))
}
