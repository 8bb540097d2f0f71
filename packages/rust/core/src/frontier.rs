//! Crawl frontier expansion.
//!
//! Turns links discovered on a crawled page (or URLs listed by a sitemap)
//! into child items of the crawl origin. Children are keyed by
//! (org, normalized URL) and written with a conditional upsert: absent or
//! OUTDATED rows become PENDING, anything else is left alone.

use std::collections::HashSet;

use regex::Regex;
use tracing::{debug, info, instrument};
use url::Url;

use webindex_shared::{IndexError, IndexId, IndexedItem, Result, normalize_url};
use webindex_storage::{ChildUpsert, NewIndex, Storage};

/// Which links belong to an origin's crawl.
#[derive(Debug, Clone)]
pub struct CrawlScope {
    /// Origin host without one leading `www.`.
    host: String,
    allow_subdomains: bool,
    allow: Option<Regex>,
    exclude: Option<Regex>,
}

impl CrawlScope {
    pub fn for_origin(origin: &IndexedItem) -> Result<Self> {
        let url = Url::parse(&origin.url)
            .map_err(|e| IndexError::validation(format!("invalid origin url '{}': {e}", origin.url)))?;
        let host = url
            .host_str()
            .ok_or_else(|| IndexError::validation(format!("origin '{}' has no host", origin.url)))?;

        let options = origin.options();
        Ok(Self {
            host: strip_www(&host.to_ascii_lowercase()).to_string(),
            allow_subdomains: options.allow_subdomains,
            allow: compile(options.allow_links_regexp.as_deref())?,
            exclude: compile(options.exclude_links_regexp.as_deref())?,
        })
    }

    pub fn contains(&self, link: &str) -> bool {
        let Ok(url) = Url::parse(link) else {
            return false;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let host = strip_www(&host);

        let same_site = host == self.host
            || (self.allow_subdomains && host.ends_with(&format!(".{}", self.host)));
        if !same_site {
            return false;
        }
        if let Some(allow) = &self.allow {
            if !allow.is_match(link) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(link) {
                return false;
            }
        }
        true
    }
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

fn compile(pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| {
            Regex::new(p).map_err(|e| IndexError::validation(format!("invalid link regexp '{p}': {e}")))
        })
        .transpose()
}

/// Counts from one expansion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontierReport {
    pub discovered: usize,
    pub out_of_scope: usize,
    pub created: usize,
    pub restored: usize,
    pub untouched: usize,
    /// Ids of created or restored children, for dispatch.
    pub to_process: Vec<IndexId>,
}

/// Expand links found on `item`, a page of the crawl rooted at `origin`.
///
/// Links are dropped entirely when `item.depth` has reached the origin's
/// `maxDepth`.
#[instrument(skip_all, fields(origin = %origin.id, index_id = %item.id, depth = item.depth))]
pub async fn expand_links(
    storage: &Storage,
    origin: &IndexedItem,
    item: &IndexedItem,
    links: &[String],
) -> Result<FrontierReport> {
    let max_depth = origin.options().effective_max_depth();
    if item.depth >= max_depth {
        debug!(max_depth, links = links.len(), "depth limit reached, discarding links");
        return Ok(FrontierReport {
            discovered: links.len(),
            ..Default::default()
        });
    }

    let scope = CrawlScope::for_origin(origin)?;
    upsert_frontier(storage, origin, &scope, links, item.depth + 1).await
}

/// Insert the URLs of a sitemap origin as depth-1 children.
#[instrument(skip_all, fields(origin = %origin.id, urls = urls.len()))]
pub async fn expand_sitemap(
    storage: &Storage,
    origin: &IndexedItem,
    urls: &[String],
) -> Result<FrontierReport> {
    let scope = CrawlScope::for_origin(origin)?;
    upsert_frontier(storage, origin, &scope, urls, origin.depth + 1).await
}

async fn upsert_frontier(
    storage: &Storage,
    origin: &IndexedItem,
    scope: &CrawlScope,
    links: &[String],
    depth: u32,
) -> Result<FrontierReport> {
    let mut report = FrontierReport {
        discovered: links.len(),
        ..Default::default()
    };

    let mut seen = HashSet::new();
    let mut children = Vec::new();
    for link in links {
        if !scope.contains(link) {
            report.out_of_scope += 1;
            continue;
        }
        let Ok(key) = normalize_url(link) else {
            report.out_of_scope += 1;
            continue;
        };
        if key == origin.normalized_url || !seen.insert(key.clone()) {
            continue;
        }
        children.push(NewIndex::child(origin, link.as_str(), key, depth));
    }

    for outcome in storage.upsert_children(&children).await? {
        match outcome {
            ChildUpsert::Created(id) => {
                report.created += 1;
                report.to_process.push(id);
            }
            ChildUpsert::Restored(id) => {
                report.restored += 1;
                report.to_process.push(id);
            }
            ChildUpsert::Untouched(_) => report.untouched += 1,
        }
    }

    info!(
        discovered = report.discovered,
        created = report.created,
        restored = report.restored,
        untouched = report.untouched,
        out_of_scope = report.out_of_scope,
        "frontier expanded"
    );
    Ok(report)
}
