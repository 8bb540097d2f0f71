//! Core domain types for indexed web content.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IndexError, Result};

/// Crawl depth used when an origin does not set `maxDepth`.
pub const DEFAULT_MAX_DEPTH: u32 = 3;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for indexed item identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexId(pub Uuid);

impl IndexId {
    /// Generate a new time-sortable identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for IndexId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IndexId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Tenant identifier. Opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(pub String);

impl OrgId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// IndexStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an indexed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexStatus {
    Pending,
    Processing,
    Scraped,
    Done,
    /// Lowest-priority pending work, drained after everything else.
    PendingClean,
    Skipped,
    Error,
    /// Child of a re-crawled origin that has not been rediscovered yet.
    Outdated,
}

impl IndexStatus {
    /// Every status, in declaration order.
    pub const ALL: [IndexStatus; 8] = [
        Self::Pending,
        Self::Processing,
        Self::Scraped,
        Self::Done,
        Self::PendingClean,
        Self::Skipped,
        Self::Error,
        Self::Outdated,
    ];

    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Scraped => "SCRAPED",
            Self::Done => "DONE",
            Self::PendingClean => "PENDING_CLEAN",
            Self::Skipped => "SKIPPED",
            Self::Error => "ERROR",
            Self::Outdated => "OUTDATED",
        }
    }

    /// Whether the item is waiting for the stepper or a queue consumer.
    pub fn is_awaiting_work(&self) -> bool {
        matches!(self, Self::Pending | Self::Scraped | Self::PendingClean)
    }

    /// Whether no further processing happens without an explicit request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Skipped | Self::Error | Self::Outdated
        )
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexStatus {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| IndexError::parse(format!("unknown index status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// ScrapeOptions
// ---------------------------------------------------------------------------

/// How fetched HTML is turned into indexable text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformStrategy {
    #[default]
    Markdown,
    Llm,
}

/// Per-origin fetch and crawl options. Children inherit their origin's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScrapeOptions {
    pub strip_links: bool,
    pub strip_images: bool,
    pub strip_header: bool,
    pub strip_footer: bool,
    /// CSS selectors removed before conversion.
    pub strip_queries: Vec<String>,
    pub allow_subdomains: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_links_regexp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_links_regexp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    pub transform_strategy: TransformStrategy,
}

impl ScrapeOptions {
    /// Crawl depth limit, falling back to [`DEFAULT_MAX_DEPTH`].
    pub fn effective_max_depth(&self) -> u32 {
        self.max_depth.unwrap_or(DEFAULT_MAX_DEPTH)
    }

    /// Reject options that would fail later in the pipeline.
    pub fn validate(&self) -> Result<()> {
        for (name, pattern) in [
            ("allowLinksRegexp", &self.allow_links_regexp),
            ("excludeLinksRegexp", &self.exclude_links_regexp),
        ] {
            if let Some(pattern) = pattern {
                Regex::new(pattern).map_err(|e| {
                    IndexError::validation(format!("invalid {name} '{pattern}': {e}"))
                })?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IndexedItem
// ---------------------------------------------------------------------------

/// One unit of indexed content, unique per (organization, normalized URL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedItem {
    pub id: IndexId,
    pub org_id: OrgId,
    /// URL as submitted or discovered.
    pub url: String,
    /// Dedup key, see [`crate::normalize_url`].
    pub normalized_url: String,

    pub do_crawl: bool,
    pub is_sitemap: bool,
    /// Crawl origin this item was discovered from; `None` for roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub found_from_index_id: Option<IndexId>,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrape_options: Option<ScrapeOptions>,

    pub status: IndexStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub skip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    /// SHA-256 of the stored content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Stored content was cut at the configured size cap.
    pub truncated: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<DateTime<Utc>>,
}

impl IndexedItem {
    /// Roots have no crawl parent.
    pub fn is_root(&self) -> bool {
        self.found_from_index_id.is_none()
    }

    /// Options for this item's own fetch, defaulted when unset.
    pub fn options(&self) -> ScrapeOptions {
        self.scrape_options.clone().unwrap_or_default()
    }
}
