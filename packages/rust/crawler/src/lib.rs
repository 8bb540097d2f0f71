//! Page fetching for the indexing pipeline.
//!
//! This crate provides:
//! - [`Fetcher`]: the fetch contract the pipeline depends on
//! - [`HttpFetcher`]: reqwest-backed implementation with an SSRF guard
//! - [`LlmTransformer`]: optional LLM clean-up of converted Markdown

mod extract;
mod fetcher;
mod transform;

use async_trait::async_trait;
use webindex_shared::{Result, ScrapeOptions};

pub use fetcher::{HttpFetcher, is_ssrf_target, status_error};
pub use transform::{LlmTransformer, OPENROUTER_BASE_URL};

/// A fetched and normalized page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedDocument {
    /// Final URL after redirects.
    pub url: String,
    pub title: Option<String>,
    /// Normalized Markdown or text.
    pub content: String,
    pub description: Option<String>,
    pub canonical_url: Option<String>,
    pub outbound_links: Vec<String>,
    /// MIME essence of the response, e.g. `text/html`.
    pub content_type: String,
    /// Content type cannot be indexed; everything else is empty.
    pub unsupported: bool,
}

impl FetchedDocument {
    pub fn unsupported(url: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content_type: content_type.into(),
            unsupported: true,
            ..Default::default()
        }
    }
}

/// Fetch one URL and normalize its content.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, options: &ScrapeOptions) -> Result<FetchedDocument>;
}
