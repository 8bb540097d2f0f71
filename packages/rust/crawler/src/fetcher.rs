//! HTTP implementation of [`Fetcher`].
//!
//! Fetches one URL, classifies its content type, converts HTML through
//! `webindex-markdown`, and optionally post-processes with an LLM.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use scraper::Html;
use tracing::{debug, instrument, warn};
use url::Url;

use webindex_markdown::{StripOptions, first_heading};
use webindex_shared::{IndexError, Result, ScrapeOptions, TransformStrategy};

use crate::extract::{PageMeta, extract_page_meta};
use crate::transform::LlmTransformer;
use crate::{FetchedDocument, Fetcher};

/// User-Agent string for fetch requests.
const USER_AGENT: &str = concat!("webindex/", env!("CARGO_PKG_VERSION"));

/// Fetches pages over HTTP with an SSRF guard.
pub struct HttpFetcher {
    client: Client,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
    llm: Option<LlmTransformer>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| IndexError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allow_localhost: false,
            llm: None,
        })
    }

    pub fn allow_localhost(mut self, allow: bool) -> Self {
        self.allow_localhost = allow;
        self
    }

    /// Enable `transformStrategy = llm`.
    pub fn with_llm(mut self, transformer: LlmTransformer) -> Self {
        self.llm = Some(transformer);
        self
    }

    async fn apply_strategy(
        &self,
        markdown: String,
        url: &str,
        options: &ScrapeOptions,
    ) -> Result<String> {
        if options.transform_strategy != TransformStrategy::Llm || markdown.is_empty() {
            return Ok(markdown);
        }
        match &self.llm {
            Some(llm) => llm.transform(&markdown, url).await,
            None => {
                warn!(%url, "llm transform requested but no OpenRouter key configured, keeping markdown");
                Ok(markdown)
            }
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip_all, fields(url = %url))]
    async fn fetch(&self, url: &str, options: &ScrapeOptions) -> Result<FetchedDocument> {
        let parsed = Url::parse(url)
            .map_err(|e| IndexError::validation(format!("invalid url '{url}': {e}")))?;
        if !self.allow_localhost && is_ssrf_target(&parsed) {
            warn!(%url, "SSRF protection: blocked");
            return Err(IndexError::validation(format!("blocked non-public url '{url}'")));
        }

        debug!("fetching");
        let response = self
            .client
            .get(parsed.as_str())
            .send()
            .await
            .map_err(|e| IndexError::Network(format!("{url}: {e}")))?;

        if let Some(err) = status_error(response.status(), url) {
            return Err(err);
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(mime_essence)
            .unwrap_or_default();

        let kind = ContentKind::classify(&content_type);
        if kind == ContentKind::Unsupported {
            debug!(%content_type, "unsupported content type");
            return Ok(FetchedDocument::unsupported(final_url.as_str(), content_type));
        }

        let body = response
            .text()
            .await
            .map_err(|e| IndexError::Network(format!("{url}: body read failed: {e}")))?;

        let (markdown, mut meta) = match kind {
            ContentKind::Html => convert_html(&body, &final_url, options)?,
            _ => {
                let text = body.trim().to_string();
                let title = first_heading(&text);
                (
                    text,
                    PageMeta {
                        title,
                        ..Default::default()
                    },
                )
            }
        };

        // A redirect is an implicit canonical
        if meta.canonical_url.is_none() && final_url != parsed {
            meta.canonical_url = Some(final_url.to_string());
        }

        let content = self
            .apply_strategy(markdown, final_url.as_str(), options)
            .await?;

        debug!(
            content_len = content.len(),
            links = meta.links.len(),
            "fetch complete"
        );

        Ok(FetchedDocument {
            url: final_url.to_string(),
            title: meta.title,
            content,
            description: meta.description,
            canonical_url: meta.canonical_url,
            outbound_links: meta.links,
            content_type,
            unsupported: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentKind {
    Html,
    Text,
    Unsupported,
}

impl ContentKind {
    fn classify(essence: &str) -> Self {
        match essence {
            // Servers that omit the header almost always send HTML
            "" | "text/html" | "application/xhtml+xml" => Self::Html,
            "text/plain" | "text/markdown" | "text/x-markdown" => Self::Text,
            _ => Self::Unsupported,
        }
    }
}

/// `Text/HTML; charset=utf-8` -> `text/html`.
fn mime_essence(header: &str) -> String {
    header
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Parse, extract metadata, and convert. Kept sync: `Html` is not `Send`.
fn convert_html(body: &str, url: &Url, options: &ScrapeOptions) -> Result<(String, PageMeta)> {
    let mut meta = {
        let doc = Html::parse_document(body);
        extract_page_meta(&doc, url)
    };
    let converted = webindex_markdown::convert(body, url.as_str(), &StripOptions::from(options))?;
    if meta.title.is_none() {
        meta.title = converted.heading;
    }
    Ok((converted.markdown, meta))
}

/// Map a non-success HTTP status to the error taxonomy.
pub fn status_error(status: StatusCode, context: &str) -> Option<IndexError> {
    if status.is_success() {
        return None;
    }
    let err = match status.as_u16() {
        404 | 410 => IndexError::not_found(format!("{context}: HTTP {status}")),
        401 | 403 => IndexError::unauthorized(format!("{context}: HTTP {status}")),
        429 => IndexError::RateLimited(format!("{context}: HTTP {status}")),
        500..=599 => IndexError::Network(format!("{context}: HTTP {status}")),
        _ => IndexError::validation(format!("{context}: HTTP {status}")),
    };
    Some(err)
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return true;
    }

    match url.host() {
        Some(url::Host::Ipv4(ip)) => is_private_ip(&IpAddr::V4(ip)),
        Some(url::Host::Ipv6(ip)) => is_private_ip(&IpAddr::V6(ip)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (a == 100 && (b & 0xC0) == 64)
                // 192.0.0.0/24
                || (a == 192 && b == 0 && c == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}
