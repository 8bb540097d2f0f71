//! Sitemap XML parser.
//!
//! Handles the two document shapes of <https://www.sitemaps.org/protocol.html>:
//! - `<urlset>` with `<url><loc>…</loc></url>` page entries
//! - `<sitemapindex>` with `<sitemap><loc>…</loc></sitemap>` child sitemaps
//!
//! Only `<loc>` is read; priority, changefreq and lastmod are ignored.

use std::sync::LazyLock;

use regex::Regex;
use webindex_shared::{IndexError, Result};

/// Parsed sitemap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapDocument {
    /// Page URLs.
    UrlSet(Vec<String>),
    /// Child sitemap URLs.
    Index(Vec<String>),
}

static INDEX_ROOT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\w+:)?sitemapindex[\s>]").expect("index root regex"));

static URLSET_ROOT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\w+:)?urlset[\s>]").expect("urlset root regex"));

/// Matches `<loc>…</loc>`, optionally namespaced, across lines.
static LOC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(?:\w+:)?loc>\s*(.*?)\s*</(?:\w+:)?loc>").expect("loc regex")
});

static CDATA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^<!\[CDATA\[(.*)\]\]>$").expect("cdata regex"));

pub(crate) fn parse_sitemap(xml: &str) -> Result<SitemapDocument> {
    let locs: Vec<String> = LOC_RE
        .captures_iter(xml)
        .map(|caps| decode_loc(&caps[1]))
        .filter(|loc| !loc.is_empty())
        .collect();

    if INDEX_ROOT_RE.is_match(xml) {
        Ok(SitemapDocument::Index(locs))
    } else if URLSET_ROOT_RE.is_match(xml) {
        Ok(SitemapDocument::UrlSet(locs))
    } else {
        Err(IndexError::parse(
            "sitemap has neither <urlset> nor <sitemapindex> root",
        ))
    }
}

fn decode_loc(raw: &str) -> String {
    if let Some(caps) = CDATA_RE.captures(raw) {
        return caps[1].trim().to_string();
    }
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}
