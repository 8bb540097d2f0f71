//! Page metadata and outbound link extraction from parsed HTML.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

/// Metadata pulled from a page's `<head>` and anchors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PageMeta {
    pub title: Option<String>,
    pub description: Option<String>,
    /// Absolute `<link rel="canonical">` target.
    pub canonical_url: Option<String>,
    /// Absolute http(s) links, fragment-free, first occurrence order.
    pub links: Vec<String>,
}

fn selector(css: &'static str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

static TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| selector("title"));
static H1_SEL: LazyLock<Selector> = LazyLock::new(|| selector("h1"));
static OG_TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"meta[property="og:title"]"#));
static DESCRIPTION_SEL: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"meta[name="description"]"#));
static OG_DESCRIPTION_SEL: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"meta[property="og:description"]"#));
static CANONICAL_SEL: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"link[rel="canonical"]"#));
static LINK_SEL: LazyLock<Selector> = LazyLock::new(|| selector("a[href]"));

pub(crate) fn extract_page_meta(doc: &Html, base_url: &Url) -> PageMeta {
    let title = element_text(doc, &TITLE_SEL)
        .or_else(|| meta_content(doc, &OG_TITLE_SEL))
        .or_else(|| element_text(doc, &H1_SEL));

    let description = meta_content(doc, &DESCRIPTION_SEL)
        .or_else(|| meta_content(doc, &OG_DESCRIPTION_SEL));

    let canonical_url = doc
        .select(&CANONICAL_SEL)
        .filter_map(|el| el.value().attr("href"))
        .find_map(|href| resolve(base_url, href.trim()))
        .map(|url| url.to_string());

    PageMeta {
        title,
        description,
        canonical_url,
        links: extract_links(doc, base_url),
    }
}

/// Extract all http(s) links, resolved against the base URL.
pub(crate) fn extract_links(doc: &Html, base_url: &Url) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for el in doc.select(&LINK_SEL) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        // Skip anchors, javascript:, mailto:, tel:
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            continue;
        }

        if let Some(resolved) = resolve(base_url, href) {
            let resolved = resolved.to_string();
            if seen.insert(resolved.clone()) {
                links.push(resolved);
            }
        }
    }

    links
}

fn resolve(base_url: &Url, href: &str) -> Option<Url> {
    let mut url = base_url.join(href).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

fn element_text(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty())
}

fn meta_content(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|content| !content.is_empty())
        .map(str::to_string)
}
