//! HTML-to-Markdown conversion for indexed pages.
//!
//! Removes page chrome selected by the strip options, converts the rest with
//! `htmd`, then runs a series of cleanup passes over the Markdown.

mod cleanup;

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument, warn};
use url::Url;

use webindex_shared::{IndexError, Result, ScrapeOptions};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Which parts of a page are dropped before conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StripOptions {
    pub links: bool,
    pub images: bool,
    /// `<header>`, `<nav>`, and `role="banner"` / `role="navigation"`.
    pub header: bool,
    /// `<footer>` and `role="contentinfo"`.
    pub footer: bool,
    /// Extra CSS selectors to remove.
    pub selectors: Vec<String>,
}

impl From<&ScrapeOptions> for StripOptions {
    fn from(opts: &ScrapeOptions) -> Self {
        Self {
            links: opts.strip_links,
            images: opts.strip_images,
            header: opts.strip_header,
            footer: opts.strip_footer,
            selectors: opts.strip_queries.clone(),
        }
    }
}

/// Result of converting an HTML page.
#[derive(Debug, Clone)]
pub struct Converted {
    pub markdown: String,
    /// First `# ` heading, if any.
    pub heading: Option<String>,
    /// Approximate word count, code blocks excluded.
    pub word_count: usize,
}

const ALWAYS_SKIPPED: [&str; 6] = ["script", "style", "iframe", "noscript", "svg", "template"];
const HEADER_SELECTORS: [&str; 4] = ["header", "nav", "[role=\"banner\"]", "[role=\"navigation\"]"];
const FOOTER_SELECTORS: [&str; 2] = ["footer", "[role=\"contentinfo\"]"];

// ---------------------------------------------------------------------------
// Converter
// ---------------------------------------------------------------------------

/// Convert an HTML document to clean Markdown.
///
/// 1. Removes header/footer/selector matches per `strip`
/// 2. Pre-processes tables into Markdown tables
/// 3. Converts the `<body>` via `htmd`
/// 4. Runs the cleanup pipeline (links resolved against `source_url` or stripped)
#[instrument(skip(html, strip), fields(url = %source_url))]
pub fn convert(html: &str, source_url: &str, strip: &StripOptions) -> Result<Converted> {
    let body_html = strip_elements(html, strip);
    let body_html = preprocess_tables(&body_html);

    let mut skip_tags: Vec<&str> = ALWAYS_SKIPPED.to_vec();
    if strip.images {
        skip_tags.extend(["img", "picture"]);
    }
    let converter = htmd::HtmlToMarkdown::builder().skip_tags(skip_tags).build();

    let raw_markdown = converter
        .convert(&body_html)
        .map_err(|e| IndexError::Conversion(format!("htmd conversion failed: {e}")))?;
    debug!(raw_len = raw_markdown.len(), "htmd conversion complete");

    let base_url = Url::parse(source_url).ok();
    let markdown = cleanup::run_pipeline(&raw_markdown, base_url.as_ref(), strip.links);

    let heading = first_heading(&markdown);
    let word_count = count_words(&markdown);
    debug!(word_count, final_len = markdown.len(), "conversion complete");

    Ok(Converted {
        markdown,
        heading,
        word_count,
    })
}

// ---------------------------------------------------------------------------
// Element stripping
// ---------------------------------------------------------------------------

/// Parse `html`, detach every stripped element, and return the body HTML.
fn strip_elements(html: &str, strip: &StripOptions) -> String {
    let mut doc = Html::parse_document(html);

    let mut selectors: Vec<&str> = Vec::new();
    if strip.header {
        selectors.extend(HEADER_SELECTORS);
    }
    if strip.footer {
        selectors.extend(FOOTER_SELECTORS);
    }
    selectors.extend(strip.selectors.iter().map(String::as_str));

    for raw in selectors {
        let selector = match Selector::parse(raw) {
            Ok(selector) => selector,
            Err(e) => {
                warn!(selector = raw, error = %e, "ignoring invalid strip selector");
                continue;
            }
        };
        let ids: Vec<_> = doc.select(&selector).map(|el| el.id()).collect();
        for id in ids {
            if let Some(mut node) = doc.tree.get_mut(id) {
                node.detach();
            }
        }
    }

    static BODY_SEL: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("body").expect("valid selector"));
    match doc.select(&BODY_SEL).next() {
        Some(body) => body.inner_html(),
        None => doc.root_element().inner_html(),
    }
}

// ---------------------------------------------------------------------------
// Table pre-processing
// ---------------------------------------------------------------------------

/// Replace `<table>` elements with Markdown tables; htmd 0.1 has no table
/// support.
fn preprocess_tables(html: &str) -> String {
    static TABLE_SEL: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("table").expect("valid selector"));

    let doc = Html::parse_fragment(html);
    if doc.select(&TABLE_SEL).next().is_none() {
        return html.to_string();
    }

    let mut result = html.to_string();
    for table in doc.select(&TABLE_SEL) {
        result = result.replacen(&table.html(), &table_to_markdown(&table), 1);
    }
    result
}

fn table_to_markdown(table: &ElementRef) -> String {
    static TR_SEL: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("tr").expect("valid selector"));
    static CELL_SEL: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("th, td").expect("valid selector"));

    let mut rows: Vec<Vec<String>> = table
        .select(&TR_SEL)
        .map(|tr| {
            tr.select(&CELL_SEL)
                .map(|cell| {
                    cell.text()
                        .collect::<String>()
                        .split_whitespace()
                        .collect::<Vec<_>>()
                        .join(" ")
                        .replace('|', "\\|")
                })
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect();

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width == 0 {
        return String::new();
    }
    for row in &mut rows {
        row.resize(width, String::new());
    }

    let line = |cells: &[String]| format!("| {} |\n", cells.join(" | "));
    let mut md = String::from("\n\n");
    md.push_str(&line(&rows[0]));
    md.push_str(&line(&vec!["---".to_string(); width]));
    for row in &rows[1..] {
        md.push_str(&line(row));
    }
    md.push('\n');
    md
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// First H1 of a Markdown document.
pub fn first_heading(md: &str) -> Option<String> {
    static H1_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^# (.+)$").expect("valid regex"));

    H1_RE.captures(md).map(|c| c[1].trim().to_string())
}

fn count_words(md: &str) -> usize {
    static CODE_BLOCK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));

    CODE_BLOCK_RE
        .replace_all(md, "")
        .split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>T</title></head><body>
        <header><a href="/">Logo</a></header>
        <nav><a href="/docs">Docs</a></nav>
        <main>
            <h1>Welcome</h1>
            <p>Read the <a href="/guide">guide</a> first.</p>
            <img src="/hero.png" alt="hero">
            <div class="ad">Buy now</div>
        </main>
        <footer><p>Copyright 2026</p></footer>
        <script>var tracking = 1;</script>
    </body></html>"#;

    fn convert_page(strip: &StripOptions) -> Converted {
        convert(PAGE, "https://example.com/start", strip).unwrap()
    }

    #[test]
    fn default_keeps_everything_but_scripts() {
        let result = convert_page(&StripOptions::default());
        assert!(result.markdown.contains("# Welcome"));
        assert!(result.markdown.contains("Copyright 2026"));
        assert!(result.markdown.contains("Docs"));
        assert!(result.markdown.contains("[guide](https://example.com/guide)"));
        assert!(!result.markdown.contains("tracking"));
        assert_eq!(result.heading.as_deref(), Some("Welcome"));
    }

    #[test]
    fn strip_header_and_footer() {
        let result = convert_page(&StripOptions {
            header: true,
            footer: true,
            ..Default::default()
        });
        assert!(!result.markdown.contains("Logo"));
        assert!(!result.markdown.contains("Docs"));
        assert!(!result.markdown.contains("Copyright"));
        assert!(result.markdown.contains("Welcome"));
    }

    #[test]
    fn strip_links_keeps_text() {
        let result = convert_page(&StripOptions {
            links: true,
            ..Default::default()
        });
        assert!(result.markdown.contains("Read the guide first."));
        assert!(!result.markdown.contains("](https://example.com/guide)"));
    }

    #[test]
    fn strip_images() {
        let kept = convert_page(&StripOptions::default());
        assert!(kept.markdown.contains("hero"));

        let stripped = convert_page(&StripOptions {
            images: true,
            ..Default::default()
        });
        assert!(!stripped.markdown.contains("hero.png"));
    }

    #[test]
    fn strip_custom_selectors() {
        let result = convert_page(&StripOptions {
            selectors: vec![".ad".into(), "not a [valid".into()],
            ..Default::default()
        });
        assert!(!result.markdown.contains("Buy now"));
        assert!(result.markdown.contains("Welcome"));
    }

    #[test]
    fn from_scrape_options() {
        let opts = ScrapeOptions {
            strip_links: true,
            strip_footer: true,
            strip_queries: vec!["aside".into()],
            ..Default::default()
        };
        let strip = StripOptions::from(&opts);
        assert!(strip.links && strip.footer);
        assert!(!strip.header && !strip.images);
        assert_eq!(strip.selectors, vec!["aside".to_string()]);
    }

    #[test]
    fn tables_become_markdown() {
        let html = r#"<html><body>
            <table>
                <thead><tr><th>Name</th><th>Value</th></tr></thead>
                <tbody><tr><td>foo</td><td>bar</td></tr></tbody>
            </table>
        </body></html>"#;
        let result = convert(html, "https://example.com/", &StripOptions::default()).unwrap();
        assert!(result.markdown.contains("| Name | Value |"));
        assert!(result.markdown.contains("| --- | --- |"));
        assert!(result.markdown.contains("| foo | bar |"));
    }

    #[test]
    fn code_blocks_survive() {
        let html = r#"<html><body><pre><code class="language-rust">fn main() {
    println!("hello");
}</code></pre></body></html>"#;
        let result = convert(html, "https://example.com/", &StripOptions::default()).unwrap();
        assert!(result.markdown.contains("```rust"));
        assert!(result.markdown.contains("println!"));
    }

    #[test]
    fn empty_body_converts_to_empty_markdown() {
        let result = convert(
            "<html><body></body></html>",
            "https://example.com/",
            &StripOptions::default(),
        )
        .unwrap();
        assert!(result.markdown.is_empty());
        assert!(result.heading.is_none());
        assert_eq!(result.word_count, 0);
    }

    #[test]
    fn word_count_excludes_code() {
        let md = "# Title\n\nOne two three.\n\n```\nlots of code words\n```";
        assert_eq!(count_words(md), 4);
    }
}
