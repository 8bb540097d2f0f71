//! Post-conversion cleanup passes for Markdown output.
//!
//! Each pass is `&str -> String`, applied in sequence by [`run_pipeline`].

use std::sync::LazyLock;

use regex::{Captures, Regex};
use url::Url;

/// `[text](href)` or `[text](href "title")`.
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[([^\]]*)\]\(([^)\s]+)(?:\s+"[^"]*")?\)"#).expect("valid regex")
});

/// Run every cleanup pass on raw Markdown.
///
/// With `strip_links` set, links collapse to their text; otherwise relative
/// hrefs are resolved against `base_url`.
pub(crate) fn run_pipeline(md: &str, base_url: Option<&Url>, strip_links: bool) -> String {
    let mut result = fix_code_fence_languages(md);
    result = strip_leftover_html(&result);
    result = if strip_links {
        unlink(&result)
    } else {
        resolve_links(&result, base_url)
    };
    result = drop_empty_links(&result);
    result = normalize_whitespace(&result);
    result = collapse_blank_lines(&result);
    result.trim().to_string()
}

/// `language-js`, `lang-python`, `highlight-rust` fences become plain hints.
fn fix_code_fence_languages(md: &str) -> String {
    static LANG_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^```(?:language-|lang-|highlight-)(\w+)").expect("valid regex")
    });

    LANG_PREFIX_RE.replace_all(md, "```$1").to_string()
}

/// Remove layout tags htmd passes through, outside code fences.
fn strip_leftover_html(md: &str) -> String {
    static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"</?(?:div|span|section|article|aside|header|footer|figure|figcaption|details|summary|main)(?:\s[^>]*)?>",
        )
        .expect("valid regex")
    });

    let mut in_fence = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                return line.to_string();
            }
            if in_fence {
                line.to_string()
            } else {
                HTML_TAG_RE.replace_all(line, "").to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether the match at `start` is an image (`![alt](src)`).
fn is_image(md: &str, start: usize) -> bool {
    start > 0 && md.as_bytes()[start - 1] == b'!'
}

/// Resolve relative link targets. Images, anchors, and absolute URLs are kept.
fn resolve_links(md: &str, base_url: Option<&Url>) -> String {
    let Some(base) = base_url else {
        return md.to_string();
    };

    LINK_RE
        .replace_all(md, |caps: &Captures| {
            let whole = &caps[0];
            let text = &caps[1];
            let href = &caps[2];

            let start = caps.get(0).map_or(0, |m| m.start());
            if is_image(md, start)
                || href.starts_with("http://")
                || href.starts_with("https://")
                || href.starts_with('#')
                || href.starts_with("mailto:")
            {
                return whole.to_string();
            }

            match base.join(href) {
                Ok(resolved) => format!("[{text}]({resolved})"),
                Err(_) => whole.to_string(),
            }
        })
        .to_string()
}

/// Replace `[text](href)` with `text`, leaving images alone.
fn unlink(md: &str) -> String {
    LINK_RE
        .replace_all(md, |caps: &Captures| {
            let start = caps.get(0).map_or(0, |m| m.start());
            if is_image(md, start) {
                caps[0].to_string()
            } else {
                caps[1].to_string()
            }
        })
        .to_string()
}

/// Icon-only anchors convert to `[](href)`; they carry no text.
fn drop_empty_links(md: &str) -> String {
    static EMPTY_LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(^|[^!])\[\s*\]\([^)]*\)").expect("valid regex"));

    EMPTY_LINK_RE.replace_all(md, "$1").to_string()
}

fn normalize_whitespace(md: &str) -> String {
    md.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// At most one blank line between blocks.
fn collapse_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(md, "\n\n").to_string()
}
