//! Dedup keys: URL normalization and content hashing.
//!
//! Both functions are pure. Their output is persisted as unique keys, so any
//! change here is a data migration.

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{IndexError, Result};

/// Canonical dedup key for a URL: `//<host without www.><path>`.
///
/// The whole input is lowercased first, protocol-relative input gets an
/// `https:` scheme, and query and fragment are dropped. Only the first `www.`
/// in the host is removed. Re-applying the function to its own output yields
/// the same key.
pub fn normalize_url(url: &str) -> Result<String> {
    let lowered = url.trim().to_lowercase();
    let repaired = if lowered.starts_with("//") {
        format!("https:{lowered}")
    } else {
        lowered
    };

    let parsed = Url::parse(&repaired)
        .map_err(|e| IndexError::validation(format!("invalid url '{url}': {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| IndexError::validation(format!("url '{url}' has no host")))?;

    Ok(format!("//{}{}", host.replacen("www.", "", 1), parsed.path()))
}

/// SHA-256 hex digest of final content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
