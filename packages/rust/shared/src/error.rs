//! Error types for webindex.
//!
//! Library crates use [`IndexError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Variants double as the retry taxonomy: [`IndexError::is_retryable`] tells
//! the orchestrator and the queue worker whether another attempt can help.

use std::path::PathBuf;

/// Top-level error type for all webindex operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transient network/server failure while fetching.
    #[error("network error: {0}")]
    Network(String),

    /// Upstream provider quota exceeded.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// HTML, XML, or payload parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Embedding provider error.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Bad input: malformed URL, unsupported content, invalid options.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// HTML-to-Markdown conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Referenced item or resource does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Item belongs to another organization, or upstream refused access.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error naming the missing thing.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an unauthorized error from any displayable message.
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether another attempt at the same operation may succeed.
    ///
    /// User and validation errors are permanent; infrastructure errors are
    /// transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::RateLimited(_)
                | Self::Storage(_)
                | Self::Embedding(_)
                | Self::Io { .. }
        )
    }

    /// Whether the failure came from an upstream quota.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}
