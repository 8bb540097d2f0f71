//! Shared types, error model, and configuration for webindex.
//!
//! This crate is the foundation depended on by all other webindex crates.
//! It provides:
//! - [`IndexError`]: the unified error type and retry taxonomy
//! - Domain types ([`IndexedItem`], [`IndexStatus`], [`ScrapeOptions`], ids)
//! - Dedup keys ([`normalize_url`], [`content_hash`])
//! - Configuration ([`AppConfig`] and its sections, config loading)

pub mod config;
pub mod error;
pub mod normalize;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlPoliciesConfig, DefaultsConfig, DispatchConfig, DispatchStrategy,
    EmbeddingConfig, OpenRouterConfig, PipelineConfig, api_key_from_env, config_dir,
    config_file_path, expand_home, init_config, load_config, load_config_from,
};
pub use error::{IndexError, Result};
pub use normalize::{content_hash, normalize_url};
pub use types::{
    DEFAULT_MAX_DEPTH, IndexId, IndexStatus, IndexedItem, OrgId, ScrapeOptions, TransformStrategy,
};
