//! Application configuration for webindex.
//!
//! User config lives at `~/.webindex/webindex.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::types::DEFAULT_MAX_DEPTH;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "webindex.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".webindex";

// ---------------------------------------------------------------------------
// Config structs (matching webindex.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub crawl: CrawlPoliciesConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// OpenRouter settings for the `llm` transform strategy.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// libSQL database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Organization used when the CLI is not given `--org`.
    #[serde(default = "default_organization")]
    pub organization: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            organization: default_organization(),
        }
    }
}

fn default_database_path() -> String {
    "~/.webindex/webindex.db".into()
}
fn default_organization() -> String {
    "default".into()
}

/// `[pipeline]` section: orchestrator and retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Attempts per item inside one processing run.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Linear backoff unit between attempts.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// PROCESSING items untouched for this long are reclaimable.
    #[serde(default = "default_stuck_timeout_secs")]
    pub stuck_timeout_secs: u64,

    /// Stored content is cut at this many characters.
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    /// Sleep between polls when the worker finds nothing to do.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            stuck_timeout_secs: default_stuck_timeout_secs(),
            max_content_chars: default_max_content_chars(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_max_retries() -> u32 {
    1
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_stuck_timeout_secs() -> u64 {
    600
}
fn default_max_content_chars() -> usize {
    100_000
}
fn default_poll_interval_ms() -> u64 {
    2000
}

/// Which dispatch strategy runs the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStrategy {
    /// Status flips only; the stepper does the work.
    #[default]
    Local,
    /// Tasks go through the persistent queue and a queue worker.
    Queued,
}

/// `[dispatch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub strategy: DispatchStrategy,

    /// Ids per queued task.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Operations allowed per task kind in one window.
    #[serde(default = "default_rate_limit_ops")]
    pub rate_limit_ops: usize,

    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    /// Queue-level attempts for a retryable item failure.
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            strategy: DispatchStrategy::default(),
            batch_size: default_batch_size(),
            rate_limit_ops: default_rate_limit_ops(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            max_task_attempts: default_max_task_attempts(),
        }
    }
}

impl DispatchConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

fn default_batch_size() -> usize {
    100
}
fn default_rate_limit_ops() -> usize {
    5
}
fn default_rate_limit_window_secs() -> u64 {
    5
}
fn default_max_task_attempts() -> u32 {
    3
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPoliciesConfig {
    /// Depth limit for origins that do not set one.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Allow fetching localhost/private addresses.
    #[serde(default)]
    pub allow_localhost: bool,
}

impl Default for CrawlPoliciesConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            request_timeout_secs: default_request_timeout_secs(),
            allow_localhost: false,
        }
    }
}

fn default_max_depth() -> u32 {
    DEFAULT_MAX_DEPTH
}
fn default_request_timeout_secs() -> u64 {
    30
}

/// `[embedding]` section (OpenAI-compatible endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Target chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_embedding_key_env(),
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_embedding_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_chunk_size() -> usize {
    1500
}
fn default_chunk_overlap() -> usize {
    200
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used by the `llm` transform strategy.
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.webindex/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| IndexError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.webindex/webindex.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| IndexError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| IndexError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| IndexError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| IndexError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| IndexError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| IndexError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Read an API key from the env var named in config.
pub fn api_key_from_env(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(IndexError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}
