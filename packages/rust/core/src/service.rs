//! `IndexService`: the upward API used by the CLI.
//!
//! Wires the registry, orchestrator, and dispatcher together and enforces
//! tenancy on every id-based request.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use webindex_crawler::{HttpFetcher, LlmTransformer};
use webindex_discovery::{DiscoveryOptions, HttpSitemapReader};
use webindex_shared::{
    AppConfig, IndexId, IndexStatus, IndexedItem, OrgId, PipelineConfig, Result, ScrapeOptions,
    api_key_from_env,
};
use webindex_storage::Storage;

use crate::dedup::Persisted;
use crate::dispatch::{Dispatcher, QueueWorker, WorkerConfig, dispatcher_from_config};
use crate::embed::{ChunkingEmbedder, provider_from_config};
use crate::orchestrator::{Orchestrator, ProcessMode, ProgressReporter, RunSummary, StepReport};
use crate::rate_limit::RateLimiter;
use crate::registry::{Registry, SubmitAttrs};

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub item: IndexedItem,
    /// Set when literal content was supplied.
    pub persisted: Option<Persisted>,
}

pub struct IndexService {
    storage: Arc<Storage>,
    registry: Registry,
    orchestrator: Arc<Orchestrator>,
    dispatcher: Arc<dyn Dispatcher>,
    pipeline: PipelineConfig,
}

impl IndexService {
    pub fn new(storage: Arc<Storage>, orchestrator: Arc<Orchestrator>, pipeline: PipelineConfig) -> Self {
        Self {
            registry: Registry::new(storage.clone()),
            dispatcher: orchestrator.dispatcher().clone(),
            storage,
            orchestrator,
            pipeline,
        }
    }

    /// Build the HTTP collaborators and the configured dispatch strategy.
    pub fn from_config(config: &AppConfig, storage: Arc<Storage>) -> Result<Self> {
        let timeout = Duration::from_secs(config.crawl.request_timeout_secs);
        let mut fetcher = HttpFetcher::new(timeout)?.allow_localhost(config.crawl.allow_localhost);
        match api_key_from_env(&config.openrouter.api_key_env) {
            Ok(key) => {
                fetcher = fetcher.with_llm(LlmTransformer::new(key, &config.openrouter.default_model)?);
            }
            Err(_) => info!(
                env = %config.openrouter.api_key_env,
                "OpenRouter key not set, llm transform unavailable"
            ),
        }

        let sitemaps = HttpSitemapReader::new(&DiscoveryOptions {
            timeout_secs: config.crawl.request_timeout_secs,
            allow_localhost: config.crawl.allow_localhost,
        })?;
        let provider = provider_from_config(&config.embedding)?;
        let embedder = ChunkingEmbedder::new(storage.clone(), provider, &config.embedding);
        let dispatcher = dispatcher_from_config(&config.dispatch, storage.clone());

        let orchestrator = Arc::new(Orchestrator::new(
            storage.clone(),
            Arc::new(fetcher),
            Arc::new(embedder),
            Arc::new(sitemaps),
            dispatcher,
            config.pipeline.clone(),
        ));
        Ok(Self::new(storage, orchestrator, config.pipeline.clone()))
    }

    /// A queue consumer sharing this service's orchestrator.
    pub fn queue_worker(&self, config: &AppConfig) -> QueueWorker {
        QueueWorker::new(
            self.storage.clone(),
            self.storage.clone(),
            self.orchestrator.clone(),
            RateLimiter::new(config.dispatch.rate_limit_ops, config.dispatch.rate_limit_window()),
            WorkerConfig::from_app_config(config),
        )
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Register a single page. With `content` the fetch is skipped and the
    /// content goes straight to dedup and embedding.
    #[instrument(skip_all, fields(org = %org, url = %url))]
    pub async fn submit_url(&self, org: &OrgId, url: &str, content: Option<String>) -> Result<Submission> {
        let item = self.registry.upsert(org, url, &SubmitAttrs::default()).await?;

        let Some(content) = content else {
            self.dispatcher.trigger_processing(&[item.id], org).await?;
            return Ok(Submission {
                item,
                persisted: None,
            });
        };

        let persisted = self
            .registry
            .store_literal(&item, content, self.pipeline.max_content_chars)
            .await?;
        if matches!(persisted, Persisted::Saved { .. }) {
            self.dispatcher.trigger_embeddings(&[item.id], org).await?;
        }
        let item = self.registry.authorize(org, &item.id).await?;
        Ok(Submission {
            item,
            persisted: Some(persisted),
        })
    }

    /// Register a crawl origin (or sitemap) and queue it.
    #[instrument(skip_all, fields(org = %org, url = %url, is_sitemap))]
    pub async fn submit_crawl(
        &self,
        org: &OrgId,
        url: &str,
        is_sitemap: bool,
        options: ScrapeOptions,
    ) -> Result<IndexedItem> {
        let item = self
            .registry
            .upsert(org, url, &SubmitAttrs::crawl(is_sitemap, options))
            .await?;
        self.dispatcher.trigger_processing(&[item.id], org).await?;
        Ok(item)
    }

    // -----------------------------------------------------------------------
    // Reprocessing
    // -----------------------------------------------------------------------

    /// Request processing of existing items. Every id must exist and belong
    /// to `org`; nothing is dispatched otherwise.
    #[instrument(skip_all, fields(org = %org, count = ids.len(), ?mode))]
    pub async fn reprocess(&self, org: &OrgId, ids: &[IndexId], mode: ProcessMode) -> Result<()> {
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            items.push(self.registry.authorize(org, id).await?);
        }

        match mode {
            ProcessMode::Full => {
                for origin in items.iter().filter(|item| item.do_crawl) {
                    self.storage.mark_children_outdated(&origin.id).await?;
                }
                self.dispatcher.trigger_processing(ids, org).await
            }
            ProcessMode::EmbedOnly => self.dispatcher.trigger_embeddings(ids, org).await,
            ProcessMode::ContentOnly => self.dispatcher.trigger_get_content(ids, org).await,
        }
    }

    pub async fn index_all(&self, org: &OrgId) -> Result<()> {
        self.dispatcher.trigger_index_all(org).await
    }

    /// Items still waiting for work, including ones mid-processing.
    pub async fn pending_count(&self, org: &OrgId) -> Result<u64> {
        self.storage.count_pending(org).await
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    /// Process at most one claimable item.
    pub async fn step(&self, org: &OrgId) -> Result<Option<StepReport>> {
        self.orchestrator.claim_and_process_one(org).await
    }

    pub async fn run_until_idle(
        &self,
        org: &OrgId,
        progress: &dyn ProgressReporter,
        limit: Option<usize>,
    ) -> Result<RunSummary> {
        self.orchestrator.run_until_idle(org, progress, limit).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn list(&self, org: &OrgId, status: Option<IndexStatus>) -> Result<Vec<IndexedItem>> {
        self.registry.list(org, status).await
    }

    pub async fn get(&self, org: &OrgId, id: &IndexId) -> Result<IndexedItem> {
        self.registry.authorize(org, id).await
    }

    pub async fn content(&self, org: &OrgId, id: &IndexId) -> Result<Option<String>> {
        self.registry.content(org, id).await
    }

    pub async fn status_counts(&self, org: &OrgId) -> Result<Vec<(IndexStatus, u64)>> {
        self.registry.status_counts(org).await
    }

    pub async fn delete(&self, org: &OrgId, id: &IndexId) -> Result<()> {
        self.registry.delete(org, id).await
    }

    pub async fn delete_subtree(&self, org: &OrgId, id: &IndexId) -> Result<usize> {
        let deleted = self.registry.delete_subtree(org, id).await?;
        if deleted == 0 {
            warn!(index_id = %id, "subtree delete removed nothing");
        }
        Ok(deleted)
    }
}
