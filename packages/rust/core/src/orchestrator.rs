//! Per-item processing: claim → fetch → dedup → persist → frontier → embed.
//!
//! [`Orchestrator::claim_and_process_one`] backs the poll-driven stepper;
//! [`Orchestrator::process_by_id`] backs the queue worker. Both go through
//! [`process_with_retry`], so neither returns an error for a failed item.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use webindex_crawler::Fetcher;
use webindex_discovery::SitemapReader;
use webindex_shared::{IndexError, IndexId, IndexedItem, OrgId, PipelineConfig, Result};
use webindex_storage::{ClaimedIndex, Lease, Storage, Writer};

use crate::dedup::{PageContent, Persisted, persist_unique};
use crate::dispatch::Dispatcher;
use crate::embed::{EmbedRequest, Embedder};
use crate::frontier::{expand_links, expand_sitemap};
use crate::retry::{ProcessOutcome, RetryPolicy, process_with_retry};

/// Which part of the pipeline a processing request runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessMode {
    #[default]
    Full,
    /// Re-embed stored content; items without content are processed in full.
    EmbedOnly,
    /// Refetch and store content, leave embedding to a separate trigger.
    ContentOnly,
}

/// Result of processing one claimed item.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub index_id: IndexId,
    pub url: String,
    pub outcome: ProcessOutcome,
}

/// Totals from [`Orchestrator::run_until_idle`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub done: usize,
    pub scraped: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Claims lost to another worker mid-processing.
    pub superseded: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &ProcessOutcome) {
        self.processed += 1;
        match outcome {
            ProcessOutcome::Done { .. } | ProcessOutcome::SitemapRead { .. } => self.done += 1,
            ProcessOutcome::Scraped => self.scraped += 1,
            ProcessOutcome::Skipped { .. } => self.skipped += 1,
            ProcessOutcome::Failed { .. } => self.failed += 1,
            ProcessOutcome::Superseded => self.superseded += 1,
        }
    }
}

/// Progress callback for batch runs.
pub trait ProgressReporter: Send + Sync {
    /// An item was claimed.
    fn item_started(&self, url: &str);
    /// An item reached a terminal or resumable state.
    fn item_finished(&self, report: &StepReport, summary: &RunSummary);
    /// No more claimable items (or the limit was hit).
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter (for tests and non-interactive use).
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn item_started(&self, _url: &str) {}
    fn item_finished(&self, _report: &StepReport, _summary: &RunSummary) {}
    fn done(&self, _summary: &RunSummary) {}
}

pub struct Orchestrator {
    storage: Arc<Storage>,
    fetcher: Arc<dyn Fetcher>,
    embedder: Arc<dyn Embedder>,
    sitemaps: Arc<dyn SitemapReader>,
    dispatcher: Arc<dyn Dispatcher>,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<Storage>,
        fetcher: Arc<dyn Fetcher>,
        embedder: Arc<dyn Embedder>,
        sitemaps: Arc<dyn SitemapReader>,
        dispatcher: Arc<dyn Dispatcher>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            storage,
            fetcher,
            embedder,
            sitemaps,
            dispatcher,
            config,
        }
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// Claim the next eligible item of `org` and run it to a terminal or
    /// resumable state. `None` when nothing is claimable.
    pub async fn claim_and_process_one(&self, org: &OrgId) -> Result<Option<StepReport>> {
        let Some(claimed) = self
            .storage
            .claim_next(org, Utc::now(), self.config.stuck_timeout())
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(self.process_claimed(claimed, ProcessMode::Full).await))
    }

    /// Claim one specific item and process it in `mode`.
    ///
    /// `None` when the item is gone or not in a claimable state (already
    /// processed by someone else, terminal, or mid-processing).
    pub async fn process_by_id(
        &self,
        org: &OrgId,
        id: &IndexId,
        mode: ProcessMode,
    ) -> Result<Option<StepReport>> {
        let Some(item) = self.storage.get_index(id).await? else {
            debug!(index_id = %id, "item no longer exists");
            return Ok(None);
        };
        if &item.org_id != org {
            return Err(IndexError::unauthorized(format!(
                "index {id} does not belong to organization {org}"
            )));
        }

        let Some(claimed) = self
            .storage
            .claim_by_id(id, Utc::now(), self.config.stuck_timeout())
            .await?
        else {
            debug!(index_id = %id, status = %item.status, "item not claimable");
            return Ok(None);
        };
        Ok(Some(self.process_claimed(claimed, mode).await))
    }

    /// Step until nothing is claimable, or `limit` items were processed.
    #[instrument(skip_all, fields(org = %org))]
    pub async fn run_until_idle(
        &self,
        org: &OrgId,
        progress: &dyn ProgressReporter,
        limit: Option<usize>,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        while limit.is_none_or(|max| summary.processed < max) {
            let Some(claimed) = self
                .storage
                .claim_next(org, Utc::now(), self.config.stuck_timeout())
                .await?
            else {
                break;
            };
            progress.item_started(&claimed.item.url);
            let report = self.process_claimed(claimed, ProcessMode::Full).await;
            summary.record(&report.outcome);
            progress.item_finished(&report, &summary);
        }
        info!(
            processed = summary.processed,
            done = summary.done,
            skipped = summary.skipped,
            failed = summary.failed,
            "run finished"
        );
        progress.done(&summary);
        Ok(summary)
    }

    #[instrument(skip_all, fields(index_id = %claimed.item.id, org = %claimed.item.org_id, ?mode))]
    async fn process_claimed(&self, claimed: ClaimedIndex, mode: ProcessMode) -> StepReport {
        let resume = claimed.resumes_at_embedding() || mode == ProcessMode::EmbedOnly;
        let (item, lease) = (claimed.item, claimed.lease);
        debug!(url = %item.url, previous = %claimed.previous_status, resume, "item claimed");

        // Set once content is stored under this claim, so a retry embeds it
        // instead of fetching again.
        let stored = AtomicBool::new(resume);
        let (item_ref, stored_ref) = (&item, &stored);
        let outcome = process_with_retry(
            &self.storage,
            &lease,
            RetryPolicy::from(&self.config),
            move |_| self.attempt(item_ref, lease, mode, stored_ref),
        )
        .await;

        info!(outcome = outcome.label(), "item processed");
        StepReport {
            index_id: item.id,
            url: item.url,
            outcome,
        }
    }

    async fn attempt(
        &self,
        item: &IndexedItem,
        lease: Lease,
        mode: ProcessMode,
        stored: &AtomicBool,
    ) -> Result<ProcessOutcome> {
        if stored.load(Ordering::SeqCst) {
            if let Some(content) = self.storage.get_content(&item.id).await? {
                let (title, description) = (item.title.as_deref(), item.description.as_deref());
                return self
                    .embed_and_finish(item, lease, &content, title, description)
                    .await;
            }
            debug!(index_id = %item.id, "no stored content, processing in full");
        }

        if item.is_sitemap {
            return self.read_sitemap(item, lease).await;
        }
        self.fetch_and_store(item, lease, mode, stored).await
    }

    /// The crawl origin governing `item`: itself when it is a root.
    async fn origin_of(&self, item: &IndexedItem) -> Result<Option<IndexedItem>> {
        match item.found_from_index_id {
            None => Ok(Some(item.clone())),
            Some(origin_id) => {
                let origin = self.storage.get_index(&origin_id).await?;
                if origin.is_none() {
                    warn!(index_id = %item.id, origin = %origin_id, "crawl origin missing");
                }
                Ok(origin)
            }
        }
    }

    async fn read_sitemap(&self, item: &IndexedItem, lease: Lease) -> Result<ProcessOutcome> {
        let urls = self.sitemaps.read(&item.url).await?;
        let report = expand_sitemap(&self.storage, item, &urls).await?;
        if !report.to_process.is_empty() {
            self.dispatcher
                .trigger_processing(&report.to_process, &item.org_id)
                .await?;
        }
        if !self.storage.mark_done(lease.into()).await? {
            warn!(index_id = %item.id, "claim lost during sitemap read");
            return Ok(ProcessOutcome::Superseded);
        }
        Ok(ProcessOutcome::SitemapRead {
            children: report.to_process.len(),
        })
    }

    async fn fetch_and_store(
        &self,
        item: &IndexedItem,
        lease: Lease,
        mode: ProcessMode,
        stored: &AtomicBool,
    ) -> Result<ProcessOutcome> {
        let origin = self.origin_of(item).await?;
        let options = origin.as_ref().unwrap_or(item).options();

        let doc = self.fetcher.fetch(&item.url, &options).await?;
        if doc.unsupported {
            let reason = format!("Unsupported content type: {}", doc.content_type);
            if !self.storage.mark_skipped(lease.into(), &reason, None).await? {
                return Ok(ProcessOutcome::Superseded);
            }
            info!(index_id = %item.id, content_type = %doc.content_type, "skipped: unsupported content");
            return Ok(ProcessOutcome::Skipped { reason });
        }

        // A redirect to another URL counts as a canonical declaration.
        let canonical_url = doc
            .canonical_url
            .clone()
            .or_else(|| (doc.url != item.url).then(|| doc.url.clone()));
        let page = PageContent {
            content: doc.content,
            title: doc.title.clone(),
            description: doc.description.clone(),
            canonical_url,
        };
        // ContentOnly releases the row as SCRAPED; a full run keeps holding it
        // through link expansion and embedding.
        let hold = mode != ProcessMode::ContentOnly;
        let writer = Writer::Claim(lease);
        let max_chars = self.config.max_content_chars;
        match persist_unique(&self.storage, item, writer, hold, page, max_chars).await? {
            Persisted::Saved { .. } => {}
            Persisted::Skipped { reason } => return Ok(ProcessOutcome::Skipped { reason }),
            Persisted::NotHeld => {
                info!(index_id = %item.id, "claim lost before content was stored");
                return Ok(ProcessOutcome::Superseded);
            }
        }

        if !hold {
            if let Err(e) = self
                .dispatcher
                .trigger_embeddings(std::slice::from_ref(&item.id), &item.org_id)
                .await
            {
                // Released already: the SCRAPED row is picked up by the next step.
                warn!(index_id = %item.id, error = %e, "failed to trigger embedding");
            }
            return Ok(ProcessOutcome::Scraped);
        }
        stored.store(true, Ordering::SeqCst);

        if let Some(origin) = origin.filter(|o| o.do_crawl && !o.is_sitemap) {
            let report = expand_links(&self.storage, &origin, item, &doc.outbound_links).await?;
            if !report.to_process.is_empty() {
                self.dispatcher
                    .trigger_processing(&report.to_process, &item.org_id)
                    .await?;
            }
        }

        let content = self.storage.get_content(&item.id).await?.unwrap_or_default();
        let (title, description) = (doc.title.as_deref(), doc.description.as_deref());
        self.embed_and_finish(item, lease, &content, title, description)
            .await
    }

    async fn embed_and_finish(
        &self,
        item: &IndexedItem,
        lease: Lease,
        content: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<ProcessOutcome> {
        let request = EmbedRequest {
            id: &item.id,
            url: &item.url,
            title,
            description,
            org: &item.org_id,
        };
        let chunks = self.embedder.embed(content, &request).await?;
        if !self.storage.mark_done(lease.into()).await? {
            warn!(index_id = %item.id, "claim lost during embedding, not marking done");
            return Ok(ProcessOutcome::Superseded);
        }
        Ok(ProcessOutcome::Done {
            chunks: chunks.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dedup::duplicated_content_reason;
    use crate::testing::{
        FakeEmbedder, FakeFetcher, FakeSitemapReader, Harness, page, seed, seed_origin,
    };
    use webindex_crawler::FetchedDocument;
    use webindex_shared::{IndexStatus, ScrapeOptions};

    fn with_links(content: &str, links: &[&str]) -> FetchedDocument {
        FetchedDocument {
            outbound_links: links.iter().map(|l| l.to_string()).collect(),
            ..page(content)
        }
    }

    #[tokio::test]
    async fn single_page_ends_done_with_one_embed_call() {
        let h = Harness::new(FakeFetcher::default().with_page("https://Example.com/a", page("Hello"))).await;
        let org = OrgId::new("org");
        let item = seed(&h.storage, &org, "https://Example.com/a").await;
        assert_eq!(item.status, IndexStatus::Pending);
        assert_eq!(item.normalized_url, "//example.com/a");

        let report = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert_eq!(report.index_id, item.id);
        assert_eq!(report.outcome, ProcessOutcome::Done { chunks: 1 });

        let item = h.storage.get_index(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, IndexStatus::Done);
        assert!(item.indexed_at.is_some());
        assert_eq!(h.storage.get_content(&item.id).await.unwrap().as_deref(), Some("Hello"));

        let calls = h.embedder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (item.id, "Hello".to_string()));

        assert!(h.orchestrator.claim_and_process_one(&org).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn crawl_stops_at_max_depth() {
        let fetcher = FakeFetcher::default()
            .with_page(
                "https://example.com/",
                with_links("Home", &["https://example.com/sub"]),
            )
            .with_page(
                "https://example.com/sub",
                with_links("Sub", &["https://example.com/deeper"]),
            );
        let h = Harness::new(fetcher).await;
        let org = OrgId::new("org");
        let origin = seed_origin(
            &h.storage,
            &org,
            "https://example.com/",
            ScrapeOptions {
                max_depth: Some(1),
                ..Default::default()
            },
        )
        .await;

        h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        let children = h.storage.list_children(&origin.id).await.unwrap();
        assert_eq!(children.len(), 1);
        let child = &children[0];
        assert_eq!(child.url, "https://example.com/sub");
        assert_eq!(child.depth, 1);
        assert_eq!(child.found_from_index_id, Some(origin.id));
        assert_eq!(child.status, IndexStatus::Pending);

        let report = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert_eq!(report.index_id, child.id);
        assert_eq!(h.storage.list_children(&origin.id).await.unwrap().len(), 1);
        assert!(h.storage.list_children(&child.id).await.unwrap().is_empty());
        assert!(
            h.storage
                .find_by_normalized_url(&org, "//example.com/deeper")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn identical_content_skips_second_item() {
        let fetcher = FakeFetcher::default()
            .with_page("https://example.com/a", page("Same body"))
            .with_page("https://example.com/b", page("Same body"));
        let h = Harness::new(fetcher).await;
        let org = OrgId::new("org");
        let first = seed(&h.storage, &org, "https://example.com/a").await;
        let second = seed(&h.storage, &org, "https://example.com/b").await;

        h.orchestrator.claim_and_process_one(&org).await.unwrap();
        let report = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert_eq!(report.index_id, second.id);
        assert_eq!(
            report.outcome,
            ProcessOutcome::Skipped {
                reason: duplicated_content_reason(&first.url)
            }
        );

        let second = h.storage.get_index(&second.id).await.unwrap().unwrap();
        assert_eq!(second.status, IndexStatus::Skipped);
        assert!(second.skip);
        assert_eq!(
            second.skip_reason.as_deref(),
            Some("Duplicated content from: https://example.com/a")
        );
        assert!(second.hash.is_none());
        assert!(h.storage.get_content(&second.id).await.unwrap().is_none());
        assert_eq!(h.embedder.calls().len(), 1);
    }

    #[tokio::test]
    async fn stuck_item_is_reclaimed_before_later_pending() {
        let h = Harness::new(
            FakeFetcher::default()
                .with_page("https://example.com/stuck", page("Stuck"))
                .with_page("https://example.com/later", page("Later")),
        )
        .await;
        let org = OrgId::new("org");
        let stuck = seed(&h.storage, &org, "https://example.com/stuck").await;
        let eleven_minutes_ago = Utc::now() - chrono::Duration::minutes(11);
        h.storage
            .claim_by_id(&stuck.id, eleven_minutes_ago, Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        let later = seed(&h.storage, &org, "https://example.com/later").await;

        let first = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert_eq!(first.index_id, stuck.id);
        let second = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert_eq!(second.index_id, later.id);
    }

    #[tokio::test]
    async fn recent_processing_is_not_reclaimed() {
        let h = Harness::new(FakeFetcher::default()).await;
        let org = OrgId::new("org");
        let item = seed(&h.storage, &org, "https://example.com/a").await;
        let five_minutes_ago = Utc::now() - chrono::Duration::minutes(5);
        h.storage
            .claim_by_id(&item.id, five_minutes_ago, Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();

        assert!(h.orchestrator.claim_and_process_one(&org).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_clean_is_drained_last() {
        let h = Harness::new(
            FakeFetcher::default()
                .with_page("https://example.com/old", page("Old"))
                .with_page("https://example.com/new", page("New")),
        )
        .await;
        let org = OrgId::new("org");
        let old = seed(&h.storage, &org, "https://example.com/old").await;
        h.storage
            .set_status(&org, &[old.id], IndexStatus::PendingClean)
            .await
            .unwrap();
        let new = seed(&h.storage, &org, "https://example.com/new").await;

        let first = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert_eq!(first.index_id, new.id);
        let second = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert_eq!(second.index_id, old.id);
    }

    #[tokio::test]
    async fn scraped_item_resumes_at_embedding() {
        let h = Harness::new(FakeFetcher::default()).await;
        let org = OrgId::new("org");
        let item = seed(&h.storage, &org, "https://example.com/a").await;
        crate::dedup::persist_unique(
            &h.storage,
            &item,
            Writer::Direct(item.id),
            false,
            PageContent {
                content: "Stored".into(),
                ..Default::default()
            },
            1000,
        )
        .await
        .unwrap();

        let report = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert_eq!(report.outcome, ProcessOutcome::Done { chunks: 1 });
        assert!(h.fetcher.calls().is_empty());
        assert_eq!(h.embedder.calls(), vec![(item.id, "Stored".to_string())]);
    }

    #[tokio::test]
    async fn second_worker_cannot_claim_item_while_it_embeds() {
        let h = Harness::new(FakeFetcher::default().with_page("https://example.com/a", page("Body"))).await;
        let org = OrgId::new("org");
        let item = seed(&h.storage, &org, "https://example.com/a").await;
        h.embedder.race_with(h.storage.clone(), &org, chrono::Duration::zero());

        let report = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert_eq!(report.outcome, ProcessOutcome::Done { chunks: 1 });
        assert_eq!(h.embedder.rival_claims(), vec![None]);
        assert_eq!(h.embedder.calls().len(), 1);

        let item = h.storage.get_index(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, IndexStatus::Done);
    }

    #[tokio::test]
    async fn reclaimed_item_is_left_to_the_new_claim() {
        let h = Harness::new(FakeFetcher::default().with_page("https://example.com/a", page("Body"))).await;
        let org = OrgId::new("org");
        let item = seed(&h.storage, &org, "https://example.com/a").await;
        // The rival's clock is past the stuck timeout, so it takes the row over.
        h.embedder.race_with(h.storage.clone(), &org, chrono::Duration::minutes(11));

        let report = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert_eq!(report.outcome, ProcessOutcome::Superseded);
        assert_eq!(h.embedder.rival_claims(), vec![Some(item.id)]);

        let item = h.storage.get_index(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, IndexStatus::Processing);
        assert!(item.indexed_at.is_none());
    }

    #[tokio::test]
    async fn unsupported_content_is_skipped() {
        let h = Harness::new(FakeFetcher::default().with_page(
            "https://example.com/file.pdf",
            FetchedDocument::unsupported("https://example.com/file.pdf", "application/pdf"),
        ))
        .await;
        let org = OrgId::new("org");
        let item = seed(&h.storage, &org, "https://example.com/file.pdf").await;

        let report = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert_eq!(
            report.outcome,
            ProcessOutcome::Skipped {
                reason: "Unsupported content type: application/pdf".into()
            }
        );
        let item = h.storage.get_index(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, IndexStatus::Skipped);
        assert!(h.embedder.calls().is_empty());
    }

    #[tokio::test]
    async fn permanent_fetch_error_ends_in_error() {
        let h = Harness::new(FakeFetcher::default()).await;
        let org = OrgId::new("org");
        let item = seed(&h.storage, &org, "https://example.com/missing").await;

        let report = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        match report.outcome {
            ProcessOutcome::Failed { retryable, .. } => assert!(!retryable),
            other => panic!("expected failure, got {other:?}"),
        }
        let item = h.storage.get_index(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, IndexStatus::Error);
        assert!(item.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn embedding_failure_after_store_keeps_content() {
        let h = Harness::with(
            FakeFetcher::default().with_page("https://example.com/a", page("Body")),
            FakeEmbedder::failing(IndexError::Embedding("provider down".into())),
            FakeSitemapReader::default(),
        )
        .await;
        let org = OrgId::new("org");
        let item = seed(&h.storage, &org, "https://example.com/a").await;

        let report = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert!(matches!(
            report.outcome,
            ProcessOutcome::Failed { retryable: true, .. }
        ));
        let item = h.storage.get_index(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, IndexStatus::Error);
        assert_eq!(h.storage.get_content(&item.id).await.unwrap().as_deref(), Some("Body"));
    }

    #[tokio::test]
    async fn sitemap_origin_enumerates_children_without_content() {
        let sitemaps = FakeSitemapReader::default().with_sitemap(
            "https://example.com/sitemap.xml",
            &["https://example.com/a", "https://example.com/b", "https://other.com/c"],
        );
        let h = Harness::with(FakeFetcher::default(), FakeEmbedder::default(), sitemaps).await;
        let org = OrgId::new("org");
        let key = webindex_shared::normalize_url("https://example.com/sitemap.xml").unwrap();
        let mut new = webindex_storage::NewIndex::root(&org, "https://example.com/sitemap.xml", key);
        new.do_crawl = true;
        new.is_sitemap = true;
        let origin = h.storage.upsert_index(&new).await.unwrap();

        let report = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert_eq!(report.outcome, ProcessOutcome::SitemapRead { children: 2 });

        let origin = h.storage.get_index(&origin.id).await.unwrap().unwrap();
        assert_eq!(origin.status, IndexStatus::Done);
        assert!(h.storage.get_content(&origin.id).await.unwrap().is_none());
        let children = h.storage.list_children(&origin.id).await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.depth == 1 && !c.do_crawl));
    }

    #[tokio::test]
    async fn default_policy_makes_a_single_attempt() {
        let h = Harness::new(FakeFetcher::default().failing_then(
            "https://example.com/a",
            1,
            IndexError::Network("reset".into()),
            page("Eventually"),
        ))
        .await;
        let org = OrgId::new("org");
        seed(&h.storage, &org, "https://example.com/a").await;

        // Default pipeline allows a single attempt.
        let report = h.orchestrator.claim_and_process_one(&org).await.unwrap().unwrap();
        assert!(report.outcome.is_failure());
        assert_eq!(h.fetcher.calls_for("https://example.com/a"), 1);
    }

    #[tokio::test]
    async fn process_by_id_rejects_foreign_org_and_ignores_terminal_items() {
        let h = Harness::new(FakeFetcher::default().with_page("https://example.com/a", page("A"))).await;
        let org = OrgId::new("org");
        let item = seed(&h.storage, &org, "https://example.com/a").await;

        let err = h
            .orchestrator
            .process_by_id(&OrgId::new("other"), &item.id, ProcessMode::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Unauthorized { .. }));

        let report = h
            .orchestrator
            .process_by_id(&org, &item.id, ProcessMode::Full)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, ProcessOutcome::Done { chunks: 1 });

        // DONE is not claimable.
        assert!(
            h.orchestrator
                .process_by_id(&org, &item.id, ProcessMode::Full)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            h.orchestrator
                .process_by_id(&org, &IndexId::new(), ProcessMode::Full)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn content_only_stores_and_requests_embedding() {
        let h = Harness::new(FakeFetcher::default().with_page(
            "https://example.com/",
            with_links("Home", &["https://example.com/sub"]),
        ))
        .await;
        let org = OrgId::new("org");
        let origin = seed_origin(&h.storage, &org, "https://example.com/", ScrapeOptions::default()).await;

        let report = h
            .orchestrator
            .process_by_id(&org, &origin.id, ProcessMode::ContentOnly)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, ProcessOutcome::Scraped);
        assert!(h.embedder.calls().is_empty());
        assert!(h.storage.list_children(&origin.id).await.unwrap().is_empty());

        let origin = h.storage.get_index(&origin.id).await.unwrap().unwrap();
        assert_eq!(origin.status, IndexStatus::Scraped);
    }

    #[tokio::test]
    async fn run_until_idle_drains_the_crawl() {
        let fetcher = FakeFetcher::default()
            .with_page(
                "https://example.com/",
                with_links("Home", &["https://example.com/a", "https://example.com/b"]),
            )
            .with_page("https://example.com/a", with_links("A", &["https://example.com/"]))
            .with_page("https://example.com/b", page("B"));
        let h = Harness::new(fetcher).await;
        let org = OrgId::new("org");
        seed_origin(&h.storage, &org, "https://example.com/", ScrapeOptions::default()).await;

        let summary = h
            .orchestrator
            .run_until_idle(&org, &SilentProgress, None)
            .await
            .unwrap();
        assert_eq!(
            summary,
            RunSummary {
                processed: 3,
                done: 3,
                ..Default::default()
            }
        );
        assert_eq!(h.storage.count_pending(&org).await.unwrap(), 0);
        assert_eq!(h.fetcher.calls_for("https://example.com/"), 1);
    }

    #[tokio::test]
    async fn run_until_idle_honours_limit() {
        let h = Harness::new(
            FakeFetcher::default()
                .with_page("https://example.com/a", page("A"))
                .with_page("https://example.com/b", page("B")),
        )
        .await;
        let org = OrgId::new("org");
        seed(&h.storage, &org, "https://example.com/a").await;
        seed(&h.storage, &org, "https://example.com/b").await;

        let summary = h
            .orchestrator
            .run_until_idle(&org, &SilentProgress, Some(1))
            .await
            .unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(h.storage.count_pending(&org).await.unwrap(), 1);
    }
}
