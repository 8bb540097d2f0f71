//! Test fixtures: temp databases, seeded items, and in-memory collaborators.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use webindex_crawler::{FetchedDocument, Fetcher};
use webindex_discovery::SitemapReader;
use webindex_shared::{
    IndexError, IndexId, IndexedItem, OrgId, PipelineConfig, Result, ScrapeOptions, normalize_url,
};
use webindex_storage::{Lease, NewIndex, NewTask, Storage, TaskRecord, TaskStatus};

use crate::dispatch::{Dispatcher, LocalDispatcher, TaskQueue};
use crate::embed::{EmbedRequest, Embedder, EmbeddingProvider};
use crate::orchestrator::Orchestrator;

/// Temp database file removed on drop.
pub(crate) struct TestDb {
    path: PathBuf,
}

impl Drop for TestDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.path.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(path);
        }
    }
}

pub(crate) async fn test_storage() -> (Arc<Storage>, TestDb) {
    let path = std::env::temp_dir().join(format!("webindex_core_test_{}.db", Uuid::now_v7()));
    let storage = Storage::open(&path).await.unwrap();
    (Arc::new(storage), TestDb { path })
}

/// Insert a plain root item.
pub(crate) async fn seed(storage: &Storage, org: &OrgId, url: &str) -> IndexedItem {
    let key = normalize_url(url).unwrap();
    storage.upsert_index(&NewIndex::root(org, url, key)).await.unwrap()
}

/// Claim `item` the way a worker would and return its lease.
pub(crate) async fn claim(storage: &Storage, item: &IndexedItem) -> Lease {
    storage
        .claim_by_id(&item.id, Utc::now(), Duration::from_secs(600))
        .await
        .unwrap()
        .expect("item is claimable")
        .lease
}

/// Insert a crawl origin.
pub(crate) async fn seed_origin(
    storage: &Storage,
    org: &OrgId,
    url: &str,
    options: ScrapeOptions,
) -> IndexedItem {
    let key = normalize_url(url).unwrap();
    let mut new = NewIndex::root(org, url, key);
    new.do_crawl = true;
    new.scrape_options = Some(options);
    storage.upsert_index(&new).await.unwrap()
}

/// Pipeline settings with millisecond retry delays.
pub(crate) fn fast_pipeline() -> PipelineConfig {
    PipelineConfig {
        retry_base_delay_ms: 1,
        ..Default::default()
    }
}

pub(crate) fn page(content: &str) -> FetchedDocument {
    FetchedDocument {
        content: content.to_string(),
        content_type: "text/html".into(),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Deterministic provider: one 3-dim vector per text.
#[derive(Default)]
pub(crate) struct FakeProvider {
    calls: AtomicUsize,
}

impl FakeProvider {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FakeProvider {
    fn model_name(&self) -> &str {
        "fake-embedding"
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32, t.lines().count() as f32, 1.0])
            .collect())
    }
}

enum Scripted {
    Page(FetchedDocument),
    /// Fail this many times, then serve the page.
    FailThen(usize, IndexError, FetchedDocument),
    Fail(IndexError),
}

/// Serves scripted documents by URL. Unknown URLs are NotFound.
#[derive(Default)]
pub(crate) struct FakeFetcher {
    pages: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub(crate) fn with_page(self, url: &str, doc: FetchedDocument) -> Self {
        self.pages.lock().unwrap().insert(url.to_string(), Scripted::Page(doc));
        self
    }

    pub(crate) fn with_error(self, url: &str, error: IndexError) -> Self {
        self.pages.lock().unwrap().insert(url.to_string(), Scripted::Fail(error));
        self
    }

    pub(crate) fn failing_then(self, url: &str, failures: usize, error: IndexError, doc: FetchedDocument) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), Scripted::FailThen(failures, error, doc));
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

fn clone_error(err: &IndexError) -> IndexError {
    match err {
        IndexError::Network(m) => IndexError::Network(m.clone()),
        IndexError::RateLimited(m) => IndexError::RateLimited(m.clone()),
        IndexError::Storage(m) => IndexError::Storage(m.clone()),
        IndexError::Embedding(m) => IndexError::Embedding(m.clone()),
        IndexError::NotFound { what } => IndexError::not_found(what.clone()),
        IndexError::Unauthorized { message } => IndexError::unauthorized(message.clone()),
        other => IndexError::validation(other.to_string()),
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &str, _options: &ScrapeOptions) -> Result<FetchedDocument> {
        self.calls.lock().unwrap().push(url.to_string());
        let mut pages = self.pages.lock().unwrap();
        let doc = match pages.get_mut(url) {
            None => return Err(IndexError::not_found(url.to_string())),
            Some(Scripted::Fail(err)) => return Err(clone_error(err)),
            Some(Scripted::FailThen(remaining, err, doc)) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(clone_error(err));
                }
                doc.clone()
            }
            Some(Scripted::Page(doc)) => doc.clone(),
        };
        let mut doc = doc;
        if doc.url.is_empty() {
            doc.url = url.to_string();
        }
        Ok(doc)
    }
}

/// A second worker polling the same organization, `skew` ahead of the clock.
type Rival = (Arc<Storage>, OrgId, chrono::Duration);

/// Records embed calls and stores nothing.
#[derive(Default)]
pub(crate) struct FakeEmbedder {
    calls: Mutex<Vec<(IndexId, String)>>,
    fail_with: Mutex<Option<IndexError>>,
    rival: Mutex<Option<Rival>>,
    rival_claims: Mutex<Vec<Option<IndexId>>>,
}

impl FakeEmbedder {
    pub(crate) fn failing(error: IndexError) -> Self {
        Self {
            fail_with: Mutex::new(Some(error)),
            ..Default::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<(IndexId, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Make every embed call first try `claim_next` on `org`, as another
    /// worker would, with its clock `skew` ahead.
    pub(crate) fn race_with(&self, storage: Arc<Storage>, org: &OrgId, skew: chrono::Duration) {
        *self.rival.lock().unwrap() = Some((storage, org.clone(), skew));
    }

    /// What each racing `claim_next` returned.
    pub(crate) fn rival_claims(&self) -> Vec<Option<IndexId>> {
        self.rival_claims.lock().unwrap().clone()
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, content: &str, request: &EmbedRequest<'_>) -> Result<Vec<String>> {
        let rival = self.rival.lock().unwrap().clone();
        if let Some((storage, org, skew)) = rival {
            let claimed = storage
                .claim_next(&org, Utc::now() + skew, Duration::from_secs(600))
                .await?;
            self.rival_claims
                .lock()
                .unwrap()
                .push(claimed.map(|c| c.item.id));
        }
        if let Some(err) = self.fail_with.lock().unwrap().as_ref() {
            return Err(clone_error(err));
        }
        self.calls
            .lock()
            .unwrap()
            .push((*request.id, content.to_string()));
        Ok(vec![format!("{}-0", request.id)])
    }
}

#[derive(Default)]
pub(crate) struct FakeSitemapReader {
    sitemaps: HashMap<String, Vec<String>>,
}

impl FakeSitemapReader {
    pub(crate) fn with_sitemap(mut self, url: &str, urls: &[&str]) -> Self {
        self.sitemaps
            .insert(url.to_string(), urls.iter().map(|u| u.to_string()).collect());
        self
    }
}

#[async_trait]
impl SitemapReader for FakeSitemapReader {
    async fn read(&self, url: &str) -> Result<Vec<String>> {
        self.sitemaps
            .get(url)
            .cloned()
            .ok_or_else(|| IndexError::not_found(url.to_string()))
    }
}

/// Keeps enqueued tasks in memory; claims nothing.
#[derive(Default)]
pub(crate) struct RecordingQueue {
    tasks: Mutex<Vec<NewTask>>,
}

impl RecordingQueue {
    pub(crate) fn enqueued(&self) -> Vec<NewTask> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, tasks: &[NewTask]) -> Result<Vec<String>> {
        let mut stored = self.tasks.lock().unwrap();
        let start = stored.len();
        stored.extend_from_slice(tasks);
        Ok((start..stored.len()).map(|i| i.to_string()).collect())
    }

    async fn claim(&self, _now: DateTime<Utc>, _stale_after: Duration) -> Result<Option<TaskRecord>> {
        Ok(None)
    }

    async fn complete(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn retry(&self, _id: &str, _error: &str, _run_after: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn defer(&self, _id: &str, _run_after: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn fail(&self, _id: &str, _error: &str) -> Result<()> {
        Ok(())
    }
}

/// Orchestrator wired to fakes and a local dispatcher.
pub(crate) struct Harness {
    pub storage: Arc<Storage>,
    pub fetcher: Arc<FakeFetcher>,
    pub embedder: Arc<FakeEmbedder>,
    pub orchestrator: Arc<Orchestrator>,
    _db: TestDb,
}

impl Harness {
    pub(crate) async fn new(fetcher: FakeFetcher) -> Self {
        Self::with(fetcher, FakeEmbedder::default(), FakeSitemapReader::default()).await
    }

    pub(crate) async fn with(
        fetcher: FakeFetcher,
        embedder: FakeEmbedder,
        sitemaps: FakeSitemapReader,
    ) -> Self {
        let (storage, db) = test_storage().await;
        let fetcher = Arc::new(fetcher);
        let embedder = Arc::new(embedder);
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(LocalDispatcher::new(storage.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            storage.clone(),
            fetcher.clone(),
            embedder.clone(),
            Arc::new(sitemaps),
            dispatcher,
            fast_pipeline(),
        ));
        Self {
            storage,
            fetcher,
            embedder,
            orchestrator,
            _db: db,
        }
    }
}

pub(crate) async fn task_count(storage: &Storage, status: TaskStatus) -> u64 {
    storage.count_tasks(status).await.unwrap()
}
