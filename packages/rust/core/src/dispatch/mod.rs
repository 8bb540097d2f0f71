//! Job dispatch: how "process these items" requests reach the orchestrator.
//!
//! One [`Dispatcher`] is chosen at startup from `dispatch.strategy` and passed
//! around as `Arc<dyn Dispatcher>`:
//! - [`LocalDispatcher`] flips statuses; the stepper does the work later.
//! - [`QueuedDispatcher`] flips the same statuses and enqueues tasks that a
//!   [`QueueWorker`] consumes.

mod local;
mod queued;
mod worker;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use webindex_shared::{DispatchConfig, DispatchStrategy, IndexError, IndexId, OrgId, Result};
use webindex_storage::{NewTask, Storage, TaskRecord};

pub use local::LocalDispatcher;
pub use queued::QueuedDispatcher;
pub use worker::{QueueWorker, TaskReport, WorkerConfig, WorkerStats};

/// Requests work on items. Implementations never run the work inline.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Fetch, dedup, persist, expand, and embed.
    async fn trigger_processing(&self, ids: &[IndexId], org: &OrgId) -> Result<()>;

    /// Re-embed stored content (items without content are fully processed).
    async fn trigger_embeddings(&self, ids: &[IndexId], org: &OrgId) -> Result<()>;

    /// Refetch content without expanding links.
    async fn trigger_get_content(&self, ids: &[IndexId], org: &OrgId) -> Result<()>;

    /// Reprocess every item of the organization at the lowest priority.
    async fn trigger_index_all(&self, org: &OrgId) -> Result<()>;
}

/// Build the configured strategy.
pub fn dispatcher_from_config(
    config: &DispatchConfig,
    storage: Arc<Storage>,
) -> Arc<dyn Dispatcher> {
    match config.strategy {
        DispatchStrategy::Local => Arc::new(LocalDispatcher::new(storage)),
        DispatchStrategy::Queued => Arc::new(QueuedDispatcher::new(
            storage.clone(),
            storage,
            config.batch_size,
        )),
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Process,
    Embed,
    GetContent,
    /// Fan-out: expands into `Process` tasks for every item of the org.
    IndexAll,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Embed => "embed",
            Self::GetContent => "get_content",
            Self::IndexAll => "index_all",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" => Ok(Self::Process),
            "embed" => Ok(Self::Embed),
            "get_content" => Ok(Self::GetContent),
            "index_all" => Ok(Self::IndexAll),
            other => Err(IndexError::parse(format!("unknown task kind '{other}'"))),
        }
    }
}

/// JSON payload of a queued task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default)]
    pub ids: Vec<IndexId>,
}

impl TaskPayload {
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| IndexError::parse(format!("invalid task payload: {e}")))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| IndexError::parse(format!("failed to encode task payload: {e}")))
    }
}

/// One task per `batch_size` ids, in order.
pub(crate) fn task_batches(
    org: &OrgId,
    kind: TaskKind,
    ids: &[IndexId],
    batch_size: usize,
) -> Result<Vec<NewTask>> {
    ids.chunks(batch_size.max(1))
        .map(|chunk| {
            Ok(NewTask {
                org_id: org.clone(),
                kind: kind.as_str().to_string(),
                payload: TaskPayload { ids: chunk.to_vec() }.encode()?,
                run_after: Utc::now(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// Durable queue of dispatch tasks.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, tasks: &[NewTask]) -> Result<Vec<String>>;

    /// Claim one due task, or one whose worker stopped updating it.
    async fn claim(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<Option<TaskRecord>>;

    async fn complete(&self, id: &str) -> Result<()>;

    /// Count an attempt and run again at `run_after`.
    async fn retry(&self, id: &str, error: &str, run_after: DateTime<Utc>) -> Result<()>;

    /// Run again at `run_after` without counting an attempt.
    async fn defer(&self, id: &str, run_after: DateTime<Utc>) -> Result<()>;

    /// Dead-letter.
    async fn fail(&self, id: &str, error: &str) -> Result<()>;
}

#[async_trait]
impl TaskQueue for Storage {
    async fn enqueue(&self, tasks: &[NewTask]) -> Result<Vec<String>> {
        self.enqueue_tasks(tasks).await
    }

    async fn claim(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<Option<TaskRecord>> {
        self.claim_task(now, stale_after).await
    }

    async fn complete(&self, id: &str) -> Result<()> {
        self.complete_task(id).await
    }

    async fn retry(&self, id: &str, error: &str, run_after: DateTime<Utc>) -> Result<()> {
        self.retry_task(id, error, run_after).await
    }

    async fn defer(&self, id: &str, run_after: DateTime<Utc>) -> Result<()> {
        self.defer_task(id, run_after).await
    }

    async fn fail(&self, id: &str, error: &str) -> Result<()> {
        self.fail_task(id, error).await
    }
}
