use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument};

use webindex_shared::{IndexId, IndexStatus, OrgId, Result};
use webindex_storage::{NewTask, Storage};

use super::local::{mark_embeddings, mark_processing};
use super::{Dispatcher, TaskKind, TaskPayload, TaskQueue, task_batches};

/// Marks items like [`super::LocalDispatcher`], then enqueues tasks for a
/// [`super::QueueWorker`].
pub struct QueuedDispatcher {
    storage: Arc<Storage>,
    queue: Arc<dyn TaskQueue>,
    batch_size: usize,
}

impl QueuedDispatcher {
    pub fn new(storage: Arc<Storage>, queue: Arc<dyn TaskQueue>, batch_size: usize) -> Self {
        Self {
            storage,
            queue,
            batch_size: batch_size.max(1),
        }
    }

    async fn enqueue(&self, org: &OrgId, kind: TaskKind, ids: &[IndexId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let tasks = task_batches(org, kind, ids, self.batch_size)?;
        let task_ids = self.queue.enqueue(&tasks).await?;
        info!(kind = %kind, items = ids.len(), tasks = task_ids.len(), "tasks enqueued");
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for QueuedDispatcher {
    #[instrument(skip_all, fields(org = %org, count = ids.len()))]
    async fn trigger_processing(&self, ids: &[IndexId], org: &OrgId) -> Result<()> {
        mark_processing(&self.storage, ids, org).await?;
        self.enqueue(org, TaskKind::Process, ids).await
    }

    #[instrument(skip_all, fields(org = %org, count = ids.len()))]
    async fn trigger_embeddings(&self, ids: &[IndexId], org: &OrgId) -> Result<()> {
        mark_embeddings(&self.storage, ids, org).await?;
        self.enqueue(org, TaskKind::Embed, ids).await
    }

    #[instrument(skip_all, fields(org = %org, count = ids.len()))]
    async fn trigger_get_content(&self, ids: &[IndexId], org: &OrgId) -> Result<()> {
        mark_processing(&self.storage, ids, org).await?;
        self.enqueue(org, TaskKind::GetContent, ids).await
    }

    #[instrument(skip_all, fields(org = %org))]
    async fn trigger_index_all(&self, org: &OrgId) -> Result<()> {
        self.storage
            .set_status_for_org(org, IndexStatus::PendingClean)
            .await?;
        let fan_out = NewTask {
            org_id: org.clone(),
            kind: TaskKind::IndexAll.as_str().to_string(),
            payload: TaskPayload::default().encode()?,
            run_after: Utc::now(),
        };
        self.queue.enqueue(std::slice::from_ref(&fan_out)).await?;
        info!("index-all task enqueued");
        Ok(())
    }
}
