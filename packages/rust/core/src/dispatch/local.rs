use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use webindex_shared::{IndexId, IndexStatus, OrgId, Result};
use webindex_storage::Storage;

use super::Dispatcher;

/// Status-only dispatch. Work happens when the stepper claims the items.
pub struct LocalDispatcher {
    storage: Arc<Storage>,
}

impl LocalDispatcher {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

/// Shared by both strategies: the status flip that makes items claimable.
pub(super) async fn mark_processing(storage: &Storage, ids: &[IndexId], org: &OrgId) -> Result<u64> {
    storage.set_status(org, ids, IndexStatus::Pending).await
}

pub(super) async fn mark_embeddings(storage: &Storage, ids: &[IndexId], org: &OrgId) -> Result<()> {
    let (scraped, pending) = storage.mark_for_embedding(org, ids).await?;
    debug!(scraped, pending, "items marked for embedding");
    Ok(())
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    #[instrument(skip_all, fields(org = %org, count = ids.len()))]
    async fn trigger_processing(&self, ids: &[IndexId], org: &OrgId) -> Result<()> {
        let changed = mark_processing(&self.storage, ids, org).await?;
        debug!(changed, "items marked pending");
        Ok(())
    }

    #[instrument(skip_all, fields(org = %org, count = ids.len()))]
    async fn trigger_embeddings(&self, ids: &[IndexId], org: &OrgId) -> Result<()> {
        mark_embeddings(&self.storage, ids, org).await
    }

    #[instrument(skip_all, fields(org = %org, count = ids.len()))]
    async fn trigger_get_content(&self, ids: &[IndexId], org: &OrgId) -> Result<()> {
        mark_processing(&self.storage, ids, org).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(org = %org))]
    async fn trigger_index_all(&self, org: &OrgId) -> Result<()> {
        let changed = self
            .storage
            .set_status_for_org(org, IndexStatus::PendingClean)
            .await?;
        info!(changed, "organization queued for full reindex");
        Ok(())
    }
}
