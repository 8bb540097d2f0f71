//! Registry of indexed items: submission, lookups, tenancy checks, deletes.

use std::sync::Arc;

use tracing::{debug, info, instrument};
use url::Url;

use webindex_shared::{
    IndexError, IndexId, IndexStatus, IndexedItem, OrgId, Result, ScrapeOptions, normalize_url,
};
use webindex_storage::{NewIndex, Storage, Writer};

use crate::dedup::{PageContent, Persisted, persist_unique};

/// Crawl attributes supplied with a submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitAttrs {
    pub do_crawl: bool,
    pub is_sitemap: bool,
    pub scrape_options: Option<ScrapeOptions>,
}

impl SubmitAttrs {
    /// A crawl origin, read as a sitemap when `is_sitemap` is set.
    pub fn crawl(is_sitemap: bool, options: ScrapeOptions) -> Self {
        Self {
            do_crawl: true,
            is_sitemap,
            scrape_options: Some(options),
        }
    }
}

pub struct Registry {
    storage: Arc<Storage>,
}

impl Registry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Insert the item at `url`, or overwrite the crawl attributes of the one
    /// already registered under its normalized key and reset it to PENDING.
    ///
    /// Re-submitting an existing item as a crawl origin marks its children
    /// OUTDATED; rediscovery during the new crawl restores them.
    #[instrument(skip_all, fields(org = %org, url = %url))]
    pub async fn upsert(&self, org: &OrgId, url: &str, attrs: &SubmitAttrs) -> Result<IndexedItem> {
        check_submission_url(url)?;
        if let Some(options) = &attrs.scrape_options {
            options.validate()?;
        }
        let key = normalize_url(url)?;
        let previous = self.storage.find_by_normalized_url(org, &key).await?;

        let new = NewIndex {
            do_crawl: attrs.do_crawl,
            is_sitemap: attrs.is_sitemap,
            scrape_options: attrs.scrape_options.clone(),
            ..NewIndex::root(org, url, key)
        };
        let item = self.storage.upsert_index(&new).await?;

        if previous.is_some() && item.do_crawl {
            let outdated = self.storage.mark_children_outdated(&item.id).await?;
            debug!(outdated, "previous crawl children marked outdated");
        }
        info!(
            index_id = %item.id,
            created = previous.is_none(),
            do_crawl = item.do_crawl,
            is_sitemap = item.is_sitemap,
            "item registered"
        );
        Ok(item)
    }

    /// Store submitted content in place of a fetch. Dedup still applies.
    pub async fn store_literal(
        &self,
        item: &IndexedItem,
        content: String,
        max_chars: usize,
    ) -> Result<Persisted> {
        let page = PageContent {
            content,
            ..Default::default()
        };
        persist_unique(&self.storage, item, Writer::Direct(item.id), false, page, max_chars).await
    }

    /// Load an item and check it belongs to `org`.
    pub async fn authorize(&self, org: &OrgId, id: &IndexId) -> Result<IndexedItem> {
        match self.storage.get_index(id).await? {
            None => Err(IndexError::not_found(format!("index {id}"))),
            Some(item) if &item.org_id != org => Err(IndexError::unauthorized(format!(
                "index {id} does not belong to organization {org}"
            ))),
            Some(item) => Ok(item),
        }
    }

    pub async fn list(&self, org: &OrgId, status: Option<IndexStatus>) -> Result<Vec<IndexedItem>> {
        self.storage.list_by_org(org, status).await
    }

    pub async fn content(&self, org: &OrgId, id: &IndexId) -> Result<Option<String>> {
        self.authorize(org, id).await?;
        self.storage.get_content(id).await
    }

    pub async fn status_counts(&self, org: &OrgId) -> Result<Vec<(IndexStatus, u64)>> {
        self.storage.count_by_status(org).await
    }

    /// Delete one item with its content and chunks. Its children stay, orphaned.
    #[instrument(skip_all, fields(org = %org, index_id = %id))]
    pub async fn delete(&self, org: &OrgId, id: &IndexId) -> Result<()> {
        self.authorize(org, id).await?;
        self.storage.delete_index(id).await?;
        info!("item deleted");
        Ok(())
    }

    /// Delete an origin and every item discovered from it.
    #[instrument(skip_all, fields(org = %org, index_id = %id))]
    pub async fn delete_subtree(&self, org: &OrgId, id: &IndexId) -> Result<usize> {
        self.authorize(org, id).await?;
        let deleted = self.storage.delete_subtree(id).await?;
        info!(deleted, "subtree deleted");
        Ok(deleted)
    }
}

fn check_submission_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| IndexError::validation(format!("invalid URL '{url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(IndexError::validation(format!(
            "unsupported URL scheme '{other}' in '{url}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::duplicated_content_reason;
    use crate::testing::{seed, test_storage};
    use webindex_storage::ChildUpsert;

    #[tokio::test]
    async fn upsert_creates_pending_item_with_normalized_key() {
        let (storage, _db) = test_storage().await;
        let registry = Registry::new(storage.clone());
        let org = OrgId::new("org");

        let item = registry
            .upsert(&org, "https://Example.com/a", &SubmitAttrs::default())
            .await
            .unwrap();
        assert_eq!(item.status, IndexStatus::Pending);
        assert_eq!(item.normalized_url, "//example.com/a");
        assert_eq!(item.url, "https://Example.com/a");
        assert!(item.is_root());
        assert_eq!(item.depth, 0);
    }

    #[tokio::test]
    async fn same_key_in_one_org_is_one_item() {
        let (storage, _db) = test_storage().await;
        let registry = Registry::new(storage.clone());
        let org = OrgId::new("org");

        let first = registry
            .upsert(&org, "https://www.example.com/a?x=1", &SubmitAttrs::default())
            .await
            .unwrap();
        storage.mark_error(Writer::Direct(first.id), "boom").await.unwrap();
        let second = registry
            .upsert(&org, "http://example.com/a#top", &SubmitAttrs::default())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, IndexStatus::Pending);
        assert!(second.error.is_none());

        let other = registry
            .upsert(&OrgId::new("other"), "https://example.com/a", &SubmitAttrs::default())
            .await
            .unwrap();
        assert_ne!(other.id, first.id);
        assert_eq!(registry.list(&org, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_bad_urls_and_options() {
        let (storage, _db) = test_storage().await;
        let registry = Registry::new(storage);
        let org = OrgId::new("org");

        for url in ["not a url", "ftp://example.com/file", "mailto:someone@example.com"] {
            let err = registry.upsert(&org, url, &SubmitAttrs::default()).await.unwrap_err();
            assert!(matches!(err, IndexError::Validation { .. }), "{url}: {err}");
        }

        let attrs = SubmitAttrs::crawl(
            false,
            ScrapeOptions {
                allow_links_regexp: Some("(".into()),
                ..Default::default()
            },
        );
        let err = registry
            .upsert(&org, "https://example.com/", &attrs)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Validation { .. }));
    }

    #[tokio::test]
    async fn recrawl_marks_children_outdated() {
        let (storage, _db) = test_storage().await;
        let registry = Registry::new(storage.clone());
        let org = OrgId::new("org");
        let attrs = SubmitAttrs::crawl(false, ScrapeOptions::default());

        let origin = registry.upsert(&org, "https://example.com/", &attrs).await.unwrap();
        let child = NewIndex::child(&origin, "https://example.com/sub", "//example.com/sub", 1);
        let upserted = storage.upsert_children(&[child]).await.unwrap();
        let ChildUpsert::Created(child_id) = upserted[0] else {
            panic!("expected a new child");
        };

        registry.upsert(&org, "https://example.com/", &attrs).await.unwrap();
        let child = storage.get_index(&child_id).await.unwrap().unwrap();
        assert_eq!(child.status, IndexStatus::Outdated);
    }

    #[tokio::test]
    async fn literal_content_is_deduplicated() {
        let (storage, _db) = test_storage().await;
        let registry = Registry::new(storage.clone());
        let org = OrgId::new("org");
        let a = seed(&storage, &org, "https://example.com/a").await;
        let b = seed(&storage, &org, "https://example.com/b").await;

        let first = registry.store_literal(&a, "Same".into(), 1000).await.unwrap();
        assert_eq!(first, Persisted::Saved { truncated: false });
        let a = storage.get_index(&a.id).await.unwrap().unwrap();
        assert_eq!(a.status, IndexStatus::Scraped);

        let second = registry.store_literal(&b, "Same".into(), 1000).await.unwrap();
        assert_eq!(
            second,
            Persisted::Skipped {
                reason: duplicated_content_reason("https://example.com/a")
            }
        );
    }

    #[tokio::test]
    async fn tenancy_is_enforced() {
        let (storage, _db) = test_storage().await;
        let registry = Registry::new(storage.clone());
        let item = seed(&storage, &OrgId::new("org"), "https://example.com/a").await;

        let err = registry.authorize(&OrgId::new("other"), &item.id).await.unwrap_err();
        assert!(matches!(err, IndexError::Unauthorized { .. }));
        let err = registry
            .delete(&OrgId::new("org"), &IndexId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::NotFound { .. }));
        assert!(storage.get_index(&item.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_orphans_children_and_subtree_delete_removes_them() {
        let (storage, _db) = test_storage().await;
        let registry = Registry::new(storage.clone());
        let org = OrgId::new("org");
        let attrs = SubmitAttrs::crawl(false, ScrapeOptions::default());

        let origin = registry.upsert(&org, "https://example.com/", &attrs).await.unwrap();
        let children = [
            NewIndex::child(&origin, "https://example.com/a", "//example.com/a", 1),
            NewIndex::child(&origin, "https://example.com/b", "//example.com/b", 1),
        ];
        storage.upsert_children(&children).await.unwrap();

        assert_eq!(registry.delete_subtree(&org, &origin.id).await.unwrap(), 3);
        assert!(registry.list(&org, None).await.unwrap().is_empty());

        let origin = registry.upsert(&org, "https://example.com/", &attrs).await.unwrap();
        storage
            .upsert_children(&[NewIndex::child(&origin, "https://example.com/a", "//example.com/a", 1)])
            .await
            .unwrap();
        registry.delete(&org, &origin.id).await.unwrap();
        let remaining = registry.list(&org, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].is_root());
    }
}
