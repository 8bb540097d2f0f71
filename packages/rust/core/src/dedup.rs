//! Post-fetch deduplication: canonical collapse, then content-hash collapse.
//!
//! Canonical collapse is a read against the registry. Hash collapse happens
//! inside [`Storage::save_scraped`], where the hash check and the content
//! write share one transaction.

use tracing::{debug, info, warn};

use webindex_shared::{IndexedItem, Result, content_hash, normalize_url};
use webindex_storage::{SaveOutcome, ScrapedPage, Storage, Writer};

pub fn same_canonical_reason(url: &str) -> String {
    format!("Same canonical url of: {url}")
}

pub fn duplicated_content_reason(url: &str) -> String {
    format!("Duplicated content from: {url}")
}

/// Fetched page data before hashing and size capping.
#[derive(Debug, Clone, Default)]
pub struct PageContent {
    pub content: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub canonical_url: Option<String>,
}

/// What happened to fetched content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persisted {
    /// Content stored: the item is SCRAPED, or still PROCESSING for a held claim.
    Saved { truncated: bool },
    /// Item collapsed onto another and is SKIPPED.
    Skipped { reason: String },
    /// The writer lost the row before anything was written.
    NotHeld,
}

/// Find another item in the organization that owns the page's canonical key.
///
/// Returns `None` when there is no canonical URL, it cannot be normalized,
/// it normalizes to the item's own key, or nobody else owns it yet.
pub async fn canonical_owner(
    storage: &Storage,
    item: &IndexedItem,
    canonical_url: Option<&str>,
) -> Result<Option<IndexedItem>> {
    let Some(canonical) = canonical_url else {
        return Ok(None);
    };
    let key = match normalize_url(canonical) {
        Ok(key) => key,
        Err(e) => {
            warn!(index_id = %item.id, %canonical, error = %e, "ignoring unparseable canonical url");
            return Ok(None);
        }
    };
    if key == item.normalized_url {
        return Ok(None);
    }

    let owner = storage
        .find_by_normalized_url(&item.org_id, &key)
        .await?
        .filter(|other| other.id != item.id);
    Ok(owner)
}

/// Cut `content` to at most `max_chars` characters on a char boundary.
pub fn cap_content(mut content: String, max_chars: usize) -> (String, bool) {
    match content.char_indices().nth(max_chars) {
        Some((byte_index, _)) => {
            content.truncate(byte_index);
            (content, true)
        }
        None => (content, false),
    }
}

/// Run both dedup checks and persist the page if it survives them.
///
/// `hold` keeps a claimed row PROCESSING after the save (see
/// [`Storage::save_scraped`]).
pub async fn persist_unique(
    storage: &Storage,
    item: &IndexedItem,
    writer: Writer,
    hold: bool,
    page: PageContent,
    max_chars: usize,
) -> Result<Persisted> {
    if let Some(owner) = canonical_owner(storage, item, page.canonical_url.as_deref()).await? {
        let reason = same_canonical_reason(&owner.url);
        if !storage
            .mark_skipped(writer, &reason, page.canonical_url.as_deref())
            .await?
        {
            return Ok(Persisted::NotHeld);
        }
        info!(index_id = %item.id, owner = %owner.id, "skipped: same canonical url");
        return Ok(Persisted::Skipped { reason });
    }

    let (content, truncated) = cap_content(page.content, max_chars);
    if truncated {
        warn!(index_id = %item.id, max_chars, "content truncated at size cap");
    }

    let scraped = ScrapedPage {
        hash: content_hash(&content),
        content,
        title: page.title,
        description: page.description,
        canonical_url: page.canonical_url,
        truncated,
    };

    match storage.save_scraped(writer, &scraped, hold).await? {
        SaveOutcome::Saved => {
            debug!(index_id = %item.id, hash = %scraped.hash, "content saved");
            Ok(Persisted::Saved { truncated })
        }
        SaveOutcome::DuplicateHash { index_id, url } => {
            let reason = duplicated_content_reason(&url);
            if !storage
                .mark_skipped(writer, &reason, scraped.canonical_url.as_deref())
                .await?
            {
                return Ok(Persisted::NotHeld);
            }
            info!(index_id = %item.id, owner = %index_id, "skipped: duplicated content");
            Ok(Persisted::Skipped { reason })
        }
        SaveOutcome::NotHeld => Ok(Persisted::NotHeld),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed, test_storage};
    use crate::testing::claim;
    use webindex_shared::{IndexStatus, OrgId};

    fn direct(item: &IndexedItem) -> Writer {
        Writer::Direct(item.id)
    }

    #[test]
    fn cap_content_respects_char_boundaries() {
        let (short, truncated) = cap_content("héllo".to_string(), 10);
        assert_eq!(short, "héllo");
        assert!(!truncated);

        let (cut, truncated) = cap_content("héllo wörld".to_string(), 8);
        assert_eq!(cut, "héllo wö");
        assert!(truncated);

        let (exact, truncated) = cap_content("abc".to_string(), 3);
        assert_eq!(exact, "abc");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn canonical_pointing_at_other_item_skips() {
        let (storage, _db) = test_storage().await;
        let org = OrgId::new("org");
        let owner = seed(&storage, &org, "https://example.com/guide").await;
        let mirror = seed(&storage, &org, "https://example.com/guide-copy").await;

        let page = PageContent {
            content: "Guide".into(),
            canonical_url: Some("https://www.example.com/guide?ref=nav".into()),
            ..Default::default()
        };
        let persisted = persist_unique(&storage, &mirror, direct(&mirror), false, page, 1000)
            .await
            .unwrap();
        assert_eq!(
            persisted,
            Persisted::Skipped {
                reason: "Same canonical url of: https://example.com/guide".into()
            }
        );

        let mirror = storage.get_index(&mirror.id).await.unwrap().unwrap();
        assert_eq!(mirror.status, IndexStatus::Skipped);
        assert!(mirror.skip);
        assert_eq!(
            mirror.canonical_url.as_deref(),
            Some("https://www.example.com/guide?ref=nav")
        );
        assert!(storage.get_content(&mirror.id).await.unwrap().is_none());
        assert_eq!(
            storage.get_index(&owner.id).await.unwrap().unwrap().status,
            IndexStatus::Pending
        );
    }

    #[tokio::test]
    async fn canonical_to_self_or_unknown_key_is_kept() {
        let (storage, _db) = test_storage().await;
        let org = OrgId::new("org");
        let item = seed(&storage, &org, "https://example.com/a").await;

        let own = canonical_owner(&storage, &item, Some("https://EXAMPLE.com/a?x=1"))
            .await
            .unwrap();
        assert!(own.is_none());

        let page = PageContent {
            content: "A".into(),
            canonical_url: Some("https://example.com/elsewhere".into()),
            ..Default::default()
        };
        let persisted = persist_unique(&storage, &item, direct(&item), false, page, 1000)
            .await
            .unwrap();
        assert_eq!(persisted, Persisted::Saved { truncated: false });
        let item = storage.get_index(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, IndexStatus::Scraped);
        assert_eq!(item.canonical_url.as_deref(), Some("https://example.com/elsewhere"));
    }

    #[tokio::test]
    async fn identical_content_skips_second_item() {
        let (storage, _db) = test_storage().await;
        let org = OrgId::new("org");
        let first = seed(&storage, &org, "https://example.com/one").await;
        let second = seed(&storage, &org, "https://example.com/two").await;

        let page = || PageContent {
            content: "Same body".into(),
            ..Default::default()
        };
        persist_unique(&storage, &first, direct(&first), false, page(), 1000).await.unwrap();
        let persisted = persist_unique(&storage, &second, direct(&second), false, page(), 1000)
            .await
            .unwrap();

        assert_eq!(
            persisted,
            Persisted::Skipped {
                reason: "Duplicated content from: https://example.com/one".into()
            }
        );
        assert!(storage.get_content(&second.id).await.unwrap().is_none());
        assert!(storage.get_index(&second.id).await.unwrap().unwrap().hash.is_none());
    }

    #[tokio::test]
    async fn same_content_in_other_org_is_kept() {
        let (storage, _db) = test_storage().await;
        let a = seed(&storage, &OrgId::new("a"), "https://example.com/x").await;
        let b = seed(&storage, &OrgId::new("b"), "https://example.com/x").await;

        let page = || PageContent {
            content: "Shared".into(),
            ..Default::default()
        };
        persist_unique(&storage, &a, direct(&a), false, page(), 1000).await.unwrap();
        let persisted = persist_unique(&storage, &b, direct(&b), false, page(), 1000)
            .await
            .unwrap();
        assert_eq!(persisted, Persisted::Saved { truncated: false });
    }

    #[tokio::test]
    async fn oversized_content_is_truncated_and_flagged() {
        let (storage, _db) = test_storage().await;
        let org = OrgId::new("org");
        let item = seed(&storage, &org, "https://example.com/long").await;

        let page = PageContent {
            content: "x".repeat(50),
            ..Default::default()
        };
        let persisted = persist_unique(&storage, &item, direct(&item), false, page, 20)
            .await
            .unwrap();
        assert_eq!(persisted, Persisted::Saved { truncated: true });

        let content = storage.get_content(&item.id).await.unwrap().unwrap();
        assert_eq!(content.chars().count(), 20);
        assert!(storage.get_index(&item.id).await.unwrap().unwrap().truncated);
    }

    #[tokio::test]
    async fn held_save_keeps_claim_until_done() {
        let (storage, _db) = test_storage().await;
        let org = OrgId::new("org");
        let item = seed(&storage, &org, "https://example.com/a").await;
        let lease = claim(&storage, &item).await;

        let page = PageContent {
            content: "Body".into(),
            ..Default::default()
        };
        let persisted = persist_unique(&storage, &item, lease.into(), true, page, 1000)
            .await
            .unwrap();
        assert_eq!(persisted, Persisted::Saved { truncated: false });
        let item = storage.get_index(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, IndexStatus::Processing);
        assert!(storage.mark_done(lease.into()).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_under_lost_claim_writes_nothing() {
        let (storage, _db) = test_storage().await;
        let org = OrgId::new("org");
        let first = seed(&storage, &org, "https://example.com/one").await;
        let second = seed(&storage, &org, "https://example.com/two").await;
        let page = || PageContent {
            content: "Same body".into(),
            ..Default::default()
        };
        persist_unique(&storage, &first, direct(&first), false, page(), 1000)
            .await
            .unwrap();

        let lease = claim(&storage, &second).await;
        // Reset under the claim, as a re-submission does
        seed(&storage, &org, "https://example.com/two").await;

        let persisted = persist_unique(&storage, &second, lease.into(), true, page(), 1000)
            .await
            .unwrap();
        assert_eq!(persisted, Persisted::NotHeld);
        let second = storage.get_index(&second.id).await.unwrap().unwrap();
        assert_eq!(second.status, IndexStatus::Pending);
        assert!(!second.skip);
    }
}
