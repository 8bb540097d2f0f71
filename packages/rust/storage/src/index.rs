//! Indexed items: registry upserts, claims, lifecycle writes, deletes.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, Row, Rows, params};
use tracing::debug;
use webindex_shared::{IndexError, IndexId, IndexStatus, IndexedItem, OrgId, Result, ScrapeOptions};

use crate::{Storage, db_err, finish, parse_ts, to_chrono, ts};

const INDEX_COLUMNS: &str = "id, org_id, url, normalized_url, do_crawl, is_sitemap, \
     found_from_index_id, depth, scrape_options, status, error, skip, skip_reason, \
     canonical_url, hash, title, description, truncated, created_at, updated_at, indexed_at";

/// Rows a claim may pick up. `?2` binds the stuck-before timestamp.
const CLAIMABLE: &str = "(status IN ('PENDING', 'SCRAPED', 'PENDING_CLEAN') \
     OR (status = 'PROCESSING' AND updated_at < ?2))";

/// PENDING_CLEAN drains after everything else.
const CLAIM_ORDER: &str =
    "CASE status WHEN 'PENDING_CLEAN' THEN 1 ELSE 0 END, created_at, id";

/// How many times a lost compare-and-swap is retried with a fresh candidate.
const CLAIM_ATTEMPTS: usize = 5;

/// Attributes for inserting or re-submitting an item.
#[derive(Debug, Clone)]
pub struct NewIndex {
    pub org_id: OrgId,
    pub url: String,
    pub normalized_url: String,
    pub do_crawl: bool,
    pub is_sitemap: bool,
    pub found_from_index_id: Option<IndexId>,
    pub depth: u32,
    pub scrape_options: Option<ScrapeOptions>,
}

impl NewIndex {
    /// A root item with no crawl behaviour.
    pub fn root(org: &OrgId, url: impl Into<String>, normalized_url: impl Into<String>) -> Self {
        Self {
            org_id: org.clone(),
            url: url.into(),
            normalized_url: normalized_url.into(),
            do_crawl: false,
            is_sitemap: false,
            found_from_index_id: None,
            depth: 0,
            scrape_options: None,
        }
    }

    /// A crawl child discovered from `origin` at `depth`.
    pub fn child(
        origin: &IndexedItem,
        url: impl Into<String>,
        normalized_url: impl Into<String>,
        depth: u32,
    ) -> Self {
        Self {
            org_id: origin.org_id.clone(),
            url: url.into(),
            normalized_url: normalized_url.into(),
            do_crawl: false,
            is_sitemap: false,
            found_from_index_id: Some(origin.id),
            depth,
            scrape_options: None,
        }
    }
}

/// Proof of one claim on an item. Lifecycle writes made with a lease only
/// land while the row is still PROCESSING under that same claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub index_id: IndexId,
    pub claimed_at: DateTime<Utc>,
}

/// Who is writing an item's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    /// The current claim holder.
    Claim(Lease),
    /// A caller outside any claim. Refused while the row is PROCESSING.
    Direct(IndexId),
}

impl Writer {
    pub fn id(&self) -> &IndexId {
        match self {
            Self::Claim(lease) => &lease.index_id,
            Self::Direct(id) => id,
        }
    }

    fn stamp(&self) -> Option<String> {
        match self {
            Self::Claim(lease) => Some(ts(lease.claimed_at)),
            Self::Direct(_) => None,
        }
    }
}

impl From<Lease> for Writer {
    fn from(lease: Lease) -> Self {
        Self::Claim(lease)
    }
}

/// SQL guard for a [`Writer`] whose stamp is bound at `?{n}`.
fn held_by(n: u8) -> String {
    format!(
        "((?{n} IS NULL AND status <> 'PROCESSING') \
         OR (status = 'PROCESSING' AND claimed_at = ?{n}))"
    )
}

/// An item moved to PROCESSING by a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimedIndex {
    pub item: IndexedItem,
    /// Status before the claim; SCRAPED means content is already stored.
    pub previous_status: IndexStatus,
    pub lease: Lease,
}

impl ClaimedIndex {
    pub fn resumes_at_embedding(&self) -> bool {
        self.previous_status == IndexStatus::Scraped
    }
}

/// Result of one conditional child upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildUpsert {
    Created(IndexId),
    /// An OUTDATED row was rediscovered and reset to PENDING.
    Restored(IndexId),
    /// Row exists in another state and was left alone.
    Untouched(IndexId),
}

impl ChildUpsert {
    /// Id of a row that now needs processing.
    pub fn needs_processing(&self) -> Option<IndexId> {
        match self {
            Self::Created(id) | Self::Restored(id) => Some(*id),
            Self::Untouched(_) => None,
        }
    }
}

/// Fetched page data written by [`Storage::save_scraped`].
#[derive(Debug, Clone, Default)]
pub struct ScrapedPage {
    pub content: String,
    pub hash: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub canonical_url: Option<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Another item in the organization already holds the hash.
    DuplicateHash { index_id: IndexId, url: String },
    /// The writer no longer holds the row (reclaimed, reset or deleted).
    NotHeld,
}

impl Storage {
    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Insert an item, or overwrite crawl attributes of the existing row at
    /// (org, normalized_url) and reset it to PENDING. Content identity is kept.
    pub async fn upsert_index(&self, new: &NewIndex) -> Result<IndexedItem> {
        self.check_writable()?;
        let now = ts(Utc::now());
        let options = encode_options(new.scrape_options.as_ref())?;

        self.conn
            .execute(
                "INSERT INTO indexed (id, org_id, url, normalized_url, do_crawl, is_sitemap,
                     found_from_index_id, depth, scrape_options, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'PENDING', ?10, ?10)
                 ON CONFLICT(org_id, normalized_url) DO UPDATE SET
                     url = excluded.url,
                     do_crawl = excluded.do_crawl,
                     is_sitemap = excluded.is_sitemap,
                     found_from_index_id = excluded.found_from_index_id,
                     depth = excluded.depth,
                     scrape_options = excluded.scrape_options,
                     status = 'PENDING',
                     error = NULL,
                     skip = 0,
                     skip_reason = NULL,
                     updated_at = excluded.updated_at",
                params![
                    IndexId::new().to_string(),
                    new.org_id.as_str(),
                    new.url.as_str(),
                    new.normalized_url.as_str(),
                    i64::from(new.do_crawl),
                    i64::from(new.is_sitemap),
                    new.found_from_index_id.map(|id| id.to_string()),
                    i64::from(new.depth),
                    options,
                    now
                ],
            )
            .await
            .map_err(db_err)?;

        self.find_by_normalized_url(&new.org_id, &new.normalized_url)
            .await?
            .ok_or_else(|| IndexError::Storage("upserted row vanished".into()))
    }

    pub async fn get_index(&self, id: &IndexId) -> Result<Option<IndexedItem>> {
        let sql = format!("SELECT {INDEX_COLUMNS} FROM indexed WHERE id = ?1");
        let rows = self
            .conn
            .query(&sql, params![id.to_string()])
            .await
            .map_err(db_err)?;
        first_item(rows).await
    }

    pub async fn find_by_normalized_url(
        &self,
        org: &OrgId,
        normalized_url: &str,
    ) -> Result<Option<IndexedItem>> {
        let sql =
            format!("SELECT {INDEX_COLUMNS} FROM indexed WHERE org_id = ?1 AND normalized_url = ?2");
        let rows = self
            .conn
            .query(&sql, params![org.as_str(), normalized_url])
            .await
            .map_err(db_err)?;
        first_item(rows).await
    }

    /// All items of an organization, oldest first, optionally filtered by status.
    pub async fn list_by_org(
        &self,
        org: &OrgId,
        status: Option<IndexStatus>,
    ) -> Result<Vec<IndexedItem>> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {INDEX_COLUMNS} FROM indexed WHERE org_id = ?1 AND status = ?2 \
                     ORDER BY created_at, id"
                );
                self.conn
                    .query(&sql, params![org.as_str(), status.as_str()])
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {INDEX_COLUMNS} FROM indexed WHERE org_id = ?1 ORDER BY created_at, id"
                );
                self.conn.query(&sql, params![org.as_str()]).await
            }
        }
        .map_err(db_err)?;
        collect_items(rows).await
    }

    /// Items whose crawl back-reference points at `origin`.
    pub async fn list_children(&self, origin: &IndexId) -> Result<Vec<IndexedItem>> {
        let sql = format!(
            "SELECT {INDEX_COLUMNS} FROM indexed WHERE found_from_index_id = ?1 \
             ORDER BY created_at, id"
        );
        let rows = self
            .conn
            .query(&sql, params![origin.to_string()])
            .await
            .map_err(db_err)?;
        collect_items(rows).await
    }

    /// Item counts per status for an organization.
    pub async fn count_by_status(&self, org: &OrgId) -> Result<Vec<(IndexStatus, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM indexed WHERE org_id = ?1 GROUP BY status",
                params![org.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut counts = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status: IndexStatus = row.get::<String>(0).map_err(db_err)?.parse()?;
            let count = row.get::<i64>(1).map_err(db_err)?;
            counts.push((status, count as u64));
        }
        Ok(counts)
    }

    /// Items still waiting for work, including ones being processed.
    pub async fn count_pending(&self, org: &OrgId) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM indexed WHERE org_id = ?1 \
                 AND status IN ('PENDING', 'SCRAPED', 'PENDING_CLEAN', 'PROCESSING')",
                params![org.as_str()],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)? as u64),
            None => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch marks
    // -----------------------------------------------------------------------

    /// Set `status` on the given items of `org`, skipping rows mid-processing.
    /// Returns the number of rows changed.
    pub async fn set_status(&self, org: &OrgId, ids: &[IndexId], status: IndexStatus) -> Result<u64> {
        self.check_writable()?;
        let now = ts(Utc::now());
        let mut changed = 0;
        for id in ids {
            changed += self
                .conn
                .execute(
                    "UPDATE indexed SET status = ?1, error = NULL, updated_at = ?2
                     WHERE id = ?3 AND org_id = ?4 AND status <> 'PROCESSING'",
                    params![status.as_str(), now.as_str(), id.to_string(), org.as_str()],
                )
                .await
                .map_err(db_err)?;
        }
        Ok(changed)
    }

    /// Mark every item of `org` with `status`, skipping rows mid-processing.
    pub async fn set_status_for_org(&self, org: &OrgId, status: IndexStatus) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE indexed SET status = ?1, error = NULL, updated_at = ?2
                 WHERE org_id = ?3 AND status <> 'PROCESSING'",
                params![status.as_str(), ts(Utc::now()), org.as_str()],
            )
            .await
            .map_err(db_err)
    }

    /// Items with stored content become SCRAPED, the rest PENDING.
    /// Returns `(scraped, pending)` counts.
    pub async fn mark_for_embedding(&self, org: &OrgId, ids: &[IndexId]) -> Result<(u64, u64)> {
        self.check_writable()?;
        let now = ts(Utc::now());
        let (mut scraped, mut pending) = (0, 0);
        for id in ids {
            let with_content = self
                .conn
                .execute(
                    "UPDATE indexed SET status = 'SCRAPED', error = NULL, updated_at = ?1
                     WHERE id = ?2 AND org_id = ?3 AND status <> 'PROCESSING'
                       AND EXISTS (SELECT 1 FROM indexed_content c WHERE c.index_id = indexed.id)",
                    params![now.as_str(), id.to_string(), org.as_str()],
                )
                .await
                .map_err(db_err)?;
            if with_content > 0 {
                scraped += with_content;
                continue;
            }
            pending += self
                .set_status(org, std::slice::from_ref(id), IndexStatus::Pending)
                .await?;
        }
        Ok((scraped, pending))
    }

    /// Mark every child of `origin` OUTDATED ahead of a re-crawl.
    pub async fn mark_children_outdated(&self, origin: &IndexId) -> Result<u64> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE indexed SET status = 'OUTDATED', updated_at = ?1
                 WHERE found_from_index_id = ?2 AND status <> 'PROCESSING'",
                params![ts(Utc::now()), origin.to_string()],
            )
            .await
            .map_err(db_err)?;
        debug!(origin = %origin, changed, "children marked outdated");
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Claims
    // -----------------------------------------------------------------------

    /// Atomically claim the next eligible item of `org`.
    ///
    /// Eligible: PENDING, SCRAPED, PENDING_CLEAN, and PROCESSING rows whose
    /// `updated_at` is older than `now - stuck_after`.
    pub async fn claim_next(
        &self,
        org: &OrgId,
        now: DateTime<Utc>,
        stuck_after: Duration,
    ) -> Result<Option<ClaimedIndex>> {
        self.check_writable()?;
        let stuck_before = ts(now - to_chrono(stuck_after)?);
        let sql = format!(
            "SELECT {INDEX_COLUMNS} FROM indexed WHERE org_id = ?1 AND {CLAIMABLE} \
             ORDER BY {CLAIM_ORDER} LIMIT 1"
        );

        for _ in 0..CLAIM_ATTEMPTS {
            let rows = self
                .conn
                .query(&sql, params![org.as_str(), stuck_before.as_str()])
                .await
                .map_err(db_err)?;
            let Some(candidate) = first_item(rows).await? else {
                return Ok(None);
            };
            if let Some(claimed) = self.try_claim(candidate.clone(), now).await? {
                return Ok(Some(claimed));
            }
            debug!(index_id = %candidate.id, "claim lost to another worker, retrying");
        }
        Ok(None)
    }

    /// Claim one specific item if it is eligible.
    pub async fn claim_by_id(
        &self,
        id: &IndexId,
        now: DateTime<Utc>,
        stuck_after: Duration,
    ) -> Result<Option<ClaimedIndex>> {
        self.check_writable()?;
        let stuck_before = ts(now - to_chrono(stuck_after)?);
        let sql = format!("SELECT {INDEX_COLUMNS} FROM indexed WHERE id = ?1 AND {CLAIMABLE}");
        let rows = self
            .conn
            .query(&sql, params![id.to_string(), stuck_before])
            .await
            .map_err(db_err)?;
        match first_item(rows).await? {
            Some(candidate) => self.try_claim(candidate, now).await,
            None => Ok(None),
        }
    }

    /// Compare-and-swap on (id, status, updated_at). The claim stamp becomes
    /// the lease every later lifecycle write is checked against.
    async fn try_claim(&self, mut item: IndexedItem, now: DateTime<Utc>) -> Result<Option<ClaimedIndex>> {
        let changed = self
            .conn
            .execute(
                "UPDATE indexed SET status = 'PROCESSING', updated_at = ?1, claimed_at = ?1,
                     error = NULL
                 WHERE id = ?2 AND status = ?3 AND updated_at = ?4",
                params![
                    ts(now),
                    item.id.to_string(),
                    item.status.as_str(),
                    ts(item.updated_at)
                ],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            return Ok(None);
        }

        let previous_status = item.status;
        item.status = IndexStatus::Processing;
        item.updated_at = now;
        item.error = None;
        let lease = Lease {
            index_id: item.id,
            claimed_at: now,
        };
        Ok(Some(ClaimedIndex {
            item,
            previous_status,
            lease,
        }))
    }

    /// Refresh `updated_at` on a row still held by `lease` so it is not
    /// reclaimed. Returns false once the lease is lost.
    pub async fn touch(&self, lease: &Lease) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE indexed SET updated_at = ?1
                 WHERE id = ?2 AND status = 'PROCESSING' AND claimed_at = ?3",
                params![
                    ts(Utc::now()),
                    lease.index_id.to_string(),
                    ts(lease.claimed_at)
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Frontier
    // -----------------------------------------------------------------------

    /// Conditionally upsert crawl children in one transaction.
    ///
    /// Absent rows are inserted; OUTDATED rows are reset to PENDING with the
    /// new back-reference and depth; any other existing row is left untouched.
    pub async fn upsert_children(&self, children: &[NewIndex]) -> Result<Vec<ChildUpsert>> {
        if children.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self.begin_immediate().await?;
        let result: Result<_> = async {
            let now = ts(Utc::now());
            let mut outcomes = Vec::with_capacity(children.len());
            for child in children {
                outcomes.push(upsert_child(&tx, child, &now).await?);
            }
            Ok(outcomes)
        }
        .await;
        finish(tx, result).await
    }

    // -----------------------------------------------------------------------
    // Lifecycle writes
    // -----------------------------------------------------------------------

    /// Persist fetched content, unless another item in the organization
    /// already holds the same hash.
    ///
    /// With `hold`, a claim holder keeps the row PROCESSING because it goes on
    /// to embed under the same claim; otherwise the row becomes SCRAPED and
    /// is released. The hash check and the writes share one IMMEDIATE
    /// transaction.
    pub async fn save_scraped(
        &self,
        writer: Writer,
        page: &ScrapedPage,
        hold: bool,
    ) -> Result<SaveOutcome> {
        let id = *writer.id();
        let status = match writer {
            Writer::Claim(_) if hold => IndexStatus::Processing,
            _ => IndexStatus::Scraped,
        };
        let tx = self.begin_immediate().await?;
        let result: Result<_> = async {
            let mut rows = tx
                .query(
                    "SELECT other.id, other.url FROM indexed other
                     JOIN indexed me ON me.org_id = other.org_id
                     WHERE me.id = ?1 AND other.hash = ?2 AND other.id <> ?1
                     LIMIT 1",
                    params![id.to_string(), page.hash.as_str()],
                )
                .await
                .map_err(db_err)?;
            if let Some(row) = rows.next().await.map_err(db_err)? {
                let other_id = parse_id(&row.get::<String>(0).map_err(db_err)?)?;
                let url = row.get::<String>(1).map_err(db_err)?;
                return Ok(SaveOutcome::DuplicateHash {
                    index_id: other_id,
                    url,
                });
            }
            drop(rows);

            let now = ts(Utc::now());
            let sql = format!(
                "UPDATE indexed SET status = ?1, hash = ?2, title = ?3, description = ?4,
                     canonical_url = ?5, truncated = ?6, error = NULL, skip = 0,
                     skip_reason = NULL, updated_at = ?7,
                     claimed_at = CASE WHEN ?1 = 'PROCESSING' THEN claimed_at END
                 WHERE id = ?8 AND {}",
                held_by(9)
            );
            let changed = tx
                .execute(
                    &sql,
                    params![
                        status.as_str(),
                        page.hash.as_str(),
                        page.title.clone(),
                        page.description.clone(),
                        page.canonical_url.clone(),
                        i64::from(page.truncated),
                        now.as_str(),
                        id.to_string(),
                        writer.stamp()
                    ],
                )
                .await
                .map_err(db_err)?;
            if changed == 0 {
                return Ok(SaveOutcome::NotHeld);
            }

            tx.execute(
                "INSERT INTO indexed_content (index_id, content, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(index_id) DO UPDATE SET
                     content = excluded.content, updated_at = excluded.updated_at",
                params![id.to_string(), page.content.as_str(), now.as_str()],
            )
            .await
            .map_err(db_err)?;
            Ok(SaveOutcome::Saved)
        }
        .await;
        finish(tx, result).await
    }

    /// Mark an item SKIPPED and drop any content or chunks it held.
    /// Returns false if `writer` no longer holds the row.
    pub async fn mark_skipped(
        &self,
        writer: Writer,
        reason: &str,
        canonical_url: Option<&str>,
    ) -> Result<bool> {
        let id = *writer.id();
        let tx = self.begin_immediate().await?;
        let result: Result<_> = async {
            let sql = format!(
                "UPDATE indexed SET status = 'SKIPPED', skip = 1, skip_reason = ?1,
                     canonical_url = COALESCE(?2, canonical_url), hash = NULL,
                     error = NULL, updated_at = ?3, claimed_at = NULL
                 WHERE id = ?4 AND {}",
                held_by(5)
            );
            let changed = tx
                .execute(
                    &sql,
                    params![
                        reason,
                        canonical_url.map(str::to_string),
                        ts(Utc::now()),
                        id.to_string(),
                        writer.stamp()
                    ],
                )
                .await
                .map_err(db_err)?;
            if changed == 0 {
                return Ok(false);
            }
            delete_owned_rows(&tx, &id).await?;
            Ok(true)
        }
        .await;
        finish(tx, result).await
    }

    /// Record a failure message and move the item to ERROR. Returns false if
    /// `writer` no longer holds the row.
    pub async fn mark_error(&self, writer: Writer, message: &str) -> Result<bool> {
        self.check_writable()?;
        let sql = format!(
            "UPDATE indexed SET status = 'ERROR', error = ?1, updated_at = ?2, claimed_at = NULL
             WHERE id = ?3 AND {}",
            held_by(4)
        );
        let changed = self
            .conn
            .execute(
                &sql,
                params![message, ts(Utc::now()), writer.id().to_string(), writer.stamp()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Move an item to DONE: a claim holder from its own PROCESSING row, a
    /// direct writer from SCRAPED. Returns false if the row was in another
    /// state (reclaimed, deleted, reset).
    pub async fn mark_done(&self, writer: Writer) -> Result<bool> {
        self.check_writable()?;
        let now = ts(Utc::now());
        let sql = format!(
            "UPDATE indexed SET status = 'DONE', indexed_at = ?1, updated_at = ?1, error = NULL,
                 claimed_at = NULL
             WHERE id = ?2 AND status IN ('PROCESSING', 'SCRAPED') AND {}",
            held_by(3)
        );
        let changed = self
            .conn
            .execute(&sql, params![now, writer.id().to_string(), writer.stamp()])
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    pub async fn get_content(&self, id: &IndexId) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content FROM indexed_content WHERE index_id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Deletes
    // -----------------------------------------------------------------------

    /// Delete one item with its content and chunks. Children are orphaned.
    /// Returns false if no such item existed.
    pub async fn delete_index(&self, id: &IndexId) -> Result<bool> {
        let tx = self.begin_immediate().await?;
        let result: Result<_> = async {
            delete_owned_rows(&tx, id).await?;
            tx.execute(
                "UPDATE indexed SET found_from_index_id = NULL WHERE found_from_index_id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;
            let deleted = tx
                .execute("DELETE FROM indexed WHERE id = ?1", params![id.to_string()])
                .await
                .map_err(db_err)?;
            Ok(deleted > 0)
        }
        .await;
        finish(tx, result).await
    }

    /// Delete an item and every item reachable through back-references.
    /// Returns the number of items deleted.
    pub async fn delete_subtree(&self, root: &IndexId) -> Result<usize> {
        let tx = self.begin_immediate().await?;
        let result: Result<_> = async {
            let mut seen = HashSet::from([*root]);
            let mut queue = VecDeque::from([*root]);
            let mut order = Vec::new();

            while let Some(id) = queue.pop_front() {
                order.push(id);
                let mut rows = tx
                    .query(
                        "SELECT id FROM indexed WHERE found_from_index_id = ?1",
                        params![id.to_string()],
                    )
                    .await
                    .map_err(db_err)?;
                while let Some(row) = rows.next().await.map_err(db_err)? {
                    let child = parse_id(&row.get::<String>(0).map_err(db_err)?)?;
                    if seen.insert(child) {
                        queue.push_back(child);
                    }
                }
            }

            let mut deleted = 0;
            for id in &order {
                delete_owned_rows(&tx, id).await?;
                deleted += tx
                    .execute("DELETE FROM indexed WHERE id = ?1", params![id.to_string()])
                    .await
                    .map_err(db_err)? as usize;
            }
            Ok(deleted)
        }
        .await;
        finish(tx, result).await
    }
}

async fn upsert_child(conn: &Connection, child: &NewIndex, now: &str) -> Result<ChildUpsert> {
    let mut rows = conn
        .query(
            "SELECT id, status FROM indexed WHERE org_id = ?1 AND normalized_url = ?2",
            params![child.org_id.as_str(), child.normalized_url.as_str()],
        )
        .await
        .map_err(db_err)?;
    let existing = match rows.next().await.map_err(db_err)? {
        Some(row) => {
            let id = parse_id(&row.get::<String>(0).map_err(db_err)?)?;
            let status: IndexStatus = row.get::<String>(1).map_err(db_err)?.parse()?;
            Some((id, status))
        }
        None => None,
    };
    drop(rows);

    let options = encode_options(child.scrape_options.as_ref())?;
    let found_from = child.found_from_index_id.map(|id| id.to_string());

    match existing {
        None => {
            let id = IndexId::new();
            conn.execute(
                "INSERT INTO indexed (id, org_id, url, normalized_url, do_crawl, is_sitemap,
                     found_from_index_id, depth, scrape_options, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'PENDING', ?10, ?10)",
                params![
                    id.to_string(),
                    child.org_id.as_str(),
                    child.url.as_str(),
                    child.normalized_url.as_str(),
                    i64::from(child.do_crawl),
                    i64::from(child.is_sitemap),
                    found_from,
                    i64::from(child.depth),
                    options,
                    now
                ],
            )
            .await
            .map_err(db_err)?;
            Ok(ChildUpsert::Created(id))
        }
        Some((id, IndexStatus::Outdated)) => {
            conn.execute(
                "UPDATE indexed SET url = ?1, found_from_index_id = ?2, depth = ?3,
                     scrape_options = ?4, status = 'PENDING', error = NULL, skip = 0,
                     skip_reason = NULL, updated_at = ?5
                 WHERE id = ?6",
                params![
                    child.url.as_str(),
                    found_from,
                    i64::from(child.depth),
                    options,
                    now,
                    id.to_string()
                ],
            )
            .await
            .map_err(db_err)?;
            Ok(ChildUpsert::Restored(id))
        }
        Some((id, _)) => Ok(ChildUpsert::Untouched(id)),
    }
}

/// Remove content and chunks owned by `id`.
async fn delete_owned_rows(conn: &Connection, id: &IndexId) -> Result<()> {
    conn.execute(
        "DELETE FROM chunks WHERE index_id = ?1",
        params![id.to_string()],
    )
    .await
    .map_err(db_err)?;
    conn.execute(
        "DELETE FROM indexed_content WHERE index_id = ?1",
        params![id.to_string()],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

fn encode_options(options: Option<&ScrapeOptions>) -> Result<Option<String>> {
    options
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| IndexError::Storage(format!("failed to encode scrape options: {e}")))
}

pub(crate) fn parse_id(s: &str) -> Result<IndexId> {
    s.parse()
        .map_err(|e| IndexError::Storage(format!("invalid index id '{s}': {e}")))
}

async fn first_item(mut rows: Rows) -> Result<Option<IndexedItem>> {
    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(row_to_item(&row)?)),
        None => Ok(None),
    }
}

async fn collect_items(mut rows: Rows) -> Result<Vec<IndexedItem>> {
    let mut items = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        items.push(row_to_item(&row)?);
    }
    Ok(items)
}

/// Map a row selected with [`INDEX_COLUMNS`].
fn row_to_item(row: &Row) -> Result<IndexedItem> {
    let text = |idx: i32| row.get::<String>(idx).map_err(db_err);
    let opt_text = |idx: i32| row.get::<String>(idx).ok();
    let flag = |idx: i32| row.get::<i64>(idx).map(|v| v != 0).map_err(db_err);

    let scrape_options = opt_text(8)
        .map(|json| serde_json::from_str::<ScrapeOptions>(&json))
        .transpose()
        .map_err(|e| IndexError::Storage(format!("invalid scrape options: {e}")))?;

    Ok(IndexedItem {
        id: parse_id(&text(0)?)?,
        org_id: OrgId::new(text(1)?),
        url: text(2)?,
        normalized_url: text(3)?,
        do_crawl: flag(4)?,
        is_sitemap: flag(5)?,
        found_from_index_id: opt_text(6).map(|s| parse_id(&s)).transpose()?,
        depth: row.get::<i64>(7).map_err(db_err)? as u32,
        scrape_options,
        status: text(9)?.parse()?,
        error: opt_text(10),
        skip: flag(11)?,
        skip_reason: opt_text(12),
        canonical_url: opt_text(13),
        hash: opt_text(14),
        title: opt_text(15),
        description: opt_text(16),
        truncated: flag(17)?,
        created_at: parse_ts(&text(18)?)?,
        updated_at: parse_ts(&text(19)?)?,
        indexed_at: opt_text(20).map(|s| parse_ts(&s)).transpose()?,
    })
}
