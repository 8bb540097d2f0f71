//! libSQL storage layer for the indexing pipeline.
//!
//! The [`Storage`] struct wraps a libSQL database holding indexed items and
//! their content, embedded chunks, and the dispatch task queue.
//!
//! **Concurrency rules:**
//! - Plain reads and single-statement writes share one connection.
//! - Multi-statement writes (conditional upserts, content persistence, chunk
//!   replacement, deletes) open their own connection and run in an
//!   `IMMEDIATE` transaction, so concurrent workers serialize on the write lock.
//! - Claims are compare-and-swap updates guarded on `status` and `updated_at`.
//!   Each claim stamps a [`Lease`]; lifecycle writes from a claim only land
//!   while that lease still holds the row.

mod chunks;
mod index;
mod migrations;
mod tasks;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Transaction, TransactionBehavior, params};
use webindex_shared::{IndexError, Result};

pub use chunks::{NewChunk, StoredChunk};
pub use index::{ChildUpsert, ClaimedIndex, Lease, NewIndex, SaveOutcome, ScrapedPage, Writer};
pub use tasks::{NewTask, TaskRecord, TaskStatus};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IndexError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        // journal_mode returns a row, so it goes through query()
        conn.query("PRAGMA journal_mode = WAL", params![])
            .await
            .map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (dashboards, reporting).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        IndexError::Storage(format!("migration v{} failed: {e}", migration.version))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(IndexError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Start an `IMMEDIATE` transaction on a dedicated connection.
    async fn begin_immediate(&self) -> Result<Transaction> {
        self.check_writable()?;
        let conn = self.db.connect().map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)
    }
}

/// Commit on success, roll back on failure, and hand the result through.
async fn finish<T>(tx: Transaction, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await.map_err(db_err)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

pub(crate) fn db_err(e: libsql::Error) -> IndexError {
    IndexError::Storage(e.to_string())
}

/// Fixed-width UTC timestamp; lexical order matches time order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| IndexError::Storage(format!("invalid date '{s}': {e}")))
}

pub(crate) fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d)
        .map_err(|e| IndexError::validation(format!("duration out of range: {e}")))
}
