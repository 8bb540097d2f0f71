//! Durable task queue backing the queued dispatch strategy.
//!
//! Tasks are opaque to storage: `kind` and `payload` are interpreted by the
//! worker. Claims use the same compare-and-swap pattern as indexed items, so
//! several workers can drain one database.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Row, params};
use uuid::Uuid;
use webindex_shared::{IndexError, OrgId, Result};

use crate::{Storage, db_err, finish, parse_ts, to_chrono, ts};

const TASK_COLUMNS: &str =
    "id, org_id, kind, payload, status, attempts, run_after, last_error, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    /// Dead-lettered: out of attempts or permanently failed.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(IndexError::parse(format!("unknown task status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub org_id: OrgId,
    pub kind: String,
    pub payload: String,
    pub run_after: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub org_id: OrgId,
    pub kind: String,
    pub payload: String,
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    pub run_after: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    /// Insert tasks in one transaction. Returns their ids in order.
    pub async fn enqueue_tasks(&self, tasks: &[NewTask]) -> Result<Vec<String>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self.begin_immediate().await?;
        let result: Result<_> = async {
            let now = ts(Utc::now());
            let mut ids = Vec::with_capacity(tasks.len());
            for task in tasks {
                let id = Uuid::now_v7().to_string();
                tx.execute(
                    "INSERT INTO tasks (id, org_id, kind, payload, status, attempts, run_after,
                         created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?6)",
                    params![
                        id.as_str(),
                        task.org_id.as_str(),
                        task.kind.as_str(),
                        task.payload.as_str(),
                        ts(task.run_after),
                        now.as_str()
                    ],
                )
                .await
                .map_err(db_err)?;
                ids.push(id);
            }
            Ok(ids)
        }
        .await;
        finish(tx, result).await
    }

    /// Claim the next runnable task: pending and due, or running but not
    /// updated for `stale_after` (its worker died).
    pub async fn claim_task(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Option<TaskRecord>> {
        self.check_writable()?;
        let now_ts = ts(now);
        let stale_before = ts(now - to_chrono(stale_after)?);
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (status = 'pending' AND run_after <= ?1)
                OR (status = 'running' AND updated_at < ?2)
             ORDER BY run_after, created_at, id LIMIT 1"
        );

        for _ in 0..5 {
            let mut rows = self
                .conn
                .query(&sql, params![now_ts.as_str(), stale_before.as_str()])
                .await
                .map_err(db_err)?;
            let Some(row) = rows.next().await.map_err(db_err)? else {
                return Ok(None);
            };
            let mut task = row_to_task(&row)?;
            drop(rows);

            let changed = self
                .conn
                .execute(
                    "UPDATE tasks SET status = 'running', updated_at = ?1
                     WHERE id = ?2 AND status = ?3 AND updated_at = ?4",
                    params![
                        now_ts.as_str(),
                        task.id.as_str(),
                        task.status.as_str(),
                        ts(task.updated_at)
                    ],
                )
                .await
                .map_err(db_err)?;
            if changed == 1 {
                task.status = TaskStatus::Running;
                task.updated_at = now;
                return Ok(Some(task));
            }
            tracing::debug!(task_id = %task.id, "task claim lost, retrying");
        }
        Ok(None)
    }

    pub async fn complete_task(&self, id: &str) -> Result<()> {
        self.set_task_state(id, TaskStatus::Succeeded, None, None, false)
            .await
    }

    /// Count a failed attempt and schedule the task again at `run_after`.
    pub async fn retry_task(&self, id: &str, error: &str, run_after: DateTime<Utc>) -> Result<()> {
        self.set_task_state(id, TaskStatus::Pending, Some(error), Some(run_after), true)
            .await
    }

    /// Put the task back without counting an attempt (rate-limit backoff).
    pub async fn defer_task(&self, id: &str, run_after: DateTime<Utc>) -> Result<()> {
        self.set_task_state(id, TaskStatus::Pending, None, Some(run_after), false)
            .await
    }

    /// Dead-letter the task.
    pub async fn fail_task(&self, id: &str, error: &str) -> Result<()> {
        self.set_task_state(id, TaskStatus::Failed, Some(error), None, true)
            .await
    }

    async fn set_task_state(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
        run_after: Option<DateTime<Utc>>,
        count_attempt: bool,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE tasks SET status = ?1,
                     last_error = COALESCE(?2, last_error),
                     run_after = COALESCE(?3, run_after),
                     attempts = attempts + ?4,
                     updated_at = ?5
                 WHERE id = ?6",
                params![
                    status.as_str(),
                    error.map(str::to_string),
                    run_after.map(ts),
                    i64::from(count_attempt),
                    ts(Utc::now()),
                    id
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let mut rows = self.conn.query(&sql, params![id]).await.map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_tasks(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY run_after, created_at, id"
        );
        let mut rows = self
            .conn
            .query(&sql, params![status.as_str()])
            .await
            .map_err(db_err)?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    pub async fn count_tasks(&self, status: TaskStatus) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                params![status.as_str()],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)? as u64),
            None => Ok(0),
        }
    }
}

fn row_to_task(row: &Row) -> Result<TaskRecord> {
    let text = |idx: i32| row.get::<String>(idx).map_err(db_err);
    Ok(TaskRecord {
        id: text(0)?,
        org_id: OrgId::new(text(1)?),
        kind: text(2)?,
        payload: text(3)?,
        status: text(4)?.parse()?,
        attempts: row.get::<i64>(5).map_err(db_err)? as u32,
        run_after: parse_ts(&text(6)?)?,
        last_error: row.get::<String>(7).ok(),
        created_at: parse_ts(&text(8)?)?,
        updated_at: parse_ts(&text(9)?)?,
    })
}
