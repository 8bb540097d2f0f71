//! Queue consumer for the queued dispatch strategy.
//!
//! ```text
//! QueueWorker
//!     │
//!     ├─► claim a due task (CAS on the tasks table)
//!     ├─► rate window check per task kind ─► defer when full
//!     ├─► per-item processing via Orchestrator::process_by_id
//!     └─► complete / retry with backoff / defer after quota / dead-letter
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use webindex_shared::{AppConfig, IndexError, IndexId, IndexStatus, OrgId, Result};
use webindex_storage::{Storage, TaskRecord};

use super::{TaskKind, TaskPayload, TaskQueue, task_batches};
use crate::orchestrator::{Orchestrator, ProcessMode};
use crate::rate_limit::RateLimiter;
use crate::retry::ProcessOutcome;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// A running task not updated for this long is reclaimed.
    pub stale_after: Duration,
    /// Attempts before a task with retryable failures is dead-lettered.
    pub max_attempts: u32,
    /// Linear backoff unit for task retries.
    pub retry_base_delay: Duration,
    /// Ids per task when fanning out index-all.
    pub batch_size: usize,
}

impl WorkerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.pipeline.poll_interval(),
            stale_after: config.pipeline.stuck_timeout(),
            max_attempts: config.dispatch.max_task_attempts.max(1),
            retry_base_delay: config.pipeline.retry_base_delay(),
            batch_size: config.dispatch.batch_size.max(1),
        }
    }
}

/// What the worker did with one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskReport {
    Completed { task_id: String, kind: TaskKind },
    /// Rate window full or upstream quota hit; rescheduled without an attempt.
    Deferred { task_id: String, wait: Duration },
    Retried { task_id: String, attempt: u32 },
    DeadLettered { task_id: String, error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub deferred: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl WorkerStats {
    fn record(&mut self, report: &TaskReport) {
        match report {
            TaskReport::Completed { .. } => self.completed += 1,
            TaskReport::Deferred { .. } => self.deferred += 1,
            TaskReport::Retried { .. } => self.retried += 1,
            TaskReport::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }
}

/// Per-item results of one task.
#[derive(Debug, Default)]
struct BatchResult {
    retry_ids: Vec<IndexId>,
    permanent_failures: usize,
    rate_limited: bool,
    last_error: Option<String>,
}

pub struct QueueWorker {
    queue: Arc<dyn TaskQueue>,
    storage: Arc<Storage>,
    orchestrator: Arc<Orchestrator>,
    limiter: RateLimiter,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        storage: Arc<Storage>,
        orchestrator: Arc<Orchestrator>,
        limiter: RateLimiter,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            storage,
            orchestrator,
            limiter,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Call `store(true, Ordering::SeqCst)` on the handle to stop the loop
    /// after the current task.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Poll and execute tasks until shutdown, or until no task is due when
    /// `exit_when_idle` is set.
    pub async fn run(&self, exit_when_idle: bool) -> WorkerStats {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            "queue worker starting"
        );

        let mut stats = WorkerStats::default();
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.run_once().await {
                Ok(Some(report)) => stats.record(&report),
                Ok(None) if exit_when_idle => break,
                Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
                Err(e) => {
                    error!(error = %e, "failed to claim task");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        info!(
            completed = stats.completed,
            retried = stats.retried,
            deferred = stats.deferred,
            dead_lettered = stats.dead_lettered,
            "queue worker stopped"
        );
        stats
    }

    /// [`Self::run`] with a Ctrl-C handler installed.
    pub async fn run_until_ctrl_c(&self, exit_when_idle: bool) -> WorkerStats {
        let shutdown = self.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested, finishing current task");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
        self.run(exit_when_idle).await
    }

    /// Claim and execute at most one task. `None` when no task is due.
    pub async fn run_once(&self) -> Result<Option<TaskReport>> {
        let Some(task) = self.queue.claim(Utc::now(), self.config.stale_after).await? else {
            return Ok(None);
        };

        let report = match self.execute(&task).await {
            Ok(report) => report,
            Err(e) => self.handle_task_error(&task, e).await?,
        };
        Ok(Some(report))
    }

    #[instrument(skip_all, fields(task_id = %task.id, kind = %task.kind, org = %task.org_id, attempts = task.attempts))]
    async fn execute(&self, task: &TaskRecord) -> Result<TaskReport> {
        let kind: TaskKind = task.kind.parse()?;

        if let Err(wait) = self.limiter.try_acquire(kind.as_str()) {
            debug!(wait_ms = wait.as_millis() as u64, "rate window full, deferring");
            return self.defer(task, wait).await;
        }

        let mode = match kind {
            TaskKind::IndexAll => return self.fan_out(task).await,
            TaskKind::Process => ProcessMode::Full,
            TaskKind::Embed => ProcessMode::EmbedOnly,
            TaskKind::GetContent => ProcessMode::ContentOnly,
        };

        let payload = TaskPayload::decode(&task.payload)?;
        let batch = self.process_items(&task.org_id, &payload.ids, mode).await;

        if batch.rate_limited {
            self.limiter.back_off(kind.as_str());
            self.reset_items(kind, &task.org_id, &batch.retry_ids).await?;
            warn!("upstream quota hit, backing off task kind");
            return self.defer(task, self.limiter.window()).await;
        }

        let error = batch
            .last_error
            .clone()
            .unwrap_or_else(|| "item processing failed".to_string());

        if !batch.retry_ids.is_empty() {
            let attempt = task.attempts + 1;
            if attempt < self.config.max_attempts {
                self.reset_items(kind, &task.org_id, &batch.retry_ids).await?;
                let delay = self.config.retry_base_delay * attempt;
                self.queue
                    .retry(&task.id, &error, Utc::now() + to_chrono(delay)?)
                    .await?;
                info!(attempt, retry_items = batch.retry_ids.len(), "task scheduled for retry");
                return Ok(TaskReport::Retried {
                    task_id: task.id.clone(),
                    attempt,
                });
            }
        }

        if !batch.retry_ids.is_empty() || batch.permanent_failures > 0 {
            self.queue.fail(&task.id, &error).await?;
            warn!(error = %error, "task dead-lettered");
            return Ok(TaskReport::DeadLettered {
                task_id: task.id.clone(),
                error,
            });
        }

        self.queue.complete(&task.id).await?;
        debug!("task completed");
        Ok(TaskReport::Completed {
            task_id: task.id.clone(),
            kind,
        })
    }

    async fn process_items(&self, org: &OrgId, ids: &[IndexId], mode: ProcessMode) -> BatchResult {
        let mut batch = BatchResult::default();
        for id in ids {
            match self.orchestrator.process_by_id(org, id, mode).await {
                Ok(Some(report)) => {
                    if let ProcessOutcome::Failed {
                        error,
                        retryable,
                        rate_limited,
                    } = report.outcome
                    {
                        batch.rate_limited |= rate_limited;
                        if retryable {
                            batch.retry_ids.push(*id);
                        } else {
                            batch.permanent_failures += 1;
                        }
                        batch.last_error = Some(error);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(index_id = %id, error = %e, "could not process item");
                    if e.is_retryable() {
                        batch.retry_ids.push(*id);
                    } else {
                        batch.permanent_failures += 1;
                    }
                    batch.last_error = Some(e.to_string());
                }
            }
        }
        batch
    }

    /// Make failed items claimable again before the task reruns.
    async fn reset_items(&self, kind: TaskKind, org: &OrgId, ids: &[IndexId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        match kind {
            TaskKind::Embed => {
                self.storage.mark_for_embedding(org, ids).await?;
            }
            _ => {
                self.storage.set_status(org, ids, IndexStatus::Pending).await?;
            }
        }
        Ok(())
    }

    /// Expand index-all into process tasks for every PENDING_CLEAN item.
    async fn fan_out(&self, task: &TaskRecord) -> Result<TaskReport> {
        let ids: Vec<IndexId> = self
            .storage
            .list_by_org(&task.org_id, Some(IndexStatus::PendingClean))
            .await?
            .into_iter()
            .map(|item| item.id)
            .collect();
        let tasks = task_batches(&task.org_id, TaskKind::Process, &ids, self.config.batch_size)?;
        self.queue.enqueue(&tasks).await?;
        self.queue.complete(&task.id).await?;
        info!(items = ids.len(), tasks = tasks.len(), "index-all fanned out");
        Ok(TaskReport::Completed {
            task_id: task.id.clone(),
            kind: TaskKind::IndexAll,
        })
    }

    async fn defer(&self, task: &TaskRecord, wait: Duration) -> Result<TaskReport> {
        self.queue
            .defer(&task.id, Utc::now() + to_chrono(wait)?)
            .await?;
        Ok(TaskReport::Deferred {
            task_id: task.id.clone(),
            wait,
        })
    }

    /// Task-level failure (bad payload, storage outage) outside item processing.
    async fn handle_task_error(&self, task: &TaskRecord, err: IndexError) -> Result<TaskReport> {
        let attempt = task.attempts + 1;
        if err.is_retryable() && attempt < self.config.max_attempts {
            warn!(task_id = %task.id, attempt, error = %err, "task failed, retrying");
            let delay = self.config.retry_base_delay * attempt;
            self.queue
                .retry(&task.id, &err.to_string(), Utc::now() + to_chrono(delay)?)
                .await?;
            return Ok(TaskReport::Retried {
                task_id: task.id.clone(),
                attempt,
            });
        }

        error!(task_id = %task.id, error = %err, "task dead-lettered");
        self.queue.fail(&task.id, &err.to_string()).await?;
        Ok(TaskReport::DeadLettered {
            task_id: task.id.clone(),
            error: err.to_string(),
        })
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| IndexError::validation(format!("duration out of range: {e}")))
}
