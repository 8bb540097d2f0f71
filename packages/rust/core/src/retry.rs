//! Per-item retry policy.
//!
//! [`process_with_retry`] is the boundary between the pipeline and any batch
//! driver: it never returns an error. A failed item ends ERROR with a readable
//! message and the caller gets [`ProcessOutcome::Failed`] telling it whether a
//! queue-level retry could help.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use webindex_shared::{PipelineConfig, Result};
use webindex_storage::{Lease, Storage};

/// Terminal or resumable result of processing one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Embedded and DONE.
    Done { chunks: usize },
    /// Content stored; embedding is left to a later step.
    Scraped,
    /// Sitemap origin enumerated; the origin itself is DONE without content.
    SitemapRead { children: usize },
    Skipped { reason: String },
    /// The claim was lost (reclaimed, reset or deleted) and nothing more was written.
    Superseded,
    Failed {
        error: String,
        /// Whether an outer retry (queue redelivery) may succeed.
        retryable: bool,
        /// Upstream quota: back off the task kind instead of counting an attempt.
        rate_limited: bool,
    },
}

impl ProcessOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Short label for logs and CLI output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Done { .. } => "done",
            Self::Scraped => "scraped",
            Self::SitemapRead { .. } => "sitemap",
            Self::Skipped { .. } => "skipped",
            Self::Superseded => "superseded",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts in total, at least one.
    pub max_attempts: u32,
    /// Sleep before attempt `n + 1` is `n * base_delay`.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Duration::from_millis(1000))
    }
}

impl From<&PipelineConfig> for RetryPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self::new(config.max_retries, config.retry_base_delay())
    }
}

/// Run `attempt` until it succeeds, fails permanently, or attempts run out.
///
/// `attempt` receives the 1-based attempt number. On final failure the item
/// is moved to ERROR with the error message, provided `lease` still holds it.
pub async fn process_with_retry<F, Fut>(
    storage: &Storage,
    lease: &Lease,
    policy: RetryPolicy,
    mut attempt: F,
) -> ProcessOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<ProcessOutcome>>,
{
    let index_id = &lease.index_id;
    let mut number = 1;
    loop {
        let err = match attempt(number).await {
            Ok(outcome) => return outcome,
            Err(err) => err,
        };

        let retryable = err.is_retryable();
        if retryable && number < policy.max_attempts {
            let delay = policy.delay_after(number);
            warn!(
                index_id = %index_id,
                attempt = number,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            match storage.touch(lease).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(index_id = %index_id, "claim lost between attempts");
                    return ProcessOutcome::Superseded;
                }
                Err(e) => warn!(index_id = %index_id, error = %e, "failed to refresh claim"),
            }
            number += 1;
            continue;
        }

        let message = err.to_string();
        match storage.mark_error((*lease).into(), &message).await {
            Ok(true) => {}
            Ok(false) => {
                info!(index_id = %index_id, error = %message, "claim lost, failure not recorded");
                return ProcessOutcome::Superseded;
            }
            Err(e) => error!(index_id = %index_id, error = %e, "failed to record item error"),
        }
        info!(
            index_id = %index_id,
            attempts = number,
            retryable,
            error = %message,
            "item failed"
        );
        return ProcessOutcome::Failed {
            error: message,
            retryable,
            rate_limited: err.is_rate_limit(),
        };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::testing::{claim, seed, test_storage};
    use webindex_shared::{IndexError, IndexStatus, OrgId};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn transient_errors_retry_up_to_the_limit() {
        let (storage, _db) = test_storage().await;
        let item = seed(&storage, &OrgId::new("org"), "https://example.com/a").await;
        let lease = claim(&storage, &item).await;
        let calls = AtomicU32::new(0);

        let outcome = process_with_retry(&storage, &lease, fast(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(IndexError::Network("connection reset".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            outcome,
            ProcessOutcome::Failed {
                error: "network error: connection reset".into(),
                retryable: true,
                rate_limited: false,
            }
        );
        let item = storage.get_index(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, IndexStatus::Error);
        assert_eq!(item.error.as_deref(), Some("network error: connection reset"));
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let (storage, _db) = test_storage().await;
        let item = seed(&storage, &OrgId::new("org"), "https://example.com/a").await;
        let lease = claim(&storage, &item).await;
        let calls = AtomicU32::new(0);

        let outcome = process_with_retry(&storage, &lease, fast(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(IndexError::not_found("https://example.com/a: HTTP 404")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            outcome,
            ProcessOutcome::Failed { retryable: false, rate_limited: false, .. }
        ));
    }

    #[tokio::test]
    async fn success_after_failure_returns_outcome() {
        let (storage, _db) = test_storage().await;
        let item = seed(&storage, &OrgId::new("org"), "https://example.com/a").await;
        let lease = claim(&storage, &item).await;

        let outcome = process_with_retry(&storage, &lease, fast(2), |attempt| async move {
            if attempt == 1 {
                Err(IndexError::Storage("database is locked".into()))
            } else {
                Ok(ProcessOutcome::Done { chunks: 2 })
            }
        })
        .await;

        assert_eq!(outcome, ProcessOutcome::Done { chunks: 2 });
        assert_ne!(
            storage.get_index(&item.id).await.unwrap().unwrap().status,
            IndexStatus::Error
        );
    }

    #[tokio::test]
    async fn default_policy_attempts_once() {
        let (storage, _db) = test_storage().await;
        let item = seed(&storage, &OrgId::new("org"), "https://example.com/a").await;
        let lease = claim(&storage, &item).await;
        let calls = AtomicU32::new(0);

        let outcome = process_with_retry(&storage, &lease, RetryPolicy::new(0, Duration::ZERO), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(IndexError::RateLimited("HTTP 429".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            outcome,
            ProcessOutcome::Failed { retryable: true, rate_limited: true, .. }
        ));
    }

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));
        assert_eq!(policy.delay_after(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(2), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn lost_claim_is_not_marked_error() {
        let (storage, _db) = test_storage().await;
        let org = OrgId::new("org");
        let item = seed(&storage, &org, "https://example.com/a").await;
        let lease = claim(&storage, &item).await;

        let outcome = process_with_retry(&storage, &lease, fast(1), |_| {
            let (storage, org) = (storage.clone(), org.clone());
            async move {
                // Re-submitted while this attempt was running
                seed(&storage, &org, "https://example.com/a").await;
                Err(IndexError::not_found("https://example.com/a: HTTP 404"))
            }
        })
        .await;

        assert_eq!(outcome, ProcessOutcome::Superseded);
        let item = storage.get_index(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, IndexStatus::Pending);
        assert!(item.error.is_none());
    }
}
