//! Retention and purge engine for processed source prefixes.
//!
//! Each prefix that was durably written to the table gets one deletion
//! task. Tasks run in a bounded worker pool and move through an explicit
//! pipeline:
//!
//! ```text
//! START → bulk purge sweep (×10, 2s apart) → enumerate-and-delete → DONE
//!                                             (skipped for today's prefix)
//! ```
//!
//! The bulk purge is eventually consistent, so the sweep repeats and the
//! enumerate pass catches what it missed. Throttling errors are retried
//! with exponential backoff; the retry driver inspects
//! [`Error::is_retryable`], never error text. A task outcome is always a
//! value: deletion failures surface in the aggregate summary and never
//! fail the invocation, because the rows are already committed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use trailhouse_core::storage::{DELETE_BATCH_LIMIT, StorageBackend};
use trailhouse_core::{Error, Result, SourcePrefix};

/// Hard cap on concurrently running deletion tasks.
pub const MAX_CONCURRENT_DELETIONS: usize = 3;

/// Bulk purge sweep iterations per task.
pub const PURGE_SWEEP_ITERATIONS: u32 = 10;

/// Pause between bulk purge sweeps.
pub const SWEEP_PAUSE: Duration = Duration::from_secs(2);

/// Maximum retries for a throttled call.
pub const MAX_THROTTLE_RETRIES: u32 = 3;

/// First backoff delay; doubles per retry (10s, 20s, 40s).
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(10);

/// Wall-clock budget for one deletion task.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// One invocation's processing interval, source of the retention window.
#[derive(Debug, Clone, Copy)]
pub struct ProcessingWindow {
    started_at: DateTime<Utc>,
}

impl ProcessingWindow {
    /// Opens the window at the current instant.
    #[must_use]
    pub fn begin() -> Self {
        Self {
            started_at: Utc::now(),
        }
    }

    /// When the window opened.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Retention hours derived from the elapsed processing time at `now`.
    #[must_use]
    pub fn retention_hours_at(&self, now: DateTime<Utc>) -> u32 {
        retention_hours(now - self.started_at)
    }
}

/// Computes the safe retention window: `ceil(max(1, elapsed_hours))`.
///
/// Objects younger than the window are left alone by the bulk purge, so
/// files written while the job was still reading them are never removed.
#[must_use]
pub fn retention_hours(elapsed: chrono::Duration) -> u32 {
    let secs = elapsed.num_seconds().max(0).unsigned_abs();
    let whole = secs / 3600;
    if whole == 0 {
        return 1;
    }
    let hours = whole + u64::from(secs % 3600 != 0);
    u32::try_from(hours).unwrap_or(u32::MAX)
}

/// Deletion work for one processed prefix.
///
/// A pure function of its fields; created only after the prefix's table
/// write committed.
#[derive(Debug, Clone)]
pub struct DeletionTask {
    /// The source prefix to reclaim.
    pub prefix: SourcePrefix,
    /// Full source location (`s3://bucket/prefix`), for the operation log.
    pub purge_path: String,
    /// Retention window the bulk purge honors.
    pub retention_hours: u32,
}

/// Whether the enumerate-and-delete pass runs after the bulk sweep.
///
/// Skipped only when the prefix's trailing date segment is the current
/// day, which may still be receiving writes.
#[must_use]
pub fn should_enumerate_after_purge(prefix_date: Option<NaiveDate>, today: NaiveDate) -> bool {
    prefix_date != Some(today)
}

/// Terminal state of one deletion task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// The prefix the task worked on.
    pub prefix: String,
    /// `None` on success, the failure message otherwise.
    pub error: Option<String>,
}

impl TaskOutcome {
    /// True when the task completed without error.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate result of one invocation's deletion work.
#[derive(Debug, Clone, Default)]
pub struct PurgeSummary {
    /// Tasks that completed successfully.
    pub succeeded: usize,
    /// Tasks that failed or timed out.
    pub failed: usize,
    /// Per-task outcomes.
    pub outcomes: Vec<TaskOutcome>,
}

impl PurgeSummary {
    fn record(&mut self, outcome: TaskOutcome) {
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(outcome);
    }
}

/// Bounded-concurrency executor for deletion tasks.
pub struct PurgeEngine {
    storage: Arc<dyn StorageBackend>,
    dry_run: bool,
}

impl PurgeEngine {
    /// Creates an engine over the source storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, dry_run: bool) -> Self {
        Self { storage, dry_run }
    }

    /// Runs all tasks with at most [`MAX_CONCURRENT_DELETIONS`] in
    /// flight and a [`TASK_TIMEOUT`] budget each.
    ///
    /// Never returns an error: every task resolves to an outcome and
    /// the caller consumes the summary. A timed-out task counts as
    /// failed but is not interrupted mid-call.
    pub async fn run_tasks(&self, tasks: Vec<DeletionTask>) -> PurgeSummary {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_DELETIONS));
        let mut set: JoinSet<TaskOutcome> = JoinSet::new();

        for task in tasks {
            let storage = Arc::clone(&self.storage);
            let semaphore = Arc::clone(&semaphore);
            let dry_run = self.dry_run;
            let prefix = task.prefix.as_str().to_string();

            // The deletion work runs on its own handle and holds its
            // pool permit until it finishes. The timeout below bounds
            // only the wait for that handle: on expiry the handle is
            // dropped, which detaches the work rather than aborting an
            // in-flight storage call.
            let work = tokio::spawn(async move {
                let _permit =
                    semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::Internal {
                            message: "worker pool closed".to_string(),
                        })?;
                run_task(storage.as_ref(), &task, dry_run).await
            });

            set.spawn(async move {
                match tokio::time::timeout(TASK_TIMEOUT, work).await {
                    Ok(Ok(Ok(()))) => TaskOutcome {
                        prefix,
                        error: None,
                    },
                    Ok(Ok(Err(e))) => TaskOutcome {
                        prefix,
                        error: Some(e.to_string()),
                    },
                    Ok(Err(e)) => TaskOutcome {
                        prefix,
                        error: Some(e.to_string()),
                    },
                    Err(_) => TaskOutcome {
                        prefix,
                        error: Some(format!(
                            "deletion task exceeded {}s budget",
                            TASK_TIMEOUT.as_secs()
                        )),
                    },
                }
            });
        }

        let mut summary = PurgeSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Some(error) = &outcome.error {
                        tracing::error!(prefix = %outcome.prefix, error = %error, "deletion task failed");
                    } else {
                        tracing::info!(prefix = %outcome.prefix, "deletion task succeeded");
                    }
                    summary.record(outcome);
                }
                Err(e) => {
                    tracing::error!(error = %e, "deletion task panicked");
                    summary.record(TaskOutcome {
                        prefix: "<unknown>".to_string(),
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "deletion summary"
        );
        summary
    }
}

/// Executes one task: bulk sweep, then the conditional enumerate pass.
async fn run_task(storage: &dyn StorageBackend, task: &DeletionTask, dry_run: bool) -> Result<()> {
    let prefix = task.prefix.as_str();
    tracing::info!(
        path = %task.purge_path,
        retention_hours = task.retention_hours,
        "starting deletion task"
    );

    if dry_run {
        let objects = trailhouse_core::storage::list_all(storage, prefix).await?;
        tracing::info!(
            path = %task.purge_path,
            objects = objects.len(),
            retention_hours = task.retention_hours,
            "dry run: skipping purge"
        );
        return Ok(());
    }

    for sweep in 1..=PURGE_SWEEP_ITERATIONS {
        retry_throttled(|| storage.purge(prefix, task.retention_hours)).await?;
        tracing::debug!(prefix = prefix, sweep = sweep, "bulk purge sweep issued");
        if sweep < PURGE_SWEEP_ITERATIONS {
            tokio::time::sleep(SWEEP_PAUSE).await;
        }
    }

    if should_enumerate_after_purge(task.prefix.date(), Utc::now().date_naive()) {
        enumerate_and_delete(storage, prefix).await?;
    } else {
        tracing::info!(
            prefix = prefix,
            "prefix is the current day, skipping enumerate-and-delete"
        );
    }

    Ok(())
}

/// Lists the prefix and deletes in batches of at most
/// [`DELETE_BATCH_LIMIT`] keys, catching objects the bulk purge missed.
///
/// Each round lists from the start of the prefix: continuation tokens
/// are unstable once the keys they point past are gone, so paging over
/// a listing we are deleting from would skip objects.
async fn enumerate_and_delete(storage: &dyn StorageBackend, prefix: &str) -> Result<()> {
    let mut deleted = 0usize;

    loop {
        let page = retry_throttled(|| storage.list_page(prefix, None)).await?;
        if page.objects.is_empty() {
            break;
        }
        let final_page = page.next_token.is_none();

        for chunk in page.objects.chunks(DELETE_BATCH_LIMIT) {
            let keys: Vec<String> = chunk.iter().map(|o| o.path.clone()).collect();
            retry_throttled(|| storage.delete_batch(&keys)).await?;
            deleted += keys.len();
        }

        if final_page {
            break;
        }
    }

    tracing::info!(prefix = prefix, deleted = deleted, "enumerate-and-delete complete");
    Ok(())
}

/// Retries a throttled call up to [`MAX_THROTTLE_RETRIES`] times with
/// doubling backoff. Non-retryable errors propagate immediately.
async fn retry_throttled<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_THROTTLE_RETRIES => {
                attempt += 1;
                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    delay_secs = backoff.as_secs(),
                    "throttled, backing off"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
