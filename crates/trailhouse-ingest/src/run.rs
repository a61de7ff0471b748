//! Invocation driver: wires the pipeline for one resolved prefix.
//!
//! Program order per invocation: resolve → read → normalize → plan →
//! write → purge → maintenance → run record. A prefix's deletion task is
//! only submitted after its table write committed, and the run record is
//! written exactly once: at the very end, or immediately after a fatal
//! early exit.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tracing::Instrument;
use ulid::Ulid;

use trailhouse_core::observability::job_span;
use trailhouse_core::storage::{StorageBackend, WritePrecondition};
use trailhouse_core::{Error, Result, SourcePrefix};

use crate::config::JobConfig;
use crate::maintenance::TableMaintenance;
use crate::normalize::Normalizer;
use crate::partition::plan_partitions;
use crate::purge::{DeletionTask, ProcessingWindow, PurgeEngine};
use crate::reader::PrefixReader;
use crate::table::CatalogWriter;

/// What one invocation accomplished.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    /// Source objects read.
    pub objects_read: usize,
    /// Records quarantined during parsing.
    pub corrupt_records: usize,
    /// Events dropped for unusable timestamps.
    pub dropped_events: usize,
    /// Rows committed to the table.
    pub rows_written: u64,
    /// Data files committed.
    pub files_written: usize,
    /// Whether this invocation created the table.
    pub table_created: bool,
    /// Whether the prefix was skipped after a read failure.
    pub prefix_skipped: bool,
    /// Deletion tasks that succeeded.
    pub deletions_succeeded: usize,
    /// Deletion tasks that failed or timed out.
    pub deletions_failed: usize,
}

/// One ingestion-and-retention invocation.
pub struct IngestionJob {
    source: Arc<dyn StorageBackend>,
    destination: Arc<dyn StorageBackend>,
    output_root: String,
    config: JobConfig,
}

impl IngestionJob {
    /// Creates a job over source and destination storage.
    ///
    /// `output_root` is the warehouse key prefix within the destination
    /// backend (may be empty when the backend is mounted at the
    /// warehouse root).
    #[must_use]
    pub fn new(
        source: Arc<dyn StorageBackend>,
        destination: Arc<dyn StorageBackend>,
        output_root: impl Into<String>,
        config: JobConfig,
    ) -> Self {
        Self {
            source,
            destination,
            output_root: output_root.into().trim_end_matches('/').to_string(),
            config,
        }
    }

    /// Runs the invocation end to end.
    ///
    /// # Errors
    ///
    /// Returns fatal errors only: invalid configuration, an unresolvable
    /// prefix, or a failed table commit. Read failures, deletion
    /// failures and maintenance failures degrade and are reflected in
    /// the report instead.
    pub async fn run(&self) -> Result<JobReport> {
        let window = ProcessingWindow::begin();
        let mut report = JobReport::default();

        let result = self.execute(&window, &mut report).await;
        if let Err(e) = &result {
            tracing::error!(job = %self.config.job_name, error = %e, "invocation failed");
        }
        self.commit_run_record(&window, &report, result.as_ref().err())
            .await;

        result.map(|()| report)
    }

    async fn execute(&self, window: &ProcessingWindow, report: &mut JobReport) -> Result<()> {
        self.config.validate()?;
        let prefix = SourcePrefix::parse(&self.config.prefix)?;

        let span = job_span("invocation", prefix.region(), prefix.as_str());
        self.process(&prefix, window, report).instrument(span).await
    }

    async fn process(
        &self,
        prefix: &SourcePrefix,
        window: &ProcessingWindow,
        report: &mut JobReport,
    ) -> Result<()> {
        let writer = CatalogWriter::new(
            Arc::clone(&self.destination),
            self.output_root.clone(),
            self.config.namespace.clone(),
        );

        let mut tasks: Vec<DeletionTask> = Vec::new();
        match PrefixReader::new(self.source.as_ref())
            .read_prefix(prefix)
            .await
        {
            Ok(batch) => {
                report.objects_read = batch.objects_read;
                report.corrupt_records = batch.corrupt_records;

                let normalized = Normalizer::new(&self.config.time_zone)
                    .normalize(batch.events, prefix.region());
                report.dropped_events = normalized.dropped;

                if normalized.rows.is_empty() {
                    tracing::warn!(prefix = %prefix, "no rows parsed, skipping write and deletion");
                } else {
                    let plan = plan_partitions(normalized.rows, "write");
                    let summary = writer.write_batch(&plan, prefix.region()).await?;
                    report.rows_written = summary.rows;
                    report.files_written = summary.files;
                    report.table_created = summary.created;

                    // Rows are durable; the source may now be reclaimed.
                    let bucket = self
                        .config
                        .input_path
                        .strip_prefix("s3://")
                        .unwrap_or(&self.config.input_path)
                        .trim_end_matches('/');
                    tasks.push(DeletionTask {
                        purge_path: prefix.purge_path(bucket),
                        prefix: prefix.clone(),
                        retention_hours: window.retention_hours_at(Utc::now()),
                    });
                }
            }
            Err(e) => {
                tracing::error!(prefix = %prefix, error = %e, "failed to read prefix, skipping it");
                report.prefix_skipped = true;
            }
        }

        let engine = PurgeEngine::new(Arc::clone(&self.source), self.config.dry_run);
        let summary = engine.run_tasks(tasks).await;
        report.deletions_succeeded = summary.succeeded;
        report.deletions_failed = summary.failed;

        TableMaintenance::new(
            Arc::clone(&self.destination),
            &writer,
            self.config.retention_days,
        )
        .run()
        .await;

        Ok(())
    }

    /// Writes the completion signal for the orchestrator. Its own
    /// failure is logged, not propagated.
    async fn commit_run_record(
        &self,
        window: &ProcessingWindow,
        report: &JobReport,
        error: Option<&Error>,
    ) {
        let record = serde_json::json!({
            "jobName": self.config.job_name,
            "accountId": self.config.account_id,
            "prefix": self.config.prefix,
            "startedAt": window.started_at(),
            "finishedAt": Utc::now(),
            "status": error.map_or("succeeded", |_| "failed"),
            "error": error.map(ToString::to_string),
            "report": report,
        });
        let body = match serde_json::to_vec(&record) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode run record");
                return;
            }
        };

        let path = self.run_record_path();
        match self
            .destination
            .put(&path, body, WritePrecondition::None)
            .await
        {
            Ok(_) => tracing::info!(path = %path, "committed run record"),
            Err(e) => tracing::error!(error = %e, "failed to commit run record"),
        }
    }

    fn run_record_path(&self) -> String {
        let name = format!("_runs/run-{}.json", Ulid::new());
        if self.output_root.is_empty() {
            name
        } else {
            format!("{}/{name}", self.output_root)
        }
    }
}
