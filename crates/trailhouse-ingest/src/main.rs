//! CLI entry point for the ingestion-and-retention job.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use trailhouse_core::ObjectStoreBackend;
use trailhouse_core::observability::{LogFormat, init_logging};
use trailhouse_ingest::normalize::DEFAULT_TIME_ZONE;
use trailhouse_ingest::{IngestionJob, JobConfig};

#[derive(Debug, Parser)]
#[command(
    name = "trailhouse-ingest",
    version,
    about = "Ingests audit-event logs into the warehouse table and purges processed sources"
)]
struct Args {
    /// Job name used in run bookkeeping.
    #[arg(long, env = "TRAILHOUSE_JOB_NAME")]
    job_name: String,

    /// Source storage location the prefix is relative to (e.g. s3://audit-logs).
    #[arg(long, env = "TRAILHOUSE_INPUT_PATH")]
    input_path: String,

    /// Destination warehouse location (e.g. s3://lake/warehouse).
    #[arg(long, env = "TRAILHOUSE_OUTPUT_PATH")]
    output_path: String,

    /// Destination namespace for the table.
    #[arg(long, env = "TRAILHOUSE_NAMESPACE")]
    namespace: String,

    /// Account identifier the logs belong to.
    #[arg(long, env = "TRAILHOUSE_ACCOUNT_ID")]
    account_id: String,

    /// Table retention horizon in days.
    #[arg(long, env = "TRAILHOUSE_RETENTION_DAYS", default_value_t = 90)]
    retention_days: u32,

    /// The resolved source prefix to process.
    #[arg(long, env = "TRAILHOUSE_PREFIX")]
    prefix: String,

    /// Target time zone for event_date derivation.
    #[arg(long, env = "TRAILHOUSE_TIME_ZONE", default_value = DEFAULT_TIME_ZONE)]
    time_zone: String,

    /// Log output format (json or pretty).
    #[arg(long, env = "TRAILHOUSE_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// Report what the purge engine would delete without deleting it.
    #[arg(long, env = "TRAILHOUSE_DRY_RUN")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let (source_store, source_root) = split_location(&args.input_path);
    if !source_root.is_empty() {
        anyhow::bail!(
            "input-path must be a bucket root (the prefix argument carries the key path), got: {}",
            args.input_path
        );
    }
    let (destination_store, output_root) = split_location(&args.output_path);

    let source =
        ObjectStoreBackend::from_bucket(&source_store).context("opening source storage")?;
    let destination = ObjectStoreBackend::from_bucket(&destination_store)
        .context("opening destination storage")?;

    let config = JobConfig {
        job_name: args.job_name,
        input_path: args.input_path,
        output_path: args.output_path,
        namespace: args.namespace,
        account_id: args.account_id,
        retention_days: args.retention_days,
        prefix: args.prefix,
        time_zone: args.time_zone,
        dry_run: args.dry_run,
    };
    config.validate()?;

    let job = IngestionJob::new(Arc::new(source), Arc::new(destination), output_root, config);
    let report = job.run().await?;

    tracing::info!(
        rows = report.rows_written,
        files = report.files_written,
        corrupt = report.corrupt_records,
        deletions_succeeded = report.deletions_succeeded,
        deletions_failed = report.deletions_failed,
        "invocation complete"
    );
    Ok(())
}

/// Splits a location into the store root `from_bucket` understands and
/// the key prefix within it.
fn split_location(location: &str) -> (String, String) {
    if let Some(rest) = location.strip_prefix("s3://") {
        match rest.split_once('/') {
            Some((bucket, key)) => (
                format!("s3://{bucket}"),
                key.trim_end_matches('/').to_string(),
            ),
            None => (location.to_string(), String::new()),
        }
    } else {
        // Local and file:// locations mount the whole path as the root.
        (location.trim_end_matches('/').to_string(), String::new())
    }
}
