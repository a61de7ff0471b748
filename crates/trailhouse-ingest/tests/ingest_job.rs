//! End-to-end invocation tests over in-memory storage.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{NaiveDate, Utc};

use trailhouse_core::storage::WritePrecondition;
use trailhouse_core::{MemoryBackend, StorageBackend};
use trailhouse_ingest::table::CatalogWriter;
use trailhouse_ingest::{IngestionJob, JobConfig};

/// A recent processed day: old enough that the enumerate-and-delete pass
/// runs, young enough that table maintenance keeps its rows.
fn day() -> NaiveDate {
    Utc::now().date_naive() - chrono::Days::new(2)
}

fn prefix_for(day: NaiveDate) -> String {
    format!(
        "AWSLogs/123456789012/CloudTrail/us-east-1/{}/",
        day.format("%Y/%m/%d")
    )
}

fn config(day: NaiveDate) -> JobConfig {
    JobConfig {
        job_name: "cloudtrail-ingest".into(),
        input_path: "s3://audit-logs".into(),
        output_path: "s3://lake/warehouse".into(),
        namespace: "audit".into(),
        account_id: "123456789012".into(),
        prefix: prefix_for(day),
        ..JobConfig::default()
    }
}

fn document(events: usize, day: NaiveDate) -> String {
    let records: Vec<String> = (0..events)
        .map(|i| {
            format!(
                r#"{{"eventName": "GetObject", "eventSource": "s3.amazonaws.com", "eventTime": "{day}T10:00:{:02}Z"}}"#,
                i % 60
            )
        })
        .collect();
    format!(r#"{{"Records": [{}]}}"#, records.join(","))
}

async fn seed(source: &MemoryBackend, day: NaiveDate, files: usize, events_each: usize) {
    for i in 0..files {
        source
            .put(
                &format!("{}file-{i}.json", prefix_for(day)),
                Bytes::from(document(events_each, day)),
                WritePrecondition::None,
            )
            .await
            .unwrap();
    }
}

fn warehouse_writer(warehouse: &MemoryBackend) -> CatalogWriter {
    CatalogWriter::new(Arc::new(warehouse.clone()), "warehouse", "audit")
}

#[tokio::test(start_paused = true)]
async fn test_first_run_creates_table_and_issues_one_deletion_task() {
    let source = MemoryBackend::new();
    let warehouse = MemoryBackend::new();
    let day = day();
    seed(&source, day, 3, 4).await;

    let job = IngestionJob::new(
        Arc::new(source.clone()),
        Arc::new(warehouse.clone()),
        "warehouse",
        config(day),
    );
    let report = job.run().await.expect("invocation succeeds");

    assert!(report.table_created);
    assert_eq!(report.objects_read, 3);
    assert_eq!(report.rows_written, 12);
    assert_eq!(report.corrupt_records, 0);
    assert_eq!(report.deletions_succeeded, 1);
    assert_eq!(report.deletions_failed, 0);

    // Exactly one partition value per key.
    let writer = warehouse_writer(&warehouse);
    let state = writer.read_table().await.expect("table exists");
    let files = writer.current_data_files(&state.metadata).await.unwrap();
    let regions: HashSet<String> = files.iter().map(|f| f.region.clone()).collect();
    let dates: HashSet<NaiveDate> = files.iter().map(|f| f.event_date).collect();
    assert_eq!(regions, HashSet::from(["us-east-1".to_string()]));
    assert_eq!(dates, HashSet::from([day]));

    // The processed prefix was reclaimed.
    assert!(source.keys().is_empty(), "source keys: {:?}", source.keys());

    // Exactly one run record was committed.
    let runs: Vec<String> = warehouse
        .keys()
        .into_iter()
        .filter(|k| k.contains("/_runs/"))
        .collect();
    assert_eq!(runs.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_run_appends_the_union_of_both_batches() {
    let source = MemoryBackend::new();
    let warehouse = MemoryBackend::new();
    let day = day();

    seed(&source, day, 2, 5).await;
    let first = IngestionJob::new(
        Arc::new(source.clone()),
        Arc::new(warehouse.clone()),
        "warehouse",
        config(day),
    )
    .run()
    .await
    .unwrap();
    assert!(first.table_created);

    // The orchestrator normally never reprocesses a prefix; if it does,
    // append semantics duplicate rows rather than silently overwriting.
    seed(&source, day, 2, 5).await;
    let second = IngestionJob::new(
        Arc::new(source.clone()),
        Arc::new(warehouse.clone()),
        "warehouse",
        config(day),
    )
    .run()
    .await
    .unwrap();
    assert!(!second.table_created);
    assert_eq!(second.rows_written, 10);

    let writer = warehouse_writer(&warehouse);
    let state = writer.read_table().await.unwrap();
    let files = writer.current_data_files(&state.metadata).await.unwrap();
    let total_rows: u64 = files.iter().map(|f| f.row_count).sum();
    assert_eq!(total_rows, 20);
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_records_are_quarantined_not_fatal() {
    let source = MemoryBackend::new();
    let warehouse = MemoryBackend::new();
    let day = day();

    // 100 records, 5 of which fail schema coercion.
    let mut records: Vec<String> = (0..95)
        .map(|i| {
            format!(
                r#"{{"eventName": "E{i}", "eventTime": "{day}T10:00:{:02}Z"}}"#,
                i % 60
            )
        })
        .collect();
    for _ in 0..5 {
        records.push(r#"{"userIdentity": "not-an-object"}"#.to_string());
    }
    source
        .put(
            &format!("{}batch.json", prefix_for(day)),
            Bytes::from(format!(r#"{{"Records": [{}]}}"#, records.join(","))),
            WritePrecondition::None,
        )
        .await
        .unwrap();

    let report = IngestionJob::new(
        Arc::new(source),
        Arc::new(warehouse),
        "warehouse",
        config(day),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.rows_written, 95);
    assert_eq!(report.corrupt_records, 5);
    assert_eq!(report.deletions_succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_commits_rows_but_deletes_nothing() {
    let source = MemoryBackend::new();
    let warehouse = MemoryBackend::new();
    let day = day();
    seed(&source, day, 2, 3).await;

    let mut config = config(day);
    config.dry_run = true;
    let report = IngestionJob::new(
        Arc::new(source.clone()),
        Arc::new(warehouse),
        "warehouse",
        config,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.rows_written, 6);
    assert_eq!(report.deletions_succeeded, 1);
    assert_eq!(source.keys().len(), 2, "sources untouched in dry run");
}
