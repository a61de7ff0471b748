//! Transactional destination table.
//!
//! The table is a snapshot-versioned layout in object storage,
//! partitioned by (region, event_date):
//!
//! ```text
//! {output_path}/cloudtrail_events/
//! ├── metadata/
//! │   ├── table.metadata.json      # pointer: snapshots + current id
//! │   └── snap-{id}.json           # full live-file list per snapshot
//! └── data/
//!     └── region={r}/event_date={d}/part-{seq}-{id}.jsonl
//! ```
//!
//! A snapshot isn't visible until the metadata pointer CAS succeeds, so
//! appends are atomic: readers either see the old snapshot or the new
//! one, never a partial file list. Appends are append-only; duplicate
//! ingestion of the same prefix duplicates rows.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use trailhouse_core::storage::{StorageBackend, WritePrecondition, WriteResult};
use trailhouse_core::{Error, Result};

use crate::partition::PartitionPlan;

/// Logical table name for ingested audit events.
pub const TABLE_NAME: &str = "cloudtrail_events";

/// Transactional format version written into table metadata.
pub const FORMAT_VERSION: u32 = 2;

/// Fixed schema version of the audit-event record shape.
pub const SCHEMA_VERSION: u32 = 1;

/// Table metadata pointer: the commit root for all table state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    /// Transactional format version.
    pub format_version: u32,
    /// Logical table name.
    pub table_name: String,
    /// Owning namespace.
    pub namespace: String,
    /// Physical table location.
    pub location: String,
    /// Fixed schema version.
    pub schema_version: u32,
    /// Partition columns, in layout order.
    pub partition_spec: Vec<String>,
    /// Currently visible snapshot, `None` only before the first commit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_snapshot_id: Option<String>,
    /// All retained snapshots, oldest first.
    pub snapshots: Vec<SnapshotRef>,
    /// Last commit timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Pointer to one snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRef {
    /// Snapshot identifier.
    pub snapshot_id: String,
    /// Monotonic commit sequence number.
    pub sequence_number: u64,
    /// Path of the snapshot file.
    pub path: String,
    /// Commit timestamp.
    pub committed_at: DateTime<Utc>,
}

/// What a commit did to the live file set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotOperation {
    /// New data files added; previous files retained.
    Append,
    /// Data files removed (row retention).
    Delete,
}

/// One snapshot: the complete live file list at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Snapshot identifier.
    pub snapshot_id: String,
    /// Monotonic commit sequence number.
    pub sequence_number: u64,
    /// What this commit did.
    pub operation: SnapshotOperation,
    /// Commit timestamp.
    pub committed_at: DateTime<Utc>,
    /// All data files live in this snapshot.
    pub data_files: Vec<DataFile>,
}

/// One data file and its partition values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFile {
    /// Object path of the file.
    pub path: String,
    /// Region partition value.
    pub region: String,
    /// Date partition value.
    pub event_date: NaiveDate,
    /// Rows in the file.
    pub row_count: u64,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// Current table state: the metadata document plus its CAS version token.
#[derive(Debug, Clone)]
pub struct TableState {
    /// The metadata document.
    pub metadata: TableMetadata,
    /// Version token the next commit must match.
    pub version: String,
}

/// Summary of one successful write.
#[derive(Debug, Clone)]
pub struct CommitSummary {
    /// Whether this commit created the table.
    pub created: bool,
    /// Snapshot id of the commit.
    pub snapshot_id: String,
    /// Rows written.
    pub rows: u64,
    /// Data files written.
    pub files: usize,
}

/// Idempotent create-or-append writer for the destination table.
pub struct CatalogWriter {
    storage: Arc<dyn StorageBackend>,
    namespace: String,
    output_path: String,
}

impl CatalogWriter {
    /// Creates a writer targeting `{output_path}/cloudtrail_events`.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        output_path: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
            output_path: output_path.into().trim_end_matches('/').to_string(),
        }
    }

    /// Physical table location.
    #[must_use]
    pub fn table_location(&self) -> String {
        self.rooted(TABLE_NAME)
    }

    // Key joining that tolerates an empty output root (backend mounted
    // directly at the warehouse).
    fn rooted(&self, rest: &str) -> String {
        if self.output_path.is_empty() {
            rest.to_string()
        } else {
            format!("{}/{rest}", self.output_path)
        }
    }

    /// Prefix under which all data files live.
    #[must_use]
    pub fn data_prefix(&self) -> String {
        format!("{}/data/", self.table_location())
    }

    fn metadata_path(&self) -> String {
        format!("{}/metadata/table.metadata.json", self.table_location())
    }

    fn snapshot_path(&self, snapshot_id: &str) -> String {
        format!("{}/metadata/snap-{snapshot_id}.json", self.table_location())
    }

    fn namespace_marker_path(&self) -> String {
        self.rooted(&format!("namespaces/{}.json", self.namespace))
    }

    /// Ensures the destination namespace marker exists (create if absent).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the marker cannot be probed or written.
    pub async fn ensure_namespace(&self) -> Result<()> {
        let path = self.namespace_marker_path();
        if self.storage.head(&path).await?.is_some() {
            return Ok(());
        }

        let marker = serde_json::json!({
            "name": self.namespace,
            "createdAt": Utc::now(),
        });
        let body = Bytes::from(serde_json::to_vec(&marker).map_err(|e| Error::Serialization {
            message: e.to_string(),
        })?);

        // A concurrent creator winning the race is fine.
        self.storage
            .put(&path, body, WritePrecondition::DoesNotExist)
            .await?;
        tracing::info!(namespace = %self.namespace, "ensured namespace");
        Ok(())
    }

    /// Loads the current table state.
    ///
    /// Any probe failure is treated as "table does not exist" (the
    /// first-run case) and logged; it is never propagated as fatal.
    /// Returns `None` when the table is absent.
    pub async fn read_table(&self) -> Option<TableState> {
        let path = self.metadata_path();
        let meta = match self.storage.head(&path).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "table metadata probe failed, assuming first run");
                return None;
            }
        };

        match self.storage.get(&path).await {
            Ok(bytes) => match serde_json::from_slice::<TableMetadata>(&bytes) {
                Ok(metadata) => Some(TableState {
                    metadata,
                    version: meta.version,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "table metadata unreadable, assuming first run");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "table metadata read failed, assuming first run");
                None
            }
        }
    }

    /// Loads one snapshot document.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error if the snapshot cannot be
    /// fetched or decoded.
    pub async fn read_snapshot(&self, snapshot_ref: &SnapshotRef) -> Result<Snapshot> {
        let bytes = self.storage.get(&snapshot_ref.path).await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Serialization {
            message: format!("snapshot {} undecodable: {e}", snapshot_ref.snapshot_id),
        })
    }

    /// Writes a batch: creates the table on first run, appends otherwise.
    ///
    /// Data files are written before the metadata commit, so a failed
    /// commit leaves no visible rows.
    ///
    /// # Errors
    ///
    /// Any create/append failure is fatal for the invocation
    /// (`Error::TableCommit` or the underlying storage error).
    pub async fn write_batch(&self, plan: &PartitionPlan, region: &str) -> Result<CommitSummary> {
        self.ensure_namespace().await?;

        let state = self.read_table().await;
        let sequence = state
            .as_ref()
            .map_or(1, |s| s.metadata.snapshots.last().map_or(1, |r| r.sequence_number + 1));

        let new_files = self.write_data_files(plan, region, sequence).await?;
        let rows = plan.row_count() as u64;
        let files = new_files.len();

        let mut data_files = match &state {
            Some(state) => self.current_data_files(&state.metadata).await?,
            None => Vec::new(),
        };
        data_files.extend(new_files);

        let created = state.is_none();
        let snapshot_id = self
            .commit_snapshot(state, data_files, SnapshotOperation::Append)
            .await?;

        if created {
            tracing::info!(
                table = TABLE_NAME,
                namespace = %self.namespace,
                snapshot = %snapshot_id,
                rows = rows,
                "created table partitioned by (region, event_date)"
            );
        } else {
            tracing::info!(
                table = TABLE_NAME,
                namespace = %self.namespace,
                snapshot = %snapshot_id,
                rows = rows,
                region = region,
                "appended batch"
            );
        }

        Ok(CommitSummary {
            created,
            snapshot_id,
            rows,
            files,
        })
    }

    /// Returns the data files of the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the current snapshot cannot be loaded.
    pub async fn current_data_files(&self, metadata: &TableMetadata) -> Result<Vec<DataFile>> {
        let Some(current_id) = &metadata.current_snapshot_id else {
            return Ok(Vec::new());
        };
        let current_ref = metadata
            .snapshots
            .iter()
            .find(|r| &r.snapshot_id == current_id)
            .ok_or_else(|| Error::Internal {
                message: format!("current snapshot {current_id} missing from metadata"),
            })?;
        Ok(self.read_snapshot(current_ref).await?.data_files)
    }

    /// Commits a new snapshot with the given live file set.
    ///
    /// `state: None` creates the table (DoesNotExist precondition);
    /// otherwise the metadata pointer is CAS-updated. Returns the new
    /// snapshot id.
    ///
    /// # Errors
    ///
    /// Returns `Error::TableCommit` on a lost CAS race or create
    /// conflict; storage errors otherwise.
    pub async fn commit_snapshot(
        &self,
        state: Option<TableState>,
        data_files: Vec<DataFile>,
        operation: SnapshotOperation,
    ) -> Result<String> {
        let snapshot_id = Ulid::new().to_string();
        let sequence_number = state
            .as_ref()
            .map_or(1, |s| s.metadata.snapshots.last().map_or(1, |r| r.sequence_number + 1));
        let committed_at = Utc::now();

        let snapshot = Snapshot {
            snapshot_id: snapshot_id.clone(),
            sequence_number,
            operation,
            committed_at,
            data_files,
        };
        let snapshot_path = self.snapshot_path(&snapshot_id);
        let snapshot_body =
            Bytes::from(serde_json::to_vec(&snapshot).map_err(|e| Error::Serialization {
                message: e.to_string(),
            })?);
        self.storage
            .put(&snapshot_path, snapshot_body, WritePrecondition::None)
            .await?;

        let (mut metadata, precondition) = match state {
            Some(state) => (
                state.metadata,
                WritePrecondition::MatchesVersion(state.version),
            ),
            None => (
                TableMetadata {
                    format_version: FORMAT_VERSION,
                    table_name: TABLE_NAME.to_string(),
                    namespace: self.namespace.clone(),
                    location: self.table_location(),
                    schema_version: SCHEMA_VERSION,
                    partition_spec: vec!["region".to_string(), "event_date".to_string()],
                    current_snapshot_id: None,
                    snapshots: Vec::new(),
                    updated_at: committed_at,
                },
                WritePrecondition::DoesNotExist,
            ),
        };

        metadata.snapshots.push(SnapshotRef {
            snapshot_id: snapshot_id.clone(),
            sequence_number,
            path: snapshot_path,
            committed_at,
        });
        metadata.current_snapshot_id = Some(snapshot_id.clone());
        metadata.updated_at = committed_at;

        let body = Bytes::from(serde_json::to_vec(&metadata).map_err(|e| Error::Serialization {
            message: e.to_string(),
        })?);
        match self
            .storage
            .put(&self.metadata_path(), body, precondition)
            .await?
        {
            WriteResult::Success { .. } => Ok(snapshot_id),
            WriteResult::PreconditionFailed { .. } => Err(Error::table_commit(format!(
                "concurrent commit on {}.{TABLE_NAME}",
                self.namespace
            ))),
        }
    }

    /// CAS-rewrites the metadata pointer without creating a snapshot,
    /// for maintenance passes that drop snapshot references.
    ///
    /// Returns `false` when the pointer moved underneath us; the caller
    /// skips the pass rather than retrying.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error if the write fails.
    pub async fn rewrite_metadata(&self, metadata: &TableMetadata, version: String) -> Result<bool> {
        let body = Bytes::from(serde_json::to_vec(metadata).map_err(|e| Error::Serialization {
            message: e.to_string(),
        })?);
        match self
            .storage
            .put(
                &self.metadata_path(),
                body,
                WritePrecondition::MatchesVersion(version),
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(true),
            WriteResult::PreconditionFailed { .. } => Ok(false),
        }
    }

    async fn write_data_files(
        &self,
        plan: &PartitionPlan,
        region: &str,
        sequence: u64,
    ) -> Result<Vec<DataFile>> {
        let mut files = Vec::with_capacity(plan.chunks.len());

        for chunk in &plan.chunks {
            let mut body = String::new();
            for row in &chunk.rows {
                let line = serde_json::to_string(row).map_err(|e| Error::Serialization {
                    message: e.to_string(),
                })?;
                body.push_str(&line);
                body.push('\n');
            }

            let path = format!(
                "{}region={region}/event_date={}/part-{sequence:05}-{}.jsonl",
                self.data_prefix(),
                chunk.event_date,
                Ulid::new()
            );
            let size_bytes = body.len() as u64;
            self.storage
                .put(&path, Bytes::from(body), WritePrecondition::None)
                .await?;

            files.push(DataFile {
                path,
                region: region.to_string(),
                event_date: chunk.event_date,
                row_count: chunk.rows.len() as u64,
                size_bytes,
            });
        }

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use crate::partition::plan_partitions;
    use crate::schema::AuditEvent;
    use trailhouse_core::MemoryBackend;

    fn plan(n: usize) -> PartitionPlan {
        let events: Vec<AuditEvent> = (0..n)
            .map(|i| AuditEvent {
                event_time: Some(format!("2025-08-24T10:00:{:02}Z", i % 60)),
                event_name: Some(format!("Event{i}")),
                ..AuditEvent::default()
            })
            .collect();
        let rows = Normalizer::new("UTC").normalize(events, "us-east-1").rows;
        plan_partitions(rows, "test")
    }

    fn writer(backend: &MemoryBackend) -> CatalogWriter {
        CatalogWriter::new(Arc::new(backend.clone()), "warehouse", "audit")
    }

    #[tokio::test]
    async fn test_first_write_creates_table() {
        let backend = MemoryBackend::new();
        let writer = writer(&backend);

        let summary = writer.write_batch(&plan(3), "us-east-1").await.unwrap();
        assert!(summary.created);
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.files, 1);

        let state = writer.read_table().await.expect("table exists");
        assert_eq!(state.metadata.format_version, FORMAT_VERSION);
        assert_eq!(
            state.metadata.partition_spec,
            vec!["region".to_string(), "event_date".to_string()]
        );
        assert_eq!(state.metadata.snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_second_write_appends_union_of_rows() {
        let backend = MemoryBackend::new();
        let writer = writer(&backend);

        writer.write_batch(&plan(3), "us-east-1").await.unwrap();
        let second = writer.write_batch(&plan(2), "us-east-1").await.unwrap();
        assert!(!second.created);

        let state = writer.read_table().await.unwrap();
        let files = writer.current_data_files(&state.metadata).await.unwrap();
        let total_rows: u64 = files.iter().map(|f| f.row_count).sum();
        assert_eq!(total_rows, 5, "append semantics: union of both batches");
        assert_eq!(state.metadata.snapshots.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_ingestion_duplicates_rows() {
        let backend = MemoryBackend::new();
        let writer = writer(&backend);

        writer.write_batch(&plan(4), "us-east-1").await.unwrap();
        writer.write_batch(&plan(4), "us-east-1").await.unwrap();

        let state = writer.read_table().await.unwrap();
        let files = writer.current_data_files(&state.metadata).await.unwrap();
        let total_rows: u64 = files.iter().map(|f| f.row_count).sum();
        assert_eq!(total_rows, 8, "no silent overwrite or dedup");
    }

    #[tokio::test]
    async fn test_namespace_marker_written_once() {
        let backend = MemoryBackend::new();
        let writer = writer(&backend);

        writer.ensure_namespace().await.unwrap();
        writer.ensure_namespace().await.unwrap();

        assert!(
            backend
                .keys()
                .contains(&"warehouse/namespaces/audit.json".to_string())
        );
    }

    #[tokio::test]
    async fn test_data_files_live_under_partition_paths() {
        let backend = MemoryBackend::new();
        let writer = writer(&backend);
        writer.write_batch(&plan(2), "us-east-1").await.unwrap();

        let data_keys: Vec<String> = backend
            .keys()
            .into_iter()
            .filter(|k| k.contains("/data/"))
            .collect();
        assert_eq!(data_keys.len(), 1);
        assert!(data_keys[0].contains("region=us-east-1/event_date=2025-08-24/"));
        assert!(data_keys[0].ends_with(".jsonl"));
    }

    #[tokio::test]
    async fn test_probe_failure_is_not_fatal() {
        // A metadata object that isn't valid JSON: the probe degrades to
        // "table absent" instead of failing the invocation.
        let backend = MemoryBackend::new();
        backend
            .put(
                "warehouse/cloudtrail_events/metadata/table.metadata.json",
                Bytes::from("not json"),
                WritePrecondition::None,
            )
            .await
            .unwrap();

        let writer = writer(&backend);
        assert!(writer.read_table().await.is_none());
    }
}
