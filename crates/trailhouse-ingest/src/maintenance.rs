//! Post-write table housekeeping.
//!
//! Three best-effort passes after the per-prefix work: drop data files
//! whose event_date fell out of the retention horizon, expire old
//! snapshots keeping the most recent two, and remove data files no
//! retained snapshot references. Every failure here is logged and
//! swallowed; housekeeping never fails a run that already ingested.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use trailhouse_core::Result;
use trailhouse_core::storage::{DELETE_BATCH_LIMIT, StorageBackend, list_all};

use crate::table::{CatalogWriter, SnapshotOperation, SnapshotRef};

/// Snapshots kept by the expiry pass.
pub const RETAINED_SNAPSHOTS: usize = 2;

/// Minimum age before an unreferenced data file is considered orphaned.
/// Younger files may belong to a commit still in flight.
const ORPHAN_MIN_AGE_HOURS: i64 = 24;

/// Housekeeping pass over the destination table.
pub struct TableMaintenance<'a> {
    storage: Arc<dyn StorageBackend>,
    writer: &'a CatalogWriter,
    retention_days: u32,
}

impl<'a> TableMaintenance<'a> {
    /// Creates a maintenance pass with the given retention horizon.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        writer: &'a CatalogWriter,
        retention_days: u32,
    ) -> Self {
        Self {
            storage,
            writer,
            retention_days,
        }
    }

    /// Runs all passes. Never returns an error.
    pub async fn run(&self) {
        if let Err(e) = self.drop_expired_rows().await {
            tracing::warn!(error = %e, "row retention pass failed");
        }
        if let Err(e) = self.expire_snapshots().await {
            tracing::warn!(error = %e, "snapshot expiry pass failed");
        }
        if let Err(e) = self.remove_orphans().await {
            tracing::warn!(error = %e, "orphan removal pass failed");
        }
    }

    /// Commits a Delete snapshot without the files older than the
    /// retention horizon, then removes those files physically.
    async fn drop_expired_rows(&self) -> Result<()> {
        let Some(state) = self.writer.read_table().await else {
            return Ok(());
        };
        let cutoff = Utc::now().date_naive() - chrono::Days::new(u64::from(self.retention_days));

        let files = self.writer.current_data_files(&state.metadata).await?;
        let (retained, expired): (Vec<_>, Vec<_>) =
            files.into_iter().partition(|f| f.event_date >= cutoff);
        if expired.is_empty() {
            return Ok(());
        }

        let expired_rows: u64 = expired.iter().map(|f| f.row_count).sum();
        self.writer
            .commit_snapshot(Some(state), retained, SnapshotOperation::Delete)
            .await?;

        // Physical deletion only after the new snapshot is visible.
        let paths: Vec<String> = expired.into_iter().map(|f| f.path).collect();
        for chunk in paths.chunks(DELETE_BATCH_LIMIT) {
            self.storage.delete_batch(chunk).await?;
        }

        tracing::info!(
            files = paths.len(),
            rows = expired_rows,
            cutoff = %cutoff,
            "dropped rows past the retention horizon"
        );
        Ok(())
    }

    /// Trims the snapshot log to [`RETAINED_SNAPSHOTS`] entries and
    /// deletes the expired snapshot files.
    async fn expire_snapshots(&self) -> Result<()> {
        let Some(state) = self.writer.read_table().await else {
            return Ok(());
        };
        if state.metadata.snapshots.len() <= RETAINED_SNAPSHOTS {
            return Ok(());
        }

        let mut metadata = state.metadata;
        let expire_to = metadata.snapshots.len() - RETAINED_SNAPSHOTS;
        let expired: Vec<SnapshotRef> = metadata.snapshots.drain(..expire_to).collect();
        metadata.updated_at = Utc::now();

        if !self.writer.rewrite_metadata(&metadata, state.version).await? {
            tracing::warn!("snapshot expiry lost a metadata race, skipping");
            return Ok(());
        }

        for snapshot in &expired {
            self.storage.delete(&snapshot.path).await?;
        }
        tracing::info!(
            expired = expired.len(),
            retained = RETAINED_SNAPSHOTS,
            "expired old snapshots"
        );
        Ok(())
    }

    /// Deletes aged data files no retained snapshot references.
    async fn remove_orphans(&self) -> Result<()> {
        let Some(state) = self.writer.read_table().await else {
            return Ok(());
        };

        let mut referenced: HashSet<String> = HashSet::new();
        for snapshot_ref in &state.metadata.snapshots {
            let snapshot = self.writer.read_snapshot(snapshot_ref).await?;
            referenced.extend(snapshot.data_files.into_iter().map(|f| f.path));
        }

        let min_age = Utc::now() - chrono::Duration::hours(ORPHAN_MIN_AGE_HOURS);
        let orphans: Vec<String> = list_all(self.storage.as_ref(), &self.writer.data_prefix())
            .await?
            .into_iter()
            .filter(|o| !referenced.contains(&o.path))
            .filter(|o| o.last_modified.is_some_and(|t| t < min_age))
            .map(|o| o.path)
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }

        for chunk in orphans.chunks(DELETE_BATCH_LIMIT) {
            self.storage.delete_batch(chunk).await?;
        }
        tracing::info!(removed = orphans.len(), "removed orphaned data files");
        Ok(())
    }
}
