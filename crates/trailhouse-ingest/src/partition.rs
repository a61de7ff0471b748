//! Partition optimizer: row volume to a bounded file layout.
//!
//! The destination table is partitioned by (region, event_date). Within
//! one invocation the region is fixed, so the planner groups rows by
//! event_date and splits the groups into a target number of files derived
//! from total row volume. This bounds file sizes in the destination table
//! without hard-coding a file count per run.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::normalize::NormalizedEvent;

/// Rows per target file.
pub const ROWS_PER_FILE: usize = 200_000;

/// Computes the target file count for a row volume.
///
/// `max(1, floor(rows / 200_000))`; the empty batch still plans one
/// file so downstream arithmetic never divides by zero.
#[must_use]
pub const fn target_file_count(rows: usize) -> usize {
    let target = rows / ROWS_PER_FILE;
    if target == 0 { 1 } else { target }
}

/// One planned data file: a single event_date's worth of rows, sorted by
/// event_time ascending.
#[derive(Debug, Clone)]
pub struct PartitionChunk {
    /// The event_date partition this file belongs to.
    pub event_date: NaiveDate,
    /// Rows for the file, time-ordered.
    pub rows: Vec<NormalizedEvent>,
}

/// The planned file layout for one batch.
#[derive(Debug, Default)]
pub struct PartitionPlan {
    /// Planned files. Empty iff the batch had no rows.
    pub chunks: Vec<PartitionChunk>,
}

impl PartitionPlan {
    /// Total rows across all chunks.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.chunks.iter().map(|c| c.rows.len()).sum()
    }

    /// Distinct event_date partition values in the plan.
    #[must_use]
    pub fn partition_dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self.chunks.iter().map(|c| c.event_date).collect();
        dates.dedup();
        dates
    }
}

/// Plans the file layout for a batch of normalized rows.
///
/// Rows are grouped by event_date; each group is split so the total file
/// count approaches [`target_file_count`], with at least one file per
/// date (a file never spans partition values). A planning failure falls
/// back to one file per date, logged as a warning: a partitioning
/// miscalculation never fails the job.
#[must_use]
pub fn plan_partitions(rows: Vec<NormalizedEvent>, stage: &str) -> PartitionPlan {
    let total = rows.len();
    if total == 0 {
        return PartitionPlan::default();
    }

    let mut by_date: BTreeMap<NaiveDate, Vec<NormalizedEvent>> = BTreeMap::new();
    for row in rows {
        by_date.entry(row.event_date).or_default().push(row);
    }

    let target = target_file_count(total);
    let date_count = by_date.len();

    match split_groups(by_date, total, target) {
        Ok(chunks) => {
            if chunks.len() == date_count {
                tracing::info!(stage = stage, files = chunks.len(), "partition layout unchanged");
            } else {
                tracing::info!(
                    stage = stage,
                    from = date_count,
                    to = chunks.len(),
                    "rebalanced partition layout"
                );
            }
            PartitionPlan { chunks }
        }
        Err(fallback) => {
            tracing::warn!(
                stage = stage,
                "partition optimization failed, falling back to one file per event_date"
            );
            PartitionPlan { chunks: fallback }
        }
    }
}

/// Splits date groups into time-ordered chunks.
///
/// Returns the one-file-per-date layout as the `Err` payload when the
/// proportional split cannot be computed.
fn split_groups(
    by_date: BTreeMap<NaiveDate, Vec<NormalizedEvent>>,
    total: usize,
    target: usize,
) -> Result<Vec<PartitionChunk>, Vec<PartitionChunk>> {
    let mut chunks = Vec::new();

    for (event_date, mut rows) in by_date {
        rows.sort_by_key(|r| r.event_time);

        // Proportional share of the target, at least one file per date.
        let share = (rows.len() * target).div_ceil(total).max(1);
        let chunk_size = rows.len().div_ceil(share);
        if chunk_size == 0 {
            // Unreachable with non-empty groups; degrade rather than panic.
            return Err(one_file_per_date(chunks, event_date, rows));
        }

        let mut rows = rows.into_iter();
        loop {
            let chunk: Vec<NormalizedEvent> = rows.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            chunks.push(PartitionChunk {
                event_date,
                rows: chunk,
            });
        }
    }

    Ok(chunks)
}

/// Degraded layout: whatever was already split, plus one file per
/// remaining date.
fn one_file_per_date(
    mut chunks: Vec<PartitionChunk>,
    event_date: NaiveDate,
    mut rows: Vec<NormalizedEvent>,
) -> Vec<PartitionChunk> {
    rows.sort_by_key(|r| r.event_time);
    chunks.push(PartitionChunk { event_date, rows });
    chunks
}
