//! Record normalizer: parsed events to partition-ready rows.
//!
//! Derives `event_time` from the record's timestamp, `event_date` from the
//! configured target time zone (UTC calendar date when no zone is
//! configured) and injects `region` from the resolver's output; the
//! payload's own region field is never trusted for partitioning.
//!
//! Events whose timestamp is missing or unparseable are dropped and
//! counted: a persisted row always has non-null partition keys.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::schema::AuditEvent;

/// Default target time zone for calendar-date derivation.
pub const DEFAULT_TIME_ZONE: &str = "America/Toronto";

/// One partition-ready row: the audit event plus derived columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// The original event fields.
    #[serde(flatten)]
    pub event: AuditEvent,
    /// Parsed event timestamp (UTC).
    pub event_time: DateTime<Utc>,
    /// Calendar date in the target time zone; one of the two partition keys.
    pub event_date: NaiveDate,
    /// Region injected from the resolved prefix; the other partition key.
    pub region: String,
}

/// Outcome of normalizing one batch.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    /// Partition-ready rows.
    pub rows: Vec<NormalizedEvent>,
    /// Events dropped for missing or unparseable timestamps.
    pub dropped: usize,
}

/// Derives temporal and partition columns for parsed events.
#[derive(Debug, Clone)]
pub struct Normalizer {
    zone: Option<Tz>,
}

impl Normalizer {
    /// Creates a normalizer targeting the given time zone name.
    ///
    /// An unknown zone degrades to UTC calendar dates with a warning;
    /// never a failure.
    #[must_use]
    pub fn new(zone_name: &str) -> Self {
        let zone = match zone_name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                tracing::warn!(
                    zone = zone_name,
                    "unknown time zone, deriving event_date from UTC"
                );
                None
            }
        };
        Self { zone }
    }

    /// Normalizes a batch of events for the given region.
    pub fn normalize(&self, events: Vec<AuditEvent>, region: &str) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();

        for event in events {
            let Some(event_time) = event
                .event_time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
            else {
                batch.dropped += 1;
                continue;
            };

            let event_date = match self.zone {
                Some(tz) => event_time.with_timezone(&tz).date_naive(),
                None => event_time.date_naive(),
            };

            batch.rows.push(NormalizedEvent {
                event,
                event_time,
                event_date,
                region: region.to_string(),
            });
        }

        if batch.dropped > 0 {
            tracing::warn!(
                dropped = batch.dropped,
                region = region,
                "dropped events with missing or unparseable timestamps"
            );
        }

        batch
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_ZONE)
    }
}
