//! Source prefix resolution for audit-log object layouts.
//!
//! Prefixes follow the activity-logging service's published layout:
//!
//! ```text
//! AWSLogs/{account}/CloudTrail/{region}/{year}/{month}/{day}/
//! ```
//!
//! The region token is the partition key for the destination table; a
//! prefix the resolver cannot parse is a configuration error, never a
//! transient one.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::error::{Error, Result};

fn region_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"/CloudTrail/([a-z]{2}-[a-z]+-\d)/").expect("region pattern is valid")
    })
}

fn date_suffix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"/(\d{4})/(\d{2})/(\d{2})/$").expect("date pattern is valid"))
}

/// A resolved source prefix: one day of one region's audit logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePrefix {
    prefix: String,
    region: String,
    date: Option<NaiveDate>,
}

impl SourcePrefix {
    /// Parses and validates a prefix, extracting the embedded region.
    ///
    /// A trailing `/` is appended if missing so downstream listing and
    /// purge calls always operate on a directory-shaped key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the prefix is empty or no region token
    /// can be extracted.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(Error::config("source prefix is empty"));
        }

        let prefix = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{raw}/")
        };

        let region = region_pattern()
            .captures(&prefix)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                Error::config(format!("cannot extract region from prefix: {raw}"))
            })?;

        let date = date_suffix_pattern().captures(&prefix).and_then(|c| {
            let year: i32 = c.get(1)?.as_str().parse().ok()?;
            let month: u32 = c.get(2)?.as_str().parse().ok()?;
            let day: u32 = c.get(3)?.as_str().parse().ok()?;
            NaiveDate::from_ymd_opt(year, month, day)
        });

        Ok(Self {
            prefix,
            region,
            date,
        })
    }

    /// The normalized prefix, always ending in `/`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.prefix
    }

    /// The extracted region token (e.g. `us-east-1`).
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The trailing `{year}/{month}/{day}/` calendar date, if present.
    #[must_use]
    pub const fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    /// Full purge path for this prefix within the given bucket.
    #[must_use]
    pub fn purge_path(&self, bucket: &str) -> String {
        format!("s3://{bucket}/{}", self.prefix)
    }
}

impl std::fmt::Display for SourcePrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.prefix)
    }
}
