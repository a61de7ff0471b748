//! Invocation configuration.
//!
//! All parameters are resolved at startup and validated before any
//! processing. A missing path or identifier is a fatal configuration
//! error, never retried.

use trailhouse_core::{Error, Result};

use crate::normalize::DEFAULT_TIME_ZONE;

/// Resolved parameters for one invocation.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Job name, used for run bookkeeping.
    pub job_name: String,
    /// Source storage location the prefix is relative to.
    pub input_path: String,
    /// Destination warehouse location.
    pub output_path: String,
    /// Destination namespace for the table.
    pub namespace: String,
    /// Account identifier the logs belong to.
    pub account_id: String,
    /// Table retention horizon in days.
    pub retention_days: u32,
    /// The single resolved source prefix to process.
    pub prefix: String,
    /// Target time zone for event_date derivation.
    pub time_zone: String,
    /// When set, the purge engine reports what it would delete without
    /// deleting anything.
    pub dry_run: bool,
}

impl JobConfig {
    /// Validates the configuration before any work starts.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for any empty required parameter or a
    /// zero retention horizon.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("job-name", &self.job_name),
            ("input-path", &self.input_path),
            ("output-path", &self.output_path),
            ("namespace", &self.namespace),
            ("account-id", &self.account_id),
            ("prefix", &self.prefix),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::config(format!("{name} must not be empty")));
            }
        }
        if self.retention_days == 0 {
            return Err(Error::config("retention-days must be at least 1"));
        }
        Ok(())
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name: String::new(),
            input_path: String::new(),
            output_path: String::new(),
            namespace: String::new(),
            account_id: String::new(),
            retention_days: 90,
            prefix: String::new(),
            time_zone: DEFAULT_TIME_ZONE.to_string(),
            dry_run: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> JobConfig {
        JobConfig {
            job_name: "cloudtrail-ingest".into(),
            input_path: "s3://audit-logs".into(),
            output_path: "s3://lake/warehouse".into(),
            namespace: "audit".into(),
            account_id: "123456789012".into(),
            prefix: "AWSLogs/123456789012/CloudTrail/us-east-1/2025/08/24/".into(),
            ..JobConfig::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_empty_paths_are_fatal() {
        let mut config = valid();
        config.input_path = String::new();
        assert!(matches!(config.validate(), Err(Error::Config { .. })));

        let mut config = valid();
        config.output_path = "  ".into();
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_zero_retention_rejected() {
        let mut config = valid();
        config.retention_days = 0;
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }
}
