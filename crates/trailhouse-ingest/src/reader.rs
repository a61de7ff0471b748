//! Ingestion reader: raw audit-log files to parsed events.
//!
//! Reads every object under a resolved prefix, gunzips `.gz` keys,
//! applies the fixed wrapper schema permissively and explodes the batch
//! envelope. Records failing schema coercion are quarantined: counted,
//! logged as a warning and dropped; they never abort the read.

use flate2::read::GzDecoder;
use std::io::Read;

use trailhouse_core::storage::{StorageBackend, list_all};
use trailhouse_core::{Result, SourcePrefix};

use crate::schema::AuditEvent;

/// Outcome of reading one prefix.
#[derive(Debug, Default)]
pub struct ReadBatch {
    /// Successfully coerced events.
    pub events: Vec<AuditEvent>,
    /// Number of objects read.
    pub objects_read: usize,
    /// Records (or whole documents) that failed schema coercion.
    pub corrupt_records: usize,
    /// Documents that carried no batch envelope and were interpreted as
    /// already-flat records.
    pub flat_fallbacks: usize,
}

/// Reads and parses all audit-log objects under a prefix.
pub struct PrefixReader<'a> {
    storage: &'a dyn StorageBackend,
}

impl<'a> PrefixReader<'a> {
    /// Creates a reader over the given storage backend.
    #[must_use]
    pub fn new(storage: &'a dyn StorageBackend) -> Self {
        Self { storage }
    }

    /// Reads every object under `prefix` and parses it into events.
    ///
    /// # Errors
    ///
    /// Returns an error only when the prefix itself cannot be listed or
    /// an object cannot be fetched; malformed content degrades to
    /// quarantined records.
    pub async fn read_prefix(&self, prefix: &SourcePrefix) -> Result<ReadBatch> {
        let objects = list_all(self.storage, prefix.as_str()).await?;

        let mut batch = ReadBatch::default();
        for meta in &objects {
            let raw = self.storage.get(&meta.path).await?;

            let text = if meta.path.ends_with(".gz") {
                let mut decoder = GzDecoder::new(raw.as_ref());
                let mut out = String::new();
                if decoder.read_to_string(&mut out).is_err() {
                    tracing::warn!(object = %meta.path, "object is not valid gzip, quarantining");
                    batch.corrupt_records += 1;
                    continue;
                }
                out
            } else {
                match std::str::from_utf8(&raw) {
                    Ok(s) => s.to_string(),
                    Err(_) => {
                        tracing::warn!(object = %meta.path, "object is not UTF-8, quarantining");
                        batch.corrupt_records += 1;
                        continue;
                    }
                }
            };

            parse_document(&text, &meta.path, &mut batch);
            batch.objects_read += 1;
        }

        if batch.corrupt_records > 0 {
            tracing::warn!(
                prefix = %prefix,
                corrupt = batch.corrupt_records,
                "dropped records that failed schema coercion"
            );
        }

        Ok(batch)
    }
}

/// Parses one document: wrapper envelope first, flat fallback second,
/// quarantine last.
fn parse_document(text: &str, object: &str, batch: &mut ReadBatch) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(object = object, error = %e, "document is not valid JSON");
            batch.corrupt_records += 1;
            return;
        }
    };

    match value {
        serde_json::Value::Object(mut map) => {
            if let Some(records) = map.remove("Records") {
                match records {
                    serde_json::Value::Array(items) => {
                        coerce_records(items, object, batch);
                    }
                    _ => {
                        tracing::warn!(object = object, "Records field is not an array");
                        batch.corrupt_records += 1;
                    }
                }
            } else {
                // No batch envelope: interpret the top level as one
                // already-flat record.
                tracing::warn!(
                    object = object,
                    "no Records array, interpreting top-level object as a flat record"
                );
                batch.flat_fallbacks += 1;
                coerce_records(vec![serde_json::Value::Object(map)], object, batch);
            }
        }
        serde_json::Value::Array(items) => {
            tracing::warn!(
                object = object,
                "no Records envelope, interpreting top-level array as flat records"
            );
            batch.flat_fallbacks += 1;
            coerce_records(items, object, batch);
        }
        _ => {
            tracing::warn!(object = object, "document is not an object or array");
            batch.corrupt_records += 1;
        }
    }
}

/// Coerces each record individually so one bad record never discards its
/// neighbours.
fn coerce_records(items: Vec<serde_json::Value>, object: &str, batch: &mut ReadBatch) {
    for item in items {
        match serde_json::from_value::<AuditEvent>(item) {
            Ok(event) => batch.events.push(event),
            Err(e) => {
                tracing::debug!(object = object, error = %e, "record failed schema coercion");
                batch.corrupt_records += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use trailhouse_core::MemoryBackend;
    use trailhouse_core::storage::WritePrecondition;

    const PREFIX: &str = "AWSLogs/123456789012/CloudTrail/us-east-1/2025/08/24/";

    fn source_prefix() -> SourcePrefix {
        SourcePrefix::parse(PREFIX).unwrap()
    }

    async fn put(backend: &MemoryBackend, name: &str, body: &str) {
        backend
            .put(
                &format!("{PREFIX}{name}"),
                Bytes::from(body.to_string()),
                WritePrecondition::None,
            )
            .await
            .unwrap();
    }

    fn wrapped(n: usize) -> String {
        let records: Vec<String> = (0..n)
            .map(|i| format!(r#"{{"eventName": "Event{i}", "eventTime": "2025-08-24T10:00:0{}Z"}}"#, i % 10))
            .collect();
        format!(r#"{{"Records": [{}]}}"#, records.join(","))
    }

    #[tokio::test]
    async fn test_explodes_batch_envelope() {
        let backend = MemoryBackend::new();
        put(&backend, "a.json", &wrapped(3)).await;

        let batch = PrefixReader::new(&backend)
            .read_prefix(&source_prefix())
            .await
            .unwrap();

        assert_eq!(batch.events.len(), 3);
        assert_eq!(batch.objects_read, 1);
        assert_eq!(batch.corrupt_records, 0);
        assert_eq!(batch.flat_fallbacks, 0);
    }

    #[tokio::test]
    async fn test_quarantines_corrupt_records_individually() {
        // 100 records, 5 of which fail coercion: exactly 95 survive.
        let mut records: Vec<String> = (0..95)
            .map(|i| format!(r#"{{"eventName": "E{i}"}}"#))
            .collect();
        for _ in 0..5 {
            // userIdentity must be an object; a string fails coercion.
            records.push(r#"{"userIdentity": "not-an-object"}"#.to_string());
        }
        let doc = format!(r#"{{"Records": [{}]}}"#, records.join(","));

        let backend = MemoryBackend::new();
        put(&backend, "a.json", &doc).await;

        let batch = PrefixReader::new(&backend)
            .read_prefix(&source_prefix())
            .await
            .unwrap();

        assert_eq!(batch.events.len(), 95);
        assert_eq!(batch.corrupt_records, 5);
    }

    #[tokio::test]
    async fn test_invalid_json_counts_as_corrupt_never_fatal() {
        let backend = MemoryBackend::new();
        put(&backend, "bad.json", "{not json").await;
        put(&backend, "good.json", &wrapped(2)).await;

        let batch = PrefixReader::new(&backend)
            .read_prefix(&source_prefix())
            .await
            .unwrap();

        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.corrupt_records, 1);
    }

    #[tokio::test]
    async fn test_flat_fallback_for_missing_envelope() {
        let backend = MemoryBackend::new();
        put(&backend, "flat.json", r#"[{"eventName": "A"}, {"eventName": "B"}]"#).await;
        put(&backend, "single.json", r#"{"eventName": "C"}"#).await;

        let batch = PrefixReader::new(&backend)
            .read_prefix(&source_prefix())
            .await
            .unwrap();

        assert_eq!(batch.events.len(), 3);
        assert_eq!(batch.flat_fallbacks, 2);
    }

    #[tokio::test]
    async fn test_reads_gzipped_objects() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(wrapped(2).as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let backend = MemoryBackend::new();
        backend
            .put(
                &format!("{PREFIX}a.json.gz"),
                Bytes::from(compressed),
                WritePrecondition::None,
            )
            .await
            .unwrap();

        let batch = PrefixReader::new(&backend)
            .read_prefix(&source_prefix())
            .await
            .unwrap();

        assert_eq!(batch.events.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_prefix_yields_empty_batch() {
        let backend = MemoryBackend::new();
        let batch = PrefixReader::new(&backend)
            .read_prefix(&source_prefix())
            .await
            .unwrap();

        assert!(batch.events.is_empty());
        assert_eq!(batch.objects_read, 0);
    }
}
