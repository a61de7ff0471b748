//! Storage backend abstraction for object storage (S3, local, memory).
//!
//! This module defines the storage contract the ingestion job consumes:
//! - Conditional writes with preconditions (metadata commits are CAS)
//! - Paginated listing and batched deletes (≤ 1000 keys per call)
//! - A best-effort, eventually consistent purge-by-retention-window
//!
//! The version token on writes is an opaque `String` so backends with
//! different CAS primitives (ETag, generation, version id) share one
//! contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Maximum number of keys a single batched delete may carry.
pub const DELETE_BATCH_LIMIT: usize = 1000;

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Objects in this page.
    pub objects: Vec<ObjectMeta>,
    /// Continuation token for the next page, `None` when exhausted.
    pub next_token: Option<String>,
}

/// Storage backend trait for object storage.
///
/// All storage backends (S3 via `object_store`, memory) implement this
/// trait. The contract is designed for cloud object storage semantics.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with an optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if the precondition is not
    /// met. Never returns an error for a precondition failure - that's a
    /// normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes a single object.
    ///
    /// Succeeds even if the object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Deletes up to [`DELETE_BATCH_LIMIT`] objects in one call.
    ///
    /// Returns `Error::InvalidInput` if more keys are passed.
    async fn delete_batch(&self, paths: &[String]) -> Result<()>;

    /// Lists one page of objects with the given prefix.
    ///
    /// **Ordering**: results are returned in arbitrary order that may vary
    /// between backends and invocations.
    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Best-effort purge of objects under `prefix` older than
    /// `retention_hours`.
    ///
    /// Eventually consistent: a successful return does not guarantee that
    /// every eligible object is gone. Callers sweep repeatedly and fall
    /// back to enumerate-and-delete when a guarantee is needed.
    async fn purge(&self, prefix: &str, retention_hours: u32) -> Result<()>;
}

/// Lists every object under a prefix, draining all pages.
///
/// # Errors
///
/// Returns the first listing error encountered.
pub async fn list_all(backend: &dyn StorageBackend, prefix: &str) -> Result<Vec<ObjectMeta>> {
    let mut out = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = backend.list_page(prefix, token.as_deref()).await?;
        out.extend(page.objects);
        match page.next_token {
            Some(t) => token = Some(t),
            None => return Ok(out),
        }
    }
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production. Supports
/// injected throttling failures and an in-flight purge watermark so tests
/// can assert on retry behavior and worker-pool bounds.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    throttles: Arc<Mutex<Vec<InjectedThrottle>>>,
    purge_gauge: Arc<Mutex<PurgeGauge>>,
    page_size: Option<usize>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct InjectedThrottle {
    path_prefix: String,
    remaining: u32,
}

#[derive(Debug, Default)]
struct PurgeGauge {
    in_flight: usize,
    high_water: usize,
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that returns listing pages of at most `n` objects.
    #[must_use]
    pub fn with_page_size(n: usize) -> Self {
        Self {
            page_size: Some(n),
            ..Self::default()
        }
    }

    /// Injects `count` throttling failures for operations touching paths
    /// starting with `path_prefix`.
    ///
    /// Applied to `purge` and `delete_batch` calls, consumed one per call.
    pub fn inject_throttle(&self, path_prefix: impl Into<String>, count: u32) {
        self.throttles.lock().expect("lock").push(InjectedThrottle {
            path_prefix: path_prefix.into(),
            remaining: count,
        });
    }

    /// Returns the highest number of purge calls that were in flight at
    /// the same time.
    #[must_use]
    pub fn max_concurrent_purges(&self) -> usize {
        self.purge_gauge.lock().expect("lock").high_water
    }

    /// Seeds an object with a backdated `last_modified`, for retention
    /// tests.
    pub fn put_backdated(&self, path: &str, data: Bytes, age: Duration) {
        let mut objects = self.objects.write().expect("lock");
        let version = objects.get(path).map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version,
                last_modified: Utc::now()
                    - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero()),
            },
        );
    }

    /// Returns all stored keys, sorted (test convenience).
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().expect("lock").keys().cloned().collect();
        keys.sort();
        keys
    }

    fn consume_throttle(&self, path: &str) -> bool {
        let mut throttles = self.throttles.lock().expect("lock");
        for t in throttles.iter_mut() {
            if t.remaining > 0 && path.starts_with(&t.path_prefix) {
                t.remaining -= 1;
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::Internal {
                message: "lock poisoned".into(),
            })?
            .remove(path);
        Ok(())
    }

    async fn delete_batch(&self, paths: &[String]) -> Result<()> {
        if paths.len() > DELETE_BATCH_LIMIT {
            return Err(Error::InvalidInput(format!(
                "delete_batch limited to {DELETE_BATCH_LIMIT} keys, got {}",
                paths.len()
            )));
        }
        if let Some(first) = paths.first() {
            if self.consume_throttle(first) {
                return Err(Error::throttled("SlowDown: delete_batch"));
            }
        }

        let mut objects = self.objects.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        for path in paths {
            objects.remove(path);
        }
        Ok(())
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        let mut matching: Vec<ObjectMeta> = objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| ObjectMeta {
                path: path.clone(),
                size: obj.data.len() as u64,
                version: obj.version.to_string(),
                last_modified: Some(obj.last_modified),
            })
            .collect();
        matching.sort_by(|a, b| a.path.cmp(&b.path));

        // Key-based continuation, like the production backend's offset
        // listing: a numeric index would skip survivors once keys are
        // deleted between pages.
        let start = token.map_or(0, |t| matching.partition_point(|m| m.path.as_str() <= t));
        let page_size = self.page_size.unwrap_or(DELETE_BATCH_LIMIT);
        let end = (start + page_size).min(matching.len());
        let next_token = if end < matching.len() {
            matching.get(end - 1).map(|m| m.path.clone())
        } else {
            None
        };

        Ok(ListPage {
            objects: matching.get(start..end).unwrap_or_default().to_vec(),
            next_token,
        })
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(objects.get(path).map(|obj| ObjectMeta {
            path: path.to_string(),
            size: obj.data.len() as u64,
            version: obj.version.to_string(),
            last_modified: Some(obj.last_modified),
        }))
    }

    async fn purge(&self, prefix: &str, retention_hours: u32) -> Result<()> {
        {
            let mut gauge = self.purge_gauge.lock().expect("lock");
            gauge.in_flight += 1;
            gauge.high_water = gauge.high_water.max(gauge.in_flight);
        }
        // Yield so overlapping purge calls are observable by the gauge.
        tokio::task::yield_now().await;

        let result = if self.consume_throttle(prefix) {
            Err(Error::throttled("SlowDown: purge"))
        } else {
            let cutoff = Utc::now() - chrono::Duration::hours(i64::from(retention_hours));
            let mut objects = self.objects.write().map_err(|_| Error::Internal {
                message: "lock poisoned".into(),
            })?;
            objects.retain(|k, o| !(k.starts_with(prefix) && o.last_modified < cutoff));
            Ok(())
        };

        self.purge_gauge.lock().expect("lock").in_flight -= 1;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        let data = Bytes::from("hello world");

        let result = backend
            .put("test/file.json", data.clone(), WritePrecondition::None)
            .await
            .expect("put should succeed");
        assert!(matches!(result, WriteResult::Success { ref version } if version == "1"));

        let retrieved = backend.get("test/file.json").await.expect("get");
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn test_precondition_does_not_exist() {
        let backend = MemoryBackend::new();

        let result = backend
            .put("new.json", Bytes::from("a"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(matches!(result, WriteResult::Success { .. }));

        let result = backend
            .put("new.json", Bytes::from("b"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_precondition_matches_version() {
        let backend = MemoryBackend::new();

        let result = backend
            .put("gen.json", Bytes::from("v1"), WritePrecondition::None)
            .await
            .expect("put");
        let first_version = match result {
            WriteResult::Success { version } => version,
            WriteResult::PreconditionFailed { .. } => panic!("expected success"),
        };

        let result = backend
            .put(
                "gen.json",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion(first_version.clone()),
            )
            .await
            .expect("put");
        assert!(matches!(result, WriteResult::Success { .. }));

        // Stale token must fail.
        let result = backend
            .put(
                "gen.json",
                Bytes::from("v3"),
                WritePrecondition::MatchesVersion(first_version),
            )
            .await
            .expect("put");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_list_page_pagination() {
        let backend = MemoryBackend::with_page_size(2);
        for i in 0..5 {
            backend
                .put(
                    &format!("logs/{i}.json"),
                    Bytes::from("x"),
                    WritePrecondition::None,
                )
                .await
                .unwrap();
        }

        let page1 = backend.list_page("logs/", None).await.unwrap();
        assert_eq!(page1.objects.len(), 2);
        assert!(page1.next_token.is_some());

        let all = list_all(&backend, "logs/").await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_list_token_survives_deletes_between_pages() {
        let backend = MemoryBackend::with_page_size(2);
        for i in 0..5 {
            backend
                .put(
                    &format!("logs/{i}.json"),
                    Bytes::from("x"),
                    WritePrecondition::None,
                )
                .await
                .unwrap();
        }

        let page1 = backend.list_page("logs/", None).await.unwrap();
        let first_keys: Vec<String> = page1.objects.iter().map(|o| o.path.clone()).collect();
        backend.delete_batch(&first_keys).await.unwrap();

        // The continuation must resume after the last returned key, not
        // at a positional index into the shrunken listing.
        let page2 = backend
            .list_page("logs/", page1.next_token.as_deref())
            .await
            .unwrap();
        assert_eq!(page2.objects.len(), 2);
        assert_eq!(page2.objects[0].path, "logs/2.json");
        assert_eq!(page2.objects[1].path, "logs/3.json");
    }

    #[tokio::test]
    async fn test_delete_batch_limit_enforced() {
        let backend = MemoryBackend::new();
        let too_many: Vec<String> = (0..=DELETE_BATCH_LIMIT).map(|i| format!("k{i}")).collect();
        let result = backend.delete_batch(&too_many).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_delete_batch_removes_objects() {
        let backend = MemoryBackend::new();
        backend
            .put("a/1", Bytes::from("x"), WritePrecondition::None)
            .await
            .unwrap();
        backend
            .put("a/2", Bytes::from("x"), WritePrecondition::None)
            .await
            .unwrap();

        backend
            .delete_batch(&["a/1".to_string(), "a/2".to_string()])
            .await
            .unwrap();
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_purge_only_removes_objects_past_retention() {
        let backend = MemoryBackend::new();
        backend.put_backdated("p/old.json", Bytes::from("x"), Duration::from_secs(7200));
        backend
            .put("p/fresh.json", Bytes::from("x"), WritePrecondition::None)
            .await
            .unwrap();

        backend.purge("p/", 1).await.unwrap();
        assert_eq!(backend.keys(), vec!["p/fresh.json".to_string()]);
    }

    #[tokio::test]
    async fn test_injected_throttle_consumed_per_call() {
        let backend = MemoryBackend::new();
        backend.inject_throttle("p/", 2);

        assert!(backend.purge("p/", 1).await.unwrap_err().is_retryable());
        assert!(backend.purge("p/", 1).await.unwrap_err().is_retryable());
        assert!(backend.purge("p/", 1).await.is_ok());
    }
}
