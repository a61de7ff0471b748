//! Production storage backend over the `object_store` crate.
//!
//! Supports Amazon S3 (`s3://bucket`) and the local filesystem
//! (`file:///dir`, for development). The managed purge-by-retention-window
//! operation is emulated client-side: list, filter by age, batched delete.
//! Like the managed operation it stands in for, it is best-effort and
//! eventually consistent with respect to concurrent writers.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};

use crate::error::{Error, Result};
use crate::storage::{
    DELETE_BATCH_LIMIT, ListPage, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};

/// Number of objects returned per listing page.
const LIST_PAGE_SIZE: usize = 1000;

/// Storage backend backed by an [`object_store::ObjectStore`].
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    /// Creates a backend from a bucket spec.
    ///
    /// Accepts `s3://bucket` (credentials and region from the environment)
    /// or `file:///dir` for local development.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the spec is not recognized or the store
    /// cannot be constructed.
    pub fn from_bucket(spec: &str) -> Result<Self> {
        if let Some(bucket) = spec.strip_prefix("s3://") {
            let bucket = bucket.trim_end_matches('/');
            let store = object_store::aws::AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()
                .map_err(|e| Error::config(format!("cannot build S3 store for {spec}: {e}")))?;
            return Ok(Self {
                store: Arc::new(store),
            });
        }
        if let Some(dir) = spec.strip_prefix("file://") {
            let store = object_store::local::LocalFileSystem::new_with_prefix(dir)
                .map_err(|e| Error::config(format!("cannot open local store at {dir}: {e}")))?;
            return Ok(Self {
                store: Arc::new(store),
            });
        }
        Err(Error::config(format!(
            "unrecognized storage bucket spec: {spec} (expected s3://... or file://...)"
        )))
    }

    /// Wraps an existing object store (used by tests with in-memory stores).
    #[must_use]
    pub fn from_store(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

/// Maps an `object_store` error into the trailhouse taxonomy.
///
/// Classification happens here, at the collaborator boundary: throttling
/// signals become `Error::Throttled` so retry drivers never inspect
/// message text themselves.
fn map_store_error(context: &str, err: object_store::Error) -> Error {
    match err {
        object_store::Error::NotFound { path, .. } => Error::NotFound(path),
        other => {
            // The AWS SDK surfaces SlowDown/503 responses as generic
            // errors; the status text is the only throttling signal
            // object_store exposes.
            let text = other.to_string();
            if text.contains("SlowDown") || text.contains("503") || text.contains("429") {
                Error::throttled(text)
            } else {
                Error::storage_with_source(context.to_string(), other)
            }
        }
    }
}

fn to_meta(meta: object_store::ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        path: meta.location.to_string(),
        size: meta.size as u64,
        version: meta
            .e_tag
            .clone()
            .or(meta.version.clone())
            .unwrap_or_default(),
        last_modified: Some(meta.last_modified),
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let location = StorePath::from(path);
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| map_store_error("get", e))?;
        result
            .bytes()
            .await
            .map_err(|e| map_store_error("get body", e))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let location = StorePath::from(path);
        let mode = match &precondition {
            WritePrecondition::DoesNotExist => PutMode::Create,
            WritePrecondition::MatchesVersion(token) => PutMode::Update(UpdateVersion {
                e_tag: Some(token.clone()),
                version: None,
            }),
            WritePrecondition::None => PutMode::Overwrite,
        };
        let opts = PutOptions {
            mode,
            ..PutOptions::default()
        };

        match self
            .store
            .put_opts(&location, PutPayload::from_bytes(data), opts)
            .await
        {
            Ok(result) => Ok(WriteResult::Success {
                version: result.e_tag.or(result.version).unwrap_or_default(),
            }),
            Err(
                object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. },
            ) => {
                let current_version = match self.head(path).await? {
                    Some(meta) => meta.version,
                    None => String::new(),
                };
                Ok(WriteResult::PreconditionFailed { current_version })
            }
            Err(e) => Err(map_store_error("put", e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let location = StorePath::from(path);
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_store_error("delete", e)),
        }
    }

    async fn delete_batch(&self, paths: &[String]) -> Result<()> {
        if paths.len() > DELETE_BATCH_LIMIT {
            return Err(Error::InvalidInput(format!(
                "delete_batch limited to {DELETE_BATCH_LIMIT} keys, got {}",
                paths.len()
            )));
        }

        let locations = futures::stream::iter(
            paths
                .iter()
                .map(|p| Ok(StorePath::from(p.as_str())))
                .collect::<Vec<object_store::Result<StorePath>>>(),
        )
        .boxed();

        let mut results = self.store.delete_stream(locations);
        while let Some(result) = results.next().await {
            match result {
                Ok(_) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(map_store_error("delete_batch", e)),
            }
        }
        Ok(())
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let prefix_path = StorePath::from(prefix.trim_end_matches('/'));

        let mut stream = match token {
            Some(offset) => {
                let offset = StorePath::from(offset);
                self.store.list_with_offset(Some(&prefix_path), &offset)
            }
            None => self.store.list(Some(&prefix_path)),
        };

        let mut objects = Vec::new();
        while let Some(item) = stream.next().await {
            let meta = item.map_err(|e| map_store_error("list", e))?;
            objects.push(to_meta(meta));
            if objects.len() == LIST_PAGE_SIZE {
                let next_token = objects.last().map(|m| m.path.clone());
                return Ok(ListPage {
                    objects,
                    next_token,
                });
            }
        }

        Ok(ListPage {
            objects,
            next_token: None,
        })
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let location = StorePath::from(path);
        match self.store.head(&location).await {
            Ok(meta) => Ok(Some(to_meta(meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_store_error("head", e)),
        }
    }

    async fn purge(&self, prefix: &str, retention_hours: u32) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::hours(i64::from(retention_hours));
        let mut token: Option<String> = None;

        loop {
            let page = self.list_page(prefix, token.as_deref()).await?;
            let expired: Vec<String> = page
                .objects
                .iter()
                .filter(|m| m.last_modified.is_some_and(|lm| lm < cutoff))
                .map(|m| m.path.clone())
                .collect();

            for chunk in expired.chunks(DELETE_BATCH_LIMIT) {
                self.delete_batch(chunk).await?;
            }

            match page.next_token {
                Some(t) => token = Some(t),
                None => return Ok(()),
            }
        }
    }
}
