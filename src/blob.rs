// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Blob store integration.
//!
//! Both the primary store (source of truth the replicator reads from) and
//! the secondary store (backup destination) are accessed through
//! [`BlobStore`]. The trait uses boxed futures so it stays object-safe and
//! can be mocked in tests.
//!
//! [`ObjectStoreBlobStore`] adapts any `object_store` backend (S3, local
//! filesystem, in-memory).
//!
//! # Example
//!
//! ```rust,no_run
//! use object_backup::blob::{BlobStore, ObjectStoreBlobStore};
//! use bytes::Bytes;
//!
//! # async fn example() -> object_backup::Result<()> {
//! let secondary = ObjectStoreBlobStore::from_dsn("memory://")?;
//! secondary.put("docs/a.txt/v1", Bytes::from_static(b"hello")).await.unwrap();
//! assert!(secondary.exists("docs/a.txt/v1").await.unwrap());
//! # Ok(())
//! # }
//! ```

use crate::error::{BackupError, StoreError};
use bytes::Bytes;
use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path, ObjectStore,
    PutPayload,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use url::Url;

/// Result type for collaborator store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Outcome of deleting a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The blob was already absent. Treated as success by callers.
    NotFound,
}

/// Byte-level access to an object store.
pub trait BlobStore: Send + Sync + 'static {
    /// Read a blob. `Ok(None)` if it does not exist.
    fn get(&self, location: &str) -> BoxFuture<'_, Option<Bytes>>;

    /// Write (or overwrite) a blob.
    fn put(&self, location: &str, data: Bytes) -> BoxFuture<'_, ()>;

    /// Delete a blob. Deleting an absent blob is not an error.
    fn delete(&self, location: &str) -> BoxFuture<'_, DeleteOutcome>;

    /// Check whether a blob exists.
    fn exists(&self, location: &str) -> BoxFuture<'_, bool>;
}

/// [`BlobStore`] backed by an `object_store` implementation.
#[derive(Clone)]
pub struct ObjectStoreBlobStore {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlobStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Fresh in-memory store (tests, local runs).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Build from a DSN (see [`create_object_store_from_dsn`]).
    pub fn from_dsn(dsn: &str) -> crate::Result<Self> {
        Ok(Self::new(create_object_store_from_dsn(dsn)?))
    }

    /// The underlying object store.
    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

impl std::fmt::Debug for ObjectStoreBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStoreBlobStore({})", self.store)
    }
}

/// Resolve a location to an object path.
///
/// Well-formed keys are used verbatim, so locations that already carry
/// percent-encoded segments are not encoded a second time. Keys with empty,
/// `.` or `..` segments fall back to per-segment encoding.
fn object_path(location: &str) -> Path {
    Path::parse(location).unwrap_or_else(|_| Path::from(location))
}

impl BlobStore for ObjectStoreBlobStore {
    fn get(&self, location: &str) -> BoxFuture<'_, Option<Bytes>> {
        let path = object_path(location);
        Box::pin(async move {
            match self.store.get(&path).await {
                Ok(result) => Ok(Some(result.bytes().await?)),
                Err(object_store::Error::NotFound { .. }) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn put(&self, location: &str, data: Bytes) -> BoxFuture<'_, ()> {
        let path = object_path(location);
        Box::pin(async move {
            self.store.put(&path, PutPayload::from(data)).await?;
            Ok(())
        })
    }

    fn delete(&self, location: &str) -> BoxFuture<'_, DeleteOutcome> {
        let path = object_path(location);
        Box::pin(async move {
            match self.store.delete(&path).await {
                Ok(()) => Ok(DeleteOutcome::Deleted),
                Err(object_store::Error::NotFound { .. }) => Ok(DeleteOutcome::NotFound),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn exists(&self, location: &str) -> BoxFuture<'_, bool> {
        let path = object_path(location);
        Box::pin(async move {
            match self.store.head(&path).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }
}

/// Create an object store from a DSN string.
///
/// Supported schemes:
/// - `memory://`
/// - `file:///path/to/dir`
/// - `s3://[access_key:secret_key@]host[:port]/bucket`
pub fn create_object_store_from_dsn(dsn: &str) -> crate::Result<Arc<dyn ObjectStore>> {
    let url = Url::parse(dsn)
        .map_err(|e| BackupError::Config(format!("Invalid storage DSN '{}': {}", dsn, e)))?;

    match url.scheme() {
        "memory" => Ok(Arc::new(InMemory::new())),
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(BackupError::Config(
                    "File DSN must specify a path: file:///path/to/storage".to_string(),
                ));
            }
            std::fs::create_dir_all(path)
                .map_err(|e| BackupError::Config(format!("Cannot create {}: {}", path, e)))?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        "s3" => {
            let builder = create_s3_builder_from_dsn(&url)?;
            Ok(Arc::new(builder.build()?))
        }
        scheme => Err(BackupError::Config(format!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3",
            scheme
        ))),
    }
}

/// Create an S3 builder from a DSN.
///
/// Hosts outside `amazonaws.com` are treated as S3-compatible endpoints
/// (MinIO etc.) with path-style requests. Missing credentials fall back to
/// the usual `AWS_*` environment variables.
pub fn create_s3_builder_from_dsn(dsn: &Url) -> crate::Result<AmazonS3Builder> {
    let host = dsn
        .host_str()
        .ok_or_else(|| BackupError::Config("Missing S3 host in DSN".to_string()))?;
    let port = dsn.port();
    let bucket = dsn.path().trim_start_matches('/');

    if bucket.is_empty() {
        return Err(BackupError::Config(
            "S3 DSN must specify a bucket: s3://host/bucket".to_string(),
        ));
    }

    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);

    let access_key = dsn.username();
    if !access_key.is_empty() {
        builder = builder
            .with_access_key_id(access_key)
            .with_secret_access_key(dsn.password().unwrap_or(""));
    }

    if !host.contains("amazonaws.com") {
        let scheme = if port == Some(443) { "https" } else { "http" };
        let endpoint = match port {
            Some(p) => format!("{scheme}://{host}:{p}"),
            None => format!("{scheme}://{host}"),
        };
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false);
    }

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = ObjectStoreBlobStore::in_memory();

        assert_eq!(store.get("a/1").await.unwrap(), None);
        store.put("a/1", Bytes::from_static(b"payload")).await.unwrap();
        assert_eq!(store.get("a/1").await.unwrap(), Some(Bytes::from_static(b"payload")));
        assert!(store.exists("a/1").await.unwrap());

        assert_eq!(store.delete("a/1").await.unwrap(), DeleteOutcome::Deleted);
        assert!(!store.exists("a/1").await.unwrap());
        assert_eq!(store.get("a/1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = ObjectStoreBlobStore::in_memory();
        store.put("k", Bytes::from_static(b"one")).await.unwrap();
        store.put("k", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn test_filesystem_delete_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("file://{}", dir.path().display());
        let store = ObjectStoreBlobStore::from_dsn(&dsn).unwrap();

        let outcome = store.delete("never/written").await.unwrap();
        assert_eq!(outcome, DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_filesystem_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("file://{}", dir.path().display());
        let store = ObjectStoreBlobStore::from_dsn(&dsn).unwrap();

        store.put("photos/cat.jpg/v1", Bytes::from_static(b"meow")).await.unwrap();
        assert!(store.exists("photos/cat.jpg/v1").await.unwrap());
        assert_eq!(store.delete("photos/cat.jpg/v1").await.unwrap(), DeleteOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_encoded_locations_are_kept_verbatim() {
        let store = ObjectStoreBlobStore::in_memory();
        store.put("a%2Fb/c", Bytes::from_static(b"one")).await.unwrap();
        store.put("a/b%2Fc", Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(store.get("a%2Fb/c").await.unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(store.get("a/b%2Fc").await.unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(object_path("a%2Fb/c").as_ref(), "a%2Fb/c");
    }

    #[test]
    fn test_malformed_keys_fall_back_to_encoding() {
        assert_eq!(object_path("a//b").as_ref(), "a/b");
        assert_eq!(object_path("/reports/q3.pdf").as_ref(), "reports/q3.pdf");
    }

    #[test]
    fn test_invalid_dsn() {
        let err = create_object_store_from_dsn("not-a-url").unwrap_err();
        assert!(err.to_string().contains("Invalid storage DSN"));
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = create_object_store_from_dsn("gcs://bucket/prefix").unwrap_err();
        assert!(err.to_string().contains("Unsupported storage scheme"));
    }

    #[test]
    fn test_file_dsn_without_path() {
        let err = create_object_store_from_dsn("file://").unwrap_err();
        assert!(err.to_string().contains("File DSN must specify a path"));
    }

    #[test]
    fn test_s3_dsn_parsing() {
        let result = create_s3_builder_from_dsn(&Url::parse("s3://access:secret@localhost:9000/backups").unwrap());
        assert!(result.is_ok());

        let err = create_s3_builder_from_dsn(&Url::parse("s3://localhost:9000/").unwrap()).unwrap_err();
        assert!(err.to_string().contains("must specify a bucket"));
    }
}
