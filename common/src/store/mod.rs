//! The capability contract every storage backend implements, plus the two built-in backends.
//!
//! Backends implement [`ObjectStore`]. Optional capabilities (multipart upload, POSIX-like
//! metadata, mtime and storage class setting, path-addressable local storage) are reported once
//! through [`ObjectStore::capabilities`] and cached on the [`Endpoint`] built around the store;
//! callers consult the cached [`Capabilities`] instead of probing per call.

pub mod file;
pub mod mem;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::object::ObjectEntry;

/// Byte stream returned by [`ObjectStore::get`] and consumed by [`ObjectStore::put`].
pub type ByteReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Lazy listing returned by [`ObjectStore::list_all`].
pub type EntryStream = futures::stream::BoxStream<'static, Result<ObjectEntry>>;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{0}: not found")]
    NotFound(String),
    #[error("{0} is not supported")]
    NotSupported(&'static str),
    #[error("{context}: {message}")]
    Io {
        context: String,
        kind: std::io::ErrorKind,
        message: String,
    },
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn io(context: impl Into<String>, error: std::io::Error) -> Self {
        let context = context.into();
        if error.kind() == std::io::ErrorKind::NotFound {
            return StoreError::NotFound(context);
        }
        StoreError::Io {
            context,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, StoreError::NotSupported(_))
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    pub has_more: bool,
    pub next_marker: String,
}

/// Multipart upload session created by the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartSession {
    pub upload_id: String,
    pub min_part_size: u64,
    pub max_part_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// 1-based
    pub num: u32,
    pub size: u64,
    pub etag: String,
}

/// Optional capabilities of a backend, reported once when the endpoint is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub multipart: bool,
    /// chmod/chown and [`crate::object::FileMeta`] in listings
    pub permissions: bool,
    pub mtime: bool,
    pub storage_class: bool,
    /// Root directory when the store is path-addressable local storage.
    pub local_root: Option<PathBuf>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// URI-like description used in logs.
    fn describe(&self) -> String;

    fn capabilities(&self) -> Capabilities;

    async fn head(&self, key: &str) -> Result<ObjectEntry>;

    /// Read `limit` bytes starting at `offset`, `None` reads to the end.
    async fn get(&self, key: &str, offset: u64, limit: Option<u64>) -> Result<ByteReader>;

    async fn put(&self, key: &str, body: ByteReader) -> Result<()>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn list(&self, _prefix: &str, _marker: &str, _limit: usize) -> Result<ListPage> {
        Err(StoreError::NotSupported("list"))
    }

    async fn list_all(&self, _prefix: &str, _marker: &str) -> Result<EntryStream> {
        Err(StoreError::NotSupported("list_all"))
    }

    async fn create_multipart_upload(&self, _key: &str) -> Result<MultipartSession> {
        Err(StoreError::NotSupported("multipart upload"))
    }

    async fn upload_part(
        &self,
        _key: &str,
        _upload_id: &str,
        _num: u32,
        _body: Bytes,
    ) -> Result<Part> {
        Err(StoreError::NotSupported("multipart upload"))
    }

    async fn abort_upload(&self, _key: &str, _upload_id: &str) -> Result<()> {
        Err(StoreError::NotSupported("multipart upload"))
    }

    async fn complete_upload(&self, _key: &str, _upload_id: &str, _parts: &[Part]) -> Result<()> {
        Err(StoreError::NotSupported("multipart upload"))
    }

    async fn chmod(&self, _key: &str, _mode: u32) -> Result<()> {
        Err(StoreError::NotSupported("chmod"))
    }

    async fn chown(&self, _key: &str, _owner: &str, _group: &str) -> Result<()> {
        Err(StoreError::NotSupported("chown"))
    }

    async fn chtimes(&self, _key: &str, _mtime: DateTime<Utc>) -> Result<()> {
        Err(StoreError::NotSupported("chtimes"))
    }

    async fn set_storage_class(&self, _key: &str, _class: &str) -> Result<()> {
        Err(StoreError::NotSupported("storage class"))
    }
}

/// A store together with its capabilities, queried once at construction.
#[derive(Debug, Clone)]
pub struct Endpoint {
    store: Arc<dyn ObjectStore>,
    caps: Arc<Capabilities>,
}

impl Endpoint {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        let caps = Arc::new(store.capabilities());
        tracing::debug!("{}: capabilities {:?}", store.describe(), caps);
        Self { store, caps }
    }

    pub fn caps(&self) -> &Capabilities {
        &self.caps
    }

    pub fn is_local(&self) -> bool {
        self.caps.local_root.is_some()
    }
}

impl std::ops::Deref for Endpoint {
    type Target = dyn ObjectStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.store.describe())
    }
}

/// Build an endpoint from a URI: `file:///dir/`, a plain path, or `mem://name/`.
pub fn open(uri: &str) -> anyhow::Result<Endpoint> {
    if let Some(name) = uri.strip_prefix("mem://") {
        let name = name.trim_end_matches('/');
        return Ok(Endpoint::new(Arc::new(mem::MemStore::new(name))));
    }
    if let Some((scheme, _)) = uri.split_once("://") {
        if scheme != "file" {
            return Err(anyhow::anyhow!("unsupported storage scheme {scheme:?} in {uri:?}"));
        }
    }
    let path = uri.strip_prefix("file://").unwrap_or(uri);
    if path.is_empty() {
        return Err(anyhow::anyhow!("empty path in {uri:?}"));
    }
    let store = file::FileStore::new(std::path::Path::new(path))?;
    Ok(Endpoint::new(Arc::new(store)))
}

/// Read a whole byte stream into memory.
pub async fn read_all(mut reader: ByteReader, context: &str, hint: u64) -> Result<Bytes> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::with_capacity(usize::try_from(hint).unwrap_or(0));
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|err| StoreError::io(context, err))?;
    Ok(Bytes::from(buf))
}

/// Wrap in-memory bytes as a [`ByteReader`].
pub fn reader_from(data: Bytes) -> ByteReader {
    Box::new(std::io::Cursor::new(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_unknown_scheme() {
        let err = open("s3://bucket/prefix/").unwrap_err();
        assert!(format!("{err:#}").contains("unsupported storage scheme"));
    }

    #[test]
    fn open_mem_reports_paginated_store() -> Result<()> {
        let endpoint = open("mem://scratch/").map_err(|e| StoreError::Other(e.to_string()))?;
        assert!(!endpoint.is_local());
        assert_eq!(endpoint.to_string(), "mem://scratch/");
        Ok(())
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err = StoreError::io("a/b", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        let err = StoreError::io("a/b", std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!err.is_not_found());
    }
}
