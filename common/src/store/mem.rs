//! In-memory store over an ordered map.
//!
//! Only paginated listing is offered, so every sync against it goes through the lister's
//! pagination path. Multipart upload, permissions and storage class are opt-in.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{
    ByteReader, Capabilities, ListPage, MultipartSession, ObjectStore, Part, Result, StoreError,
};
use crate::object::{FileMeta, ObjectEntry};

pub const DEFAULT_MIN_PART_SIZE: u64 = 5 << 20;
pub const DEFAULT_MAX_PART_COUNT: u64 = 10_000;

#[derive(Debug, Clone)]
struct MemObject {
    data: Bytes,
    mtime: DateTime<Utc>,
    meta: FileMeta,
    storage_class: String,
}

#[derive(Debug, Default)]
struct Upload {
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, MemObject>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
}

#[derive(Debug)]
pub struct MemStore {
    name: String,
    multipart: Option<(u64, u64)>,
    permissions: bool,
    storage_class: bool,
    state: std::sync::Mutex<State>,
}

fn default_meta() -> FileMeta {
    FileMeta {
        owner: "root".to_string(),
        group: "root".to_string(),
        mode: 0o644,
    }
}

impl MemStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            multipart: None,
            permissions: false,
            storage_class: false,
            state: Default::default(),
        }
    }

    /// Enable multipart uploads with the given limits.
    pub fn with_multipart(mut self, min_part_size: u64, max_part_count: u64) -> Self {
        self.multipart = Some((min_part_size, max_part_count));
        self
    }

    pub fn with_permissions(mut self) -> Self {
        self.permissions = true;
        self
    }

    pub fn with_storage_class(mut self) -> Self {
        self.storage_class = true;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn entry(&self, key: &str, object: &MemObject) -> ObjectEntry {
        let mut entry = ObjectEntry::new(key, object.data.len() as u64, object.mtime)
            .with_storage_class(object.storage_class.clone());
        if self.permissions {
            entry = entry.with_file_meta(object.meta.clone());
        }
        entry
    }

    /// Insert an object directly, bypassing the async API.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>, mtime: DateTime<Utc>) {
        self.state().objects.insert(
            key.to_string(),
            MemObject {
                data: data.into(),
                mtime,
                meta: default_meta(),
                storage_class: String::new(),
            },
        );
    }

    pub fn contents(&self, key: &str) -> Option<Bytes> {
        self.state().objects.get(key).map(|object| object.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.state().objects.remove(key).is_some()
    }

    pub fn meta(&self, key: &str) -> Option<FileMeta> {
        self.state().objects.get(key).map(|object| object.meta.clone())
    }

    pub fn set_meta(&self, key: &str, meta: FileMeta) {
        if let Some(object) = self.state().objects.get_mut(key) {
            object.meta = meta;
        }
    }

    /// Number of multipart sessions neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    fn update<F: FnOnce(&mut MemObject)>(&self, key: &str, f: F) -> Result<()> {
        let mut state = self.state();
        let object = state
            .objects
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        f(object);
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    fn describe(&self) -> String {
        format!("mem://{}/", self.name)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            multipart: self.multipart.is_some(),
            permissions: self.permissions,
            mtime: true,
            storage_class: self.storage_class,
            local_root: None,
        }
    }

    async fn head(&self, key: &str) -> Result<ObjectEntry> {
        let state = self.state();
        let object = state
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(self.entry(key, object))
    }

    async fn get(&self, key: &str, offset: u64, limit: Option<u64>) -> Result<ByteReader> {
        let data = self
            .contents(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let len = data.len() as u64;
        let start = offset.min(len);
        let end = match limit {
            Some(limit) if limit > 0 => start.saturating_add(limit).min(len),
            _ => len,
        };
        Ok(super::reader_from(data.slice(start as usize..end as usize)))
    }

    async fn put(&self, key: &str, body: ByteReader) -> Result<()> {
        let data = super::read_all(body, key, 0).await?;
        let mut state = self.state();
        let previous = state.objects.remove(key);
        state.objects.insert(
            key.to_string(),
            MemObject {
                data,
                mtime: Utc::now(),
                meta: previous
                    .as_ref()
                    .map(|object| object.meta.clone())
                    .unwrap_or_else(default_meta),
                storage_class: previous
                    .map(|object| object.storage_class)
                    .unwrap_or_default(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state().objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str, marker: &str, limit: usize) -> Result<ListPage> {
        let state = self.state();
        let lower = if marker.is_empty() {
            Bound::Included(prefix.to_string())
        } else {
            Bound::Excluded(marker.to_string())
        };
        let mut matching = state
            .objects
            .range((lower, Bound::Unbounded))
            .skip_while(|(key, _)| !key.starts_with(prefix) && key.as_str() < prefix)
            .take_while(|(key, _)| key.starts_with(prefix));
        let entries: Vec<ObjectEntry> = matching
            .by_ref()
            .take(limit.max(1))
            .map(|(key, object)| self.entry(key, object))
            .collect();
        let has_more = matching.next().is_some();
        let next_marker = entries
            .last()
            .map(|entry| entry.key.clone())
            .unwrap_or_default();
        Ok(ListPage {
            entries,
            has_more,
            next_marker,
        })
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<MultipartSession> {
        let (min_part_size, max_part_count) = self
            .multipart
            .ok_or(StoreError::NotSupported("multipart upload"))?;
        let mut state = self.state();
        state.next_upload += 1;
        let upload_id = format!("{}-{}", self.name, state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            Upload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(MultipartSession {
            upload_id,
            min_part_size,
            max_part_count,
        })
    }

    async fn upload_part(&self, key: &str, upload_id: &str, num: u32, body: Bytes) -> Result<Part> {
        let mut state = self.state();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| StoreError::NotFound(format!("{key} upload {upload_id}")))?;
        let part = Part {
            num,
            size: body.len() as u64,
            etag: format!("{upload_id}-{num}-{}", body.len()),
        };
        upload.parts.insert(num, body);
        Ok(part)
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.state().uploads.remove(upload_id);
        Ok(())
    }

    async fn complete_upload(&self, key: &str, upload_id: &str, parts: &[Part]) -> Result<()> {
        let mut state = self.state();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::NotFound(format!("{key} upload {upload_id}")))?;
        let mut data = Vec::new();
        for (idx, part) in parts.iter().enumerate() {
            if part.num as usize != idx + 1 {
                return Err(StoreError::Other(format!(
                    "{key}: part {} out of order at position {}",
                    part.num,
                    idx + 1
                )));
            }
            let body = upload.parts.get(&part.num).ok_or_else(|| {
                StoreError::Other(format!("{key}: part {} was never uploaded", part.num))
            })?;
            data.extend_from_slice(body);
        }
        state.objects.insert(
            key.to_string(),
            MemObject {
                data: Bytes::from(data),
                mtime: Utc::now(),
                meta: default_meta(),
                storage_class: String::new(),
            },
        );
        Ok(())
    }

    async fn chmod(&self, key: &str, mode: u32) -> Result<()> {
        if !self.permissions {
            return Err(StoreError::NotSupported("chmod"));
        }
        self.update(key, |object| object.meta.mode = mode)
    }

    async fn chown(&self, key: &str, owner: &str, group: &str) -> Result<()> {
        if !self.permissions {
            return Err(StoreError::NotSupported("chown"));
        }
        self.update(key, |object| {
            object.meta.owner = owner.to_string();
            object.meta.group = group.to_string();
        })
    }

    async fn chtimes(&self, key: &str, mtime: DateTime<Utc>) -> Result<()> {
        self.update(key, |object| object.mtime = mtime)
    }

    async fn set_storage_class(&self, key: &str, class: &str) -> Result<()> {
        if !self.storage_class {
            return Err(StoreError::NotSupported("storage class"));
        }
        self.update(key, |object| object.storage_class = class.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(keys: &[&str]) -> MemStore {
        let store = MemStore::new("test");
        for key in keys {
            store.insert(key, key.as_bytes().to_vec(), Utc::now());
        }
        store
    }

    fn keys(page: &ListPage) -> Vec<&str> {
        page.entries.iter().map(|entry| entry.key.as_str()).collect()
    }

    #[tokio::test]
    async fn paginates_after_marker() -> Result<()> {
        let store = store_with(&["a", "aa", "b", "c"]);
        let page = store.list("", "", 2).await?;
        assert_eq!(keys(&page), ["a", "aa"]);
        assert!(page.has_more);
        let page = store.list("", &page.next_marker, 2).await?;
        assert_eq!(keys(&page), ["b", "c"]);
        assert!(!page.has_more);
        Ok(())
    }

    #[tokio::test]
    async fn list_respects_prefix() -> Result<()> {
        let store = store_with(&["a/1", "a/2", "b/1", "c"]);
        let page = store.list("b/", "", 10).await?;
        assert_eq!(keys(&page), ["b/1"]);
        let page = store.list("a/", "a/1", 10).await?;
        assert_eq!(keys(&page), ["a/2"]);
        Ok(())
    }

    #[tokio::test]
    async fn ranged_get() -> Result<()> {
        let store = store_with(&[]);
        store.insert("k", b"0123456789".to_vec(), Utc::now());
        let data = super::super::read_all(store.get("k", 2, Some(3)).await?, "k", 0).await?;
        assert_eq!(&data[..], b"234");
        let data = super::super::read_all(store.get("k", 7, None).await?, "k", 0).await?;
        assert_eq!(&data[..], b"789");
        let data = super::super::read_all(store.get("k", 20, Some(3)).await?, "k", 0).await?;
        assert!(data.is_empty());
        assert!(store.get("missing", 0, None).await.err().is_some_and(|e| e.is_not_found()));
        Ok(())
    }

    #[tokio::test]
    async fn multipart_assembles_in_order() -> Result<()> {
        let store = MemStore::new("mp").with_multipart(1, 10);
        let session = store.create_multipart_upload("big").await?;
        let second = store
            .upload_part("big", &session.upload_id, 2, Bytes::from_static(b"world"))
            .await?;
        let first = store
            .upload_part("big", &session.upload_id, 1, Bytes::from_static(b"hello "))
            .await?;
        store
            .complete_upload("big", &session.upload_id, &[first, second])
            .await?;
        assert_eq!(store.contents("big").as_deref(), Some(&b"hello world"[..]));
        assert_eq!(store.pending_uploads(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn perms_are_opt_in() -> Result<()> {
        let store = store_with(&["k"]);
        assert!(store.chmod("k", 0o600).await.is_err());
        assert!(store.head("k").await?.file.is_none());
        let store = MemStore::new("p").with_permissions();
        store.insert("k", b"x".to_vec(), Utc::now());
        store.chmod("k", 0o600).await?;
        store.chown("k", "alice", "staff").await?;
        let meta = store.head("k").await?.file;
        assert_eq!(
            meta,
            Some(FileMeta {
                owner: "alice".to_string(),
                group: "staff".to_string(),
                mode: 0o600
            })
        );
        Ok(())
    }
}
