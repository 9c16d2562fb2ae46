//! Fault-injecting store wrapper and fixtures shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::object::ObjectEntry;
use crate::store::mem::MemStore;
use crate::store::{
    ByteReader, Capabilities, Endpoint, ListPage, MultipartSession, ObjectStore, Part, Result,
    StoreError, read_all, reader_from,
};

/// Knobs and call counters of a [`FaultyStore`].
#[derive(Debug, Default)]
pub struct Faults {
    /// fail this many upcoming `list` calls
    pub list_failures: AtomicUsize,
    /// fail every `list` call from this 1-based call number on, 0 disables
    pub fail_lists_from: AtomicUsize,
    pub list_calls: AtomicUsize,
    /// return the marker key again at the head of every page
    pub repeat_marker: AtomicBool,
    /// return pages in descending order
    pub disorder: AtomicBool,
    /// fail this many upcoming `get` calls
    pub get_failures: AtomicUsize,
    /// flip the first byte of every stored object
    pub corrupt_puts: AtomicBool,
    /// always fail uploading this part number, 0 disables
    pub fail_part: AtomicU32,
    pub fail_complete: AtomicBool,
    pub fail_create: AtomicBool,
    pub creates: AtomicUsize,
    pub part_attempts: AtomicUsize,
    pub aborts: AtomicUsize,
    pub completes: AtomicUsize,
    pub completed_parts: std::sync::Mutex<Vec<u32>>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug)]
pub struct FaultyStore {
    pub inner: Arc<MemStore>,
    pub faults: Faults,
}

impl FaultyStore {
    pub fn new(inner: MemStore) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(inner),
            faults: Faults::default(),
        })
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    fn describe(&self) -> String {
        format!("faulty+{}", self.inner.describe())
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn head(&self, key: &str) -> Result<ObjectEntry> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str, offset: u64, limit: Option<u64>) -> Result<ByteReader> {
        if take_one(&self.faults.get_failures) {
            return Err(StoreError::Other(format!("{key}: injected get failure")));
        }
        self.inner.get(key, offset, limit).await
    }

    async fn put(&self, key: &str, body: ByteReader) -> Result<()> {
        if self.faults.corrupt_puts.load(Ordering::Acquire) {
            let mut data = read_all(body, key, 0).await?.to_vec();
            if let Some(first) = data.first_mut() {
                *first ^= 0xff;
            }
            return self.inner.put(key, reader_from(Bytes::from(data))).await;
        }
        self.inner.put(key, body).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str, marker: &str, limit: usize) -> Result<ListPage> {
        let call = self.faults.list_calls.fetch_add(1, Ordering::AcqRel) + 1;
        let fail_from = self.faults.fail_lists_from.load(Ordering::Acquire);
        if take_one(&self.faults.list_failures) || (fail_from != 0 && call >= fail_from) {
            return Err(StoreError::Other("injected list failure".to_string()));
        }
        let mut page = self.inner.list(prefix, marker, limit).await?;
        if self.faults.repeat_marker.load(Ordering::Acquire) && !marker.is_empty() {
            if let Ok(entry) = self.inner.head(marker).await {
                page.entries.insert(0, entry);
            }
        }
        if self.faults.disorder.load(Ordering::Acquire) {
            page.entries.reverse();
        }
        Ok(page)
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<MultipartSession> {
        self.faults.creates.fetch_add(1, Ordering::AcqRel);
        if self.faults.fail_create.load(Ordering::Acquire) {
            return Err(StoreError::Other(format!("{key}: injected create failure")));
        }
        self.inner.create_multipart_upload(key).await
    }

    async fn upload_part(&self, key: &str, upload_id: &str, num: u32, body: Bytes) -> Result<Part> {
        self.faults.part_attempts.fetch_add(1, Ordering::AcqRel);
        if self.faults.fail_part.load(Ordering::Acquire) == num {
            return Err(StoreError::Other(format!("{key}: injected failure of part {num}")));
        }
        self.inner.upload_part(key, upload_id, num, body).await
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.faults.aborts.fetch_add(1, Ordering::AcqRel);
        self.inner.abort_upload(key, upload_id).await
    }

    async fn complete_upload(&self, key: &str, upload_id: &str, parts: &[Part]) -> Result<()> {
        self.faults.completes.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut completed) = self.faults.completed_parts.lock() {
            completed.extend(parts.iter().map(|part| part.num));
        }
        if self.faults.fail_complete.load(Ordering::Acquire) {
            return Err(StoreError::Other(format!("{key}: injected complete failure")));
        }
        self.inner.complete_upload(key, upload_id, parts).await
    }

    async fn chmod(&self, key: &str, mode: u32) -> Result<()> {
        self.inner.chmod(key, mode).await
    }

    async fn chown(&self, key: &str, owner: &str, group: &str) -> Result<()> {
        self.inner.chown(key, owner, group).await
    }

    async fn chtimes(&self, key: &str, mtime: DateTime<Utc>) -> Result<()> {
        self.inner.chtimes(key, mtime).await
    }
}

pub fn endpoint(store: Arc<dyn ObjectStore>) -> Endpoint {
    Endpoint::new(store)
}

/// Memory store holding each key with its own name as content.
pub fn mem_with_keys(name: &str, keys: &[&str]) -> Arc<MemStore> {
    let store = MemStore::new(name);
    let mtime = Utc::now();
    for key in keys {
        store.insert(key, key.as_bytes().to_vec(), mtime);
    }
    Arc::new(store)
}

/// Deterministic pseudo-random content.
pub fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ ((i >> 8) as u8))
        .collect()
}
