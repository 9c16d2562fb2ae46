//! Sequential reads over an object fetched as concurrent range reads.
//!
//! `[0, size)` is cut into blocks of `block_size` bytes. A scheduler task starts one fetch per
//! block as soon as a window slot is free, pushing a completion receiver per block, in order, to
//! the reader. A slot is held by the block's buffer until the reader has consumed it, so at
//! most `concurrency` blocks are in flight or buffered at any time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};

use crate::retry::{self, Backoff};
use crate::store::{Endpoint, StoreError};

const FETCH_BACKOFF: Duration = Duration::from_millis(100);

type Pending = oneshot::Receiver<Result<Block, StoreError>>;

/// Free list of block buffers shared by the fetches of one downloader.
#[derive(Debug, Default)]
struct Pool {
    free: std::sync::Mutex<Vec<Vec<u8>>>,
    in_use: AtomicUsize,
}

impl Pool {
    fn take(self: &Arc<Self>, capacity: usize) -> PooledBuf {
        let buf = self
            .free
            .lock()
            .map(|mut free| free.pop())
            .unwrap_or_default()
            .unwrap_or_else(|| Vec::with_capacity(capacity));
        self.in_use.fetch_add(1, Ordering::AcqRel);
        PooledBuf {
            buf,
            pool: self.clone(),
        }
    }
}

/// Buffer that goes back to its pool when dropped.
#[derive(Debug)]
struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<Pool>,
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        if let Ok(mut free) = self.pool.free.lock() {
            free.push(buf);
        }
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct Block {
    data: PooledBuf,
    pos: usize,
    _slot: OwnedSemaphorePermit,
}

impl Block {
    fn remaining(&self) -> &[u8] {
        &self.data.buf[self.pos..]
    }
}

#[derive(Debug)]
pub struct ParallelDownloader {
    key: String,
    size: u64,
    offset: u64,
    current: Option<Block>,
    blocks: mpsc::Receiver<Pending>,
    scheduler: tokio::task::JoinHandle<()>,
    pool: Arc<Pool>,
    error: Option<StoreError>,
    closed: bool,
}

impl ParallelDownloader {
    /// Start prefetching `size` bytes of `key`. Must be called inside a tokio runtime.
    pub fn new(
        endpoint: Endpoint,
        key: &str,
        size: u64,
        block_size: u64,
        concurrency: usize,
        limiter: throttle::BandwidthLimiter,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let block_size = block_size.max(1);
        let pool = Arc::new(Pool::default());
        let (tx, blocks) = mpsc::channel(concurrency);
        let scheduler = tokio::spawn(schedule(Fetch {
            endpoint,
            key: key.to_string(),
            size,
            block_size,
            window: Arc::new(Semaphore::new(concurrency)),
            limiter,
            pool: pool.clone(),
            tx,
        }));
        Self {
            key: key.to_string(),
            size,
            offset: 0,
            current: None,
            blocks,
            scheduler,
            pool,
            error: None,
            closed: false,
        }
    }

    /// Read the next bytes into `buf`, returning 0 at the end of the object.
    ///
    /// A failed block fails this and every later read with the same error.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StoreError> {
        if self.closed {
            return Err(StoreError::Other(format!("{}: downloader is closed", self.key)));
        }
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(block) = self.current.as_mut() {
                let remaining = block.remaining();
                if !remaining.is_empty() {
                    let n = remaining.len().min(buf.len());
                    buf[..n].copy_from_slice(&remaining[..n]);
                    block.pos += n;
                    self.offset += n as u64;
                    return Ok(n);
                }
                // consumed: releases the buffer and the window slot
                self.current = None;
            }
            if self.offset >= self.size {
                return Ok(0);
            }
            match self.next_block().await {
                Ok(block) => self.current = Some(block),
                Err(err) => {
                    self.error = Some(err.clone());
                    return Err(err);
                }
            }
        }
    }

    async fn next_block(&mut self) -> Result<Block, StoreError> {
        let key = self.key.clone();
        let stopped = || StoreError::Other(format!("{key}: block fetch stopped"));
        let Some(pending) = self.blocks.recv().await else {
            return Err(stopped());
        };
        pending.await.map_err(|_| stopped())?
    }

    /// Copy the rest of the object into `writer`, returning the number of bytes written.
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> Result<u64, StoreError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; 256 << 10];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|err| StoreError::io(&self.key, err))?;
            total += n as u64;
        }
        writer
            .flush()
            .await
            .map_err(|err| StoreError::io(&self.key, err))?;
        Ok(total)
    }

    /// Stop all fetches and release every buffer; later reads fail.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.scheduler.abort();
        self.current = None;
        self.blocks.close();
        while self.blocks.try_recv().is_ok() {}
    }

    /// Buffers currently held by fetched or in-flight blocks.
    pub fn buffers_in_use(&self) -> usize {
        self.pool.in_use.load(Ordering::Acquire)
    }
}

impl Drop for ParallelDownloader {
    fn drop(&mut self) {
        self.close();
    }
}

struct Fetch {
    endpoint: Endpoint,
    key: String,
    size: u64,
    block_size: u64,
    window: Arc<Semaphore>,
    limiter: throttle::BandwidthLimiter,
    pool: Arc<Pool>,
    tx: mpsc::Sender<Pending>,
}

async fn schedule(fetch: Fetch) {
    // dropped together with the scheduler, which aborts every fetch still running
    let mut fetches = tokio::task::JoinSet::new();
    let mut offset = 0;
    while offset < fetch.size {
        let Ok(slot) = fetch.window.clone().acquire_owned().await else {
            return;
        };
        let len = fetch.block_size.min(fetch.size - offset);
        let (done, pending) = oneshot::channel();
        if fetch.tx.send(pending).await.is_err() {
            return;
        }
        let endpoint = fetch.endpoint.clone();
        let key = fetch.key.clone();
        let limiter = fetch.limiter.clone();
        let pool = fetch.pool.clone();
        fetches.spawn(async move {
            let res = retry::retry(
                "range read",
                retry::ATTEMPTS,
                Backoff::Quadratic(FETCH_BACKOFF),
                |_| fetch_block(&endpoint, &key, offset, len, &limiter, &pool),
            )
            .await
            .map(|data| Block {
                data,
                pos: 0,
                _slot: slot,
            });
            let _ = done.send(res);
        });
        offset += len;
        while fetches.try_join_next().is_some() {}
    }
    while fetches.join_next().await.is_some() {}
}

async fn fetch_block(
    endpoint: &Endpoint,
    key: &str,
    offset: u64,
    len: u64,
    limiter: &throttle::BandwidthLimiter,
    pool: &Arc<Pool>,
) -> Result<PooledBuf, StoreError> {
    limiter.acquire(len).await;
    let reader = endpoint.get(key, offset, Some(len)).await?;
    let mut data = pool.take(len as usize);
    reader
        .take(len)
        .read_to_end(&mut data.buf)
        .await
        .map_err(|err| StoreError::io(key, err))?;
    if data.buf.len() as u64 != len {
        return Err(StoreError::Other(format!(
            "{key}: short read at offset {offset}: {} of {len} bytes",
            data.buf.len()
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tracing_test::traced_test;

    use super::*;
    use crate::store::mem::MemStore;
    use crate::testutils::{FaultyStore, content, endpoint};

    async fn read_all(downloader: &mut ParallelDownloader) -> Result<Vec<u8>, StoreError> {
        let mut out = vec![];
        let mut buf = vec![0u8; 777];
        loop {
            let n = downloader.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    fn store_with(key: &str, data: &[u8]) -> Arc<MemStore> {
        let store = MemStore::new("m");
        store.insert(key, data.to_vec(), chrono::Utc::now());
        Arc::new(store)
    }

    #[tokio::test]
    #[traced_test]
    async fn sequential_reads_reproduce_content() -> Result<(), anyhow::Error> {
        let block = 1000;
        for concurrency in [1, 5, 3 * 10 + 100] {
            for len in [0, 1, block - 1, block, block + 1, 10 * block + 333] {
                let data = content(len as usize, 7);
                let store = store_with("obj", &data);
                let mut downloader = ParallelDownloader::new(
                    endpoint(store),
                    "obj",
                    len,
                    block,
                    concurrency,
                    throttle::BandwidthLimiter::new(None),
                );
                let got = read_all(&mut downloader).await?;
                assert_eq!(got, data, "len {len} concurrency {concurrency}");
                // past the end stays at the end
                let mut buf = [0u8; 16];
                assert_eq!(downloader.read(&mut buf).await?, 0);
                assert_eq!(downloader.buffers_in_use(), 0);
            }
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn deleted_source_surfaces_not_found() {
        let data = content(5000, 1);
        let store = store_with("obj", &data);
        store.remove("obj");
        let mut downloader = ParallelDownloader::new(
            endpoint(store),
            "obj",
            5000,
            1000,
            4,
            throttle::BandwidthLimiter::new(None),
        );
        let mut buf = [0u8; 100];
        let err = downloader.read(&mut buf).await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
        // the failure is sticky
        let err = downloader.read(&mut buf).await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn missing_key_is_not_found() {
        let store = store_with("obj", b"data");
        let mut downloader = ParallelDownloader::new(
            endpoint(store),
            "notExist",
            4,
            2,
            2,
            throttle::BandwidthLimiter::new(None),
        );
        let mut buf = [0u8; 4];
        assert!(downloader.read(&mut buf).await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn transient_failures_are_retried() -> Result<(), anyhow::Error> {
        let data = content(3000, 3);
        let store = FaultyStore::new(MemStore::new("m"));
        store.inner.insert("obj", data.clone(), chrono::Utc::now());
        store.faults.get_failures.store(2, Ordering::Release);
        let mut downloader = ParallelDownloader::new(
            endpoint(store),
            "obj",
            3000,
            1000,
            1,
            throttle::BandwidthLimiter::new(None),
        );
        assert_eq!(read_all(&mut downloader).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn close_releases_buffers_and_fails_reads() -> Result<(), anyhow::Error> {
        let data = content(64 * 1024, 9);
        let store = store_with("obj", &data);
        let mut downloader = ParallelDownloader::new(
            endpoint(store),
            "obj",
            data.len() as u64,
            1024,
            8,
            throttle::BandwidthLimiter::new(None),
        );
        let mut buf = [0u8; 10];
        assert_eq!(downloader.read(&mut buf).await?, 10);
        assert_eq!(&buf, &data[..10]);
        downloader.close();
        downloader.close();
        assert!(downloader.read(&mut buf).await.is_err());
        for _ in 0..100 {
            if downloader.buffers_in_use() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(downloader.buffers_in_use(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn copy_to_writes_everything() -> Result<(), anyhow::Error> {
        let data = content(10_000, 5);
        let store = store_with("obj", &data);
        let mut downloader = ParallelDownloader::new(
            endpoint(store),
            "obj",
            data.len() as u64,
            999,
            3,
            throttle::BandwidthLimiter::new(None),
        );
        let mut out = vec![];
        assert_eq!(downloader.copy_to(&mut out).await?, 10_000);
        assert_eq!(out, data);
        Ok(())
    }
}
