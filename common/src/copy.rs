//! Single-shot and multipart object copies.
//!
//! Objects below the large-object threshold are read whole and written in one `put`, retried
//! with quadratic backoff. Larger objects go through a multipart session of the destination:
//! every part is fetched and uploaded concurrently under the global gate and the bandwidth
//! limiter. The first failed part cancels the parts that have not started yet and, once all
//! parts settled, the session is aborted. A destination without multipart support gets the
//! single-shot path instead, spooled through a temporary file.

use std::sync::Arc;

use tokio::io::AsyncSeekExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::SyncConfig;
use crate::download::ParallelDownloader;
use crate::object::ObjectEntry;
use crate::retry::{self, Backoff};
use crate::stats::RunContext;
use crate::store::mem::{DEFAULT_MAX_PART_COUNT, DEFAULT_MIN_PART_SIZE};
use crate::store::{Endpoint, MultipartSession, Part, StoreError, read_all, reader_from};

const MIB: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    /// the source disappeared after it was listed
    SourceVanished,
}

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("copying {key} failed: {source}")]
    Transfer {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("copying {key} failed at part {num}: {source}")]
    Part {
        key: String,
        num: u32,
        #[source]
        source: StoreError,
    },
    #[error("completing multipart upload of {key} failed: {source}")]
    Complete {
        key: String,
        #[source]
        source: StoreError,
    },
}

/// Part size and count for a multipart copy of `size` bytes.
///
/// The part size starts at the destination minimum and grows, aligned to whole MiB, until the
/// count fits the destination maximum.
pub fn plan_parts(size: u64, min_part_size: u64, max_part_count: u64) -> (u64, u64) {
    let mut part_size = if min_part_size == 0 {
        DEFAULT_MIN_PART_SIZE
    } else {
        min_part_size
    };
    let max_count = if max_part_count == 0 {
        DEFAULT_MAX_PART_COUNT
    } else {
        max_part_count
    };
    if size.div_ceil(part_size) > max_count {
        part_size = size.div_ceil(max_count).div_ceil(MIB) * MIB;
    }
    (part_size, size.div_ceil(part_size).max(1))
}

/// Copies objects from one endpoint to another.
#[derive(Debug, Clone)]
pub struct Copier {
    src: Endpoint,
    dst: Endpoint,
    ctx: RunContext,
    threshold: u64,
    block_size: u64,
    backoff: Backoff,
}

impl Copier {
    pub fn new(src: Endpoint, dst: Endpoint, ctx: RunContext, config: &SyncConfig) -> Self {
        Self {
            src,
            dst,
            ctx,
            threshold: config.large_object_threshold,
            block_size: config.block_size,
            backoff: Backoff::Quadratic(config.retry_backoff),
        }
    }

    #[instrument(skip(self, entry), fields(key = %entry.key, size = entry.size))]
    pub async fn copy(&self, entry: &ObjectEntry) -> Result<CopyOutcome, CopyError> {
        let key = entry.key.as_str();
        if entry.is_dir {
            return self.copy_dir(key).await;
        }
        if entry.size < self.threshold {
            return self.copy_single(key, entry.size, false).await;
        }
        let session = match self.dst.create_multipart_upload(key).await {
            Ok(session) => session,
            Err(err) => {
                if !err.is_not_supported() {
                    tracing::warn!("{}: cannot start multipart upload of {key}: {err}", self.dst);
                }
                return self.copy_single(key, entry.size, true).await;
            }
        };
        let res = self.copy_parts(key, entry.size, session).await;
        if let Err(err) = &res {
            if self.source_vanished(key).await {
                tracing::debug!("{key} vanished during copy: {err}");
                return Ok(CopyOutcome::SourceVanished);
            }
        }
        res
    }

    async fn source_vanished(&self, key: &str) -> bool {
        matches!(self.src.head(key).await, Err(err) if err.is_not_found())
    }

    /// Directories carry no data, the destination only gets an empty `key/` marker.
    async fn copy_dir(&self, key: &str) -> Result<CopyOutcome, CopyError> {
        retry::retry(&format!("create {key}"), retry::ATTEMPTS, self.backoff, |_| {
            self.dst.put(key, reader_from(bytes::Bytes::new()))
        })
        .await
        .map_err(|source| CopyError::Transfer {
            key: key.to_string(),
            source,
        })?;
        Ok(CopyOutcome::Copied)
    }

    async fn copy_single(&self, key: &str, size: u64, spool: bool) -> Result<CopyOutcome, CopyError> {
        let written = retry::retry(&format!("copy {key}"), retry::ATTEMPTS, self.backoff, |_| {
            self.put_once(key, size, spool)
        })
        .await
        .map_err(|source| CopyError::Transfer {
            key: key.to_string(),
            source,
        })?;
        if !written {
            tracing::debug!("{key} vanished before it was copied");
            return Ok(CopyOutcome::SourceVanished);
        }
        self.ctx.stats.copied_bytes.add(size);
        Ok(CopyOutcome::Copied)
    }

    /// One attempt of a single-shot copy, `false` when the source no longer exists.
    async fn put_once(&self, key: &str, size: u64, spool: bool) -> Result<bool, StoreError> {
        let any_local = self.src.is_local() || self.dst.is_local();
        if spool && !any_local {
            return self.spool_once(key, size).await;
        }
        self.ctx.limiter.acquire(size).await;
        let reader = match self.src.get(key, 0, None).await {
            Ok(reader) => reader,
            Err(err) => {
                if self.source_vanished(key).await {
                    tracing::debug!("{}: get {key}: {err}", self.src);
                    return Ok(false);
                }
                return Err(err);
            }
        };
        if spool || (self.src.is_local() && self.dst.is_local()) {
            self.dst.put(key, reader).await?;
        } else {
            let data = read_all(reader, key, size).await?;
            if data.len() as u64 != size {
                tracing::debug!("{key}: listed with {size} bytes, read {}", data.len());
            }
            self.dst.put(key, reader_from(data)).await?;
        }
        Ok(true)
    }

    /// Read the source through the prefetching downloader into a temporary file, then upload it.
    async fn spool_once(&self, key: &str, size: u64) -> Result<bool, StoreError> {
        if self.source_vanished(key).await {
            return Ok(false);
        }
        let file = tokio::task::spawn_blocking(tempfile::tempfile)
            .await
            .map_err(|err| StoreError::Other(format!("{key}: spool task failed: {err}")))?
            .map_err(|err| StoreError::io("temporary spool file", err))?;
        let mut file = tokio::fs::File::from_std(file);
        let mut downloader = ParallelDownloader::new(
            self.src.clone(),
            key,
            size,
            self.block_size,
            self.ctx.gate.size(),
            self.ctx.limiter.clone(),
        );
        let spooled = downloader.copy_to(&mut file).await;
        downloader.close();
        spooled?;
        file.rewind()
            .await
            .map_err(|err| StoreError::io("temporary spool file", err))?;
        self.dst.put(key, Box::new(file)).await?;
        Ok(true)
    }

    async fn copy_parts(
        &self,
        key: &str,
        size: u64,
        session: MultipartSession,
    ) -> Result<CopyOutcome, CopyError> {
        let (part_size, count) = plan_parts(size, session.min_part_size, session.max_part_count);
        tracing::debug!(
            "copying {key} as {count} parts of {} ({})",
            bytesize::ByteSize(part_size),
            session.upload_id
        );
        let cancel = CancellationToken::new();
        let upload_id: Arc<str> = Arc::from(session.upload_id.as_str());
        let mut join_set = tokio::task::JoinSet::new();
        for index in 0..count {
            let offset = index * part_size;
            let part = PartTask {
                src: self.src.clone(),
                dst: self.dst.clone(),
                ctx: self.ctx.clone(),
                key: key.to_string(),
                upload_id: upload_id.clone(),
                num: (index + 1) as u32,
                offset,
                len: part_size.min(size - offset),
                backoff: self.backoff,
                cancel: cancel.clone(),
            };
            join_set.spawn(part.run());
        }
        let mut parts = Vec::with_capacity(count as usize);
        let mut failure = None;
        while let Some(res) = join_set.join_next().await {
            let res = res.unwrap_or_else(|err| {
                Err(CopyError::Transfer {
                    key: key.to_string(),
                    source: StoreError::Other(format!("part task failed: {err}")),
                })
            });
            match res {
                Ok(Some(part)) => parts.push(part),
                Ok(None) => {}
                Err(err) => {
                    cancel.cancel();
                    if failure.is_none() {
                        tracing::warn!("{err}");
                        failure = Some(err);
                    }
                }
            }
        }
        if let Some(err) = failure {
            self.abort(key, &upload_id).await;
            return Err(err);
        }
        parts.sort_by_key(|part| part.num);
        if parts.len() as u64 != count {
            self.abort(key, &upload_id).await;
            return Err(CopyError::Complete {
                key: key.to_string(),
                source: StoreError::Other(format!("{} of {count} parts uploaded", parts.len())),
            });
        }
        if let Err(source) = self.dst.complete_upload(key, &upload_id, &parts).await {
            self.abort(key, &upload_id).await;
            return Err(CopyError::Complete {
                key: key.to_string(),
                source,
            });
        }
        Ok(CopyOutcome::Copied)
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        if let Err(err) = self.dst.abort_upload(key, upload_id).await {
            tracing::error!("{}: aborting upload {upload_id} of {key} failed: {err}", self.dst);
        }
    }
}

struct PartTask {
    src: Endpoint,
    dst: Endpoint,
    ctx: RunContext,
    key: String,
    upload_id: Arc<str>,
    num: u32,
    offset: u64,
    len: u64,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl PartTask {
    /// `None` when cancelled before the transfer started.
    async fn run(self) -> Result<Option<Part>, CopyError> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let _permit = self.ctx.gate.enter().await;
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let part = retry::retry(
            &format!("{} part {}", self.key, self.num),
            retry::ATTEMPTS,
            self.backoff,
            |_| self.transfer(),
        )
        .await
        .map_err(|source| CopyError::Part {
            key: self.key.clone(),
            num: self.num,
            source,
        })?;
        self.ctx.stats.copied_bytes.add(self.len);
        tracing::trace!("{}: part {} done", self.key, self.num);
        Ok(Some(part))
    }

    async fn transfer(&self) -> Result<Part, StoreError> {
        self.ctx.limiter.acquire(self.len).await;
        let reader = self.src.get(&self.key, self.offset, Some(self.len)).await?;
        let data = read_all(reader, &self.key, self.len).await?;
        if data.len() as u64 != self.len {
            return Err(StoreError::Other(format!(
                "{}: short read at offset {}: {} of {} bytes",
                self.key,
                self.offset,
                data.len(),
                self.len
            )));
        }
        self.dst
            .upload_part(&self.key, &self.upload_id, self.num, data)
            .await
    }
}
