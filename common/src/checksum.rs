//! Byte-for-byte comparison of a source object with its destination copy.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::retry::{self, Backoff};
use crate::stats::RunContext;
use crate::store::{Endpoint, StoreError, read_all};

#[derive(Debug, thiserror::Error)]
#[error("verifying {key} failed: {source}")]
pub struct VerifyError {
    pub key: String,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone)]
pub struct Verifier {
    src: Endpoint,
    dst: Endpoint,
    ctx: RunContext,
    chunk_size: u64,
    backoff: Backoff,
}

impl Verifier {
    /// Objects smaller than `chunk_size` are compared in one pass.
    pub fn new(src: Endpoint, dst: Endpoint, ctx: RunContext, chunk_size: u64, backoff: Duration) -> Self {
        Self {
            src,
            dst,
            ctx,
            chunk_size: chunk_size.max(1),
            backoff: Backoff::Quadratic(backoff),
        }
    }

    /// `Ok(false)` when the contents differ; errors only for I/O failures that survived retries.
    #[instrument(skip(self))]
    pub async fn verify(&self, key: &str, size: u64) -> Result<bool, VerifyError> {
        let equal = retry::retry(&format!("verify {key}"), retry::ATTEMPTS, self.backoff, |_| {
            self.verify_once(key, size)
        })
        .await
        .map_err(|source| VerifyError {
            key: key.to_string(),
            source,
        })?;
        self.ctx.stats.checked.inc();
        self.ctx.stats.checked_bytes.add(size);
        if !equal {
            tracing::warn!("{key}: destination differs from source");
        }
        Ok(equal)
    }

    async fn verify_once(&self, key: &str, size: u64) -> Result<bool, StoreError> {
        if size < self.chunk_size {
            self.ctx.limiter.acquire(size.saturating_mul(2)).await;
            let src = read_all(self.src.get(key, 0, None).await?, key, size).await?;
            let dst = read_all(self.dst.get(key, 0, None).await?, key, size).await?;
            return Ok(src == dst);
        }
        if self.dst.head(key).await?.size != size {
            return Ok(false);
        }
        let cancel = CancellationToken::new();
        let mut join_set = tokio::task::JoinSet::new();
        let mut offset = 0;
        while offset < size {
            let chunk = Chunk {
                verifier: self.clone(),
                key: key.to_string(),
                offset,
                len: self.chunk_size.min(size - offset),
                cancel: cancel.clone(),
            };
            join_set.spawn(chunk.compare());
            offset += self.chunk_size;
        }
        let mut equal = true;
        let mut failure = None;
        while let Some(res) = join_set.join_next().await {
            let res = res.unwrap_or_else(|err| {
                Err(StoreError::Other(format!("{key}: chunk comparison failed: {err}")))
            });
            match res {
                Ok(true) => {}
                Ok(false) => {
                    cancel.cancel();
                    equal = false;
                }
                Err(err) => {
                    cancel.cancel();
                    failure.get_or_insert(err);
                }
            }
        }
        // a mismatch is a verdict, an error found next to it does not change that
        if !equal {
            return Ok(false);
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }
}

struct Chunk {
    verifier: Verifier,
    key: String,
    offset: u64,
    len: u64,
    cancel: CancellationToken,
}

impl Chunk {
    /// Cancelled chunks report equality so they never decide the verdict.
    async fn compare(self) -> Result<bool, StoreError> {
        if self.cancel.is_cancelled() {
            return Ok(true);
        }
        let _permit = self.verifier.ctx.gate.enter().await;
        if self.cancel.is_cancelled() {
            return Ok(true);
        }
        let v = &self.verifier;
        v.ctx.limiter.acquire(self.len.saturating_mul(2)).await;
        let src = read_all(
            v.src.get(&self.key, self.offset, Some(self.len)).await?,
            &self.key,
            self.len,
        )
        .await?;
        let dst = read_all(
            v.dst.get(&self.key, self.offset, Some(self.len)).await?,
            &self.key,
            self.len,
        )
        .await?;
        Ok(src == dst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tracing_test::traced_test;

    use super::*;
    use crate::store::mem::MemStore;
    use crate::testutils::{content, endpoint};

    fn pair(src_data: &[u8], dst_data: &[u8]) -> (Arc<MemStore>, Arc<MemStore>) {
        let now = chrono::Utc::now();
        let src = MemStore::new("src");
        src.insert("k", src_data.to_vec(), now);
        let dst = MemStore::new("dst");
        dst.insert("k", dst_data.to_vec(), now);
        (Arc::new(src), Arc::new(dst))
    }

    fn verifier(src: Arc<MemStore>, dst: Arc<MemStore>, chunk: u64) -> Verifier {
        Verifier::new(
            endpoint(src),
            endpoint(dst),
            RunContext::unlimited(3),
            chunk,
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn equal_objects_match_in_both_modes() -> Result<(), anyhow::Error> {
        let data = content(10_000, 1);
        for chunk in [100_000, 1000, 333] {
            let (src, dst) = pair(&data, &data);
            let verifier = verifier(src, dst, chunk);
            assert!(verifier.verify("k", data.len() as u64).await?);
            assert_eq!(verifier.ctx.stats.checked.get(), 1);
            assert_eq!(verifier.ctx.stats.checked_bytes.get(), 10_000);
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn single_byte_difference_is_found() -> Result<(), anyhow::Error> {
        let data = content(10_000, 1);
        let mut other = data.clone();
        other[7777] ^= 0xff;
        for chunk in [100_000, 1000] {
            let (src, dst) = pair(&data, &other);
            assert!(!verifier(src, dst, chunk).verify("k", 10_000).await?);
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn size_mismatch_is_not_equal() -> Result<(), anyhow::Error> {
        let data = content(5000, 1);
        let (src, dst) = pair(&data, &data[..4000]);
        assert!(!verifier(src.clone(), dst.clone(), 100_000).verify("k", 5000).await?);
        assert!(!verifier(src, dst, 1000).verify("k", 5000).await?);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_destination_is_an_error() {
        let src = MemStore::new("src");
        src.insert("k", b"abc".to_vec(), chrono::Utc::now());
        let verifier = verifier(Arc::new(src), Arc::new(MemStore::new("dst")), 1000);
        let err = verifier.verify("k", 3).await.unwrap_err();
        assert!(err.source.is_not_found(), "{err}");
        assert_eq!(verifier.ctx.stats.checked.get(), 0);
    }
}
