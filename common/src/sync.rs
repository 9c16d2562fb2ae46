//! One local sync run: the differ feeding a worker pool through a bounded queue.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::instrument;

use crate::config::SyncConfig;
use crate::differ;
use crate::stats::{RunContext, Stat, Stats};
use crate::store::Endpoint;
use crate::worker::{Worker, run_workers};

/// Capacity of the task queue between the differ and the local workers.
pub const QUEUE_SIZE: usize = 10240;

/// Error type for sync operations that preserves the counters accumulated before failing.
///
/// Log with `{:#}` or `{:?}` to see the whole error chain.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Stat,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Stat) -> Self {
        Error { source, summary }
    }
}

/// Final check of a run: nothing failed and every classified key was handled.
pub fn reconcile(stats: &Stats) -> Result<Stat, Error> {
    let summary = stats.snapshot();
    let total = stats.total.get();
    if summary.failed > 0 {
        return Err(Error::new(
            anyhow!("failed to sync {} objects", summary.failed),
            summary,
        ));
    }
    if summary.handled != total {
        return Err(Error::new(
            anyhow!("handled {} of {} objects", summary.handled, total),
            summary,
        ));
    }
    Ok(summary)
}

/// Make `dst` converge towards `src` under `config`.
#[instrument(skip_all, fields(src = %src, dst = %dst))]
pub async fn sync(
    config: Arc<SyncConfig>,
    src: Endpoint,
    dst: Endpoint,
    ctx: RunContext,
) -> Result<Stat, Error> {
    let (tx, rx) = async_channel::bounded(QUEUE_SIZE);
    let worker = Worker::new(config.clone(), src.clone(), dst.clone(), ctx.clone());
    let pool = tokio::spawn(run_workers(worker, config.threads, rx));
    let produced = differ::produce(&config, src, dst, &ctx.stats, tx).await;
    if produced.is_err() {
        tracing::error!("listing failed, stop syncing, waiting for pending objects");
    }
    let pooled = pool.await;
    if let Err(err) = produced {
        return Err(Error::new(err.into(), ctx.stats.snapshot()));
    }
    if let Err(err) = pooled {
        return Err(Error::new(
            anyhow!("worker pool failed: {err}"),
            ctx.stats.snapshot(),
        ));
    }
    reconcile(&ctx.stats)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::store::mem::MemStore;
    use crate::store::{ObjectStore, file::FileStore};
    use crate::testutils::{FaultyStore, content, endpoint, mem_with_keys};

    fn config(config: SyncConfig) -> Arc<SyncConfig> {
        Arc::new(SyncConfig {
            retry_backoff: Duration::from_millis(1),
            ..config
        })
    }

    async fn run(
        config: &Arc<SyncConfig>,
        src: Arc<dyn ObjectStore>,
        dst: Arc<dyn ObjectStore>,
    ) -> Result<Stat, Error> {
        sync(config.clone(), endpoint(src), endpoint(dst), RunContext::unlimited(4)).await
    }

    #[tokio::test]
    #[traced_test]
    async fn second_run_changes_nothing() -> Result<(), anyhow::Error> {
        let src_dir = tempfile::tempdir()?;
        let dst_dir = tempfile::tempdir()?;
        std::fs::create_dir_all(src_dir.path().join("a/b"))?;
        std::fs::write(src_dir.path().join("a/b/one"), content(1000, 1))?;
        std::fs::write(src_dir.path().join("a/two"), content(5, 2))?;
        std::fs::write(src_dir.path().join("three"), b"")?;
        std::fs::write(dst_dir.path().join("zzz"), b"extra")?;
        let config = config(SyncConfig {
            delete_dst: true,
            dirs: true,
            perms: true,
            ..Default::default()
        });
        let src: Arc<dyn ObjectStore> = Arc::new(FileStore::new(src_dir.path())?);
        let dst: Arc<dyn ObjectStore> = Arc::new(FileStore::new(dst_dir.path())?);
        let first = run(&config, src.clone(), dst.clone()).await?;
        assert_eq!(first.copied, 5, "{first}");
        assert_eq!(first.deleted, 1);
        assert_eq!(std::fs::read(dst_dir.path().join("a/b/one"))?, content(1000, 1));
        assert!(!dst_dir.path().join("zzz").exists());
        let second = run(&config, src, dst).await?;
        assert_eq!(second.copied, 0, "{second}");
        assert_eq!(second.deleted, 0);
        assert_eq!(second.skipped, 5);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn directories_copy_from_local_to_object_store() -> Result<(), anyhow::Error> {
        let src_dir = tempfile::tempdir()?;
        std::fs::create_dir_all(src_dir.path().join("d/e"))?;
        std::fs::write(src_dir.path().join("d/x"), b"hello")?;
        let config = config(SyncConfig {
            dirs: true,
            ..Default::default()
        });
        let src: Arc<dyn ObjectStore> = Arc::new(FileStore::new(src_dir.path())?);
        let dst = Arc::new(MemStore::new("dst"));
        let summary = run(&config, src, dst.clone()).await?;
        assert_eq!(summary.copied, 3, "{summary}");
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.copied_bytes, 5);
        let mut keys = dst.keys();
        keys.sort();
        assert_eq!(keys, ["d/", "d/e/", "d/x"]);
        assert_eq!(dst.contents("d/").as_deref(), Some(&b""[..]));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn checksum_mismatch_is_recopied() -> Result<(), anyhow::Error> {
        let now = chrono::Utc::now();
        let src = MemStore::new("src");
        src.insert("k", b"abcd".to_vec(), now);
        src.insert("same", b"same".to_vec(), now);
        let dst = MemStore::new("dst");
        dst.insert("k", b"abce".to_vec(), now);
        dst.insert("same", b"same".to_vec(), now);
        let dst = Arc::new(dst);
        let config = config(SyncConfig {
            check_all: true,
            ..Default::default()
        });
        let summary = run(&config, Arc::new(src), dst.clone()).await?;
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.copied, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.deleted, 0);
        assert_eq!(dst.contents("k").as_deref(), Some(&b"abcd"[..]));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn large_objects_go_through_multipart() -> Result<(), anyhow::Error> {
        let data = content((3 << 20) + 1, 5);
        let src = MemStore::new("src");
        src.insert("big", data.clone(), chrono::Utc::now());
        src.insert("small", b"x".to_vec(), chrono::Utc::now());
        let dst = FaultyStore::new(MemStore::new("dst").with_multipart(1 << 20, 100));
        let config = config(SyncConfig {
            large_object_threshold: 1 << 20,
            check_new: true,
            ..Default::default()
        });
        let summary = run(&config, Arc::new(src), dst.clone()).await?;
        assert_eq!(summary.copied, 2);
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.copied_bytes, data.len() as u64 + 1);
        assert_eq!(dst.faults.completes.load(Ordering::Acquire), 1);
        assert_eq!(dst.inner.contents("big").as_deref(), Some(&data[..]));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failures_fail_the_run_with_a_summary() {
        let src = MemStore::new("src");
        src.insert("big", content(2 << 20, 1), chrono::Utc::now());
        src.insert("ok", b"fine".to_vec(), chrono::Utc::now());
        let dst = FaultyStore::new(MemStore::new("dst").with_multipart(1 << 20, 100));
        dst.faults.fail_part.store(1, Ordering::Release);
        let config = config(SyncConfig {
            large_object_threshold: 1 << 20,
            ..Default::default()
        });
        let err = run(&config, Arc::new(src), dst.clone()).await.unwrap_err();
        assert_eq!(err.summary.failed, 1);
        assert_eq!(err.summary.copied, 1);
        assert_eq!(err.summary.handled, 2);
        assert!(format!("{err}").contains("failed to sync 1 objects"));
    }

    #[tokio::test]
    #[traced_test]
    async fn listing_failure_fails_the_run() {
        let src = FaultyStore::new(MemStore::new("src"));
        src.inner.insert("a", b"a".to_vec(), chrono::Utc::now());
        src.faults.list_failures.store(10, Ordering::Release);
        let config = config(SyncConfig::default());
        let err = run(&config, src, mem_with_keys("dst", &[])).await.unwrap_err();
        assert!(format!("{err}").contains("listing"), "{err}");
    }

    #[test]
    fn unhandled_keys_do_not_reconcile() {
        let stats = Stats::new();
        stats.total.add(3);
        stats.handled.add(2);
        let err = reconcile(&stats).unwrap_err();
        assert!(format!("{err}").contains("handled 2 of 3"));
        stats.handled.inc();
        assert!(reconcile(&stats).is_ok());
    }
}
