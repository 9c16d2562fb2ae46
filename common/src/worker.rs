//! The worker pool draining the task queue.

use std::sync::Arc;

use crate::checksum::Verifier;
use crate::config::SyncConfig;
use crate::copy::{Copier, CopyOutcome};
use crate::object::{Action, ObjectEntry, WorkItem};
use crate::retry::{self, Backoff};
use crate::stats::RunContext;
use crate::store::Endpoint;

/// Executes work items against one source and destination.
#[derive(Debug, Clone)]
pub struct Worker {
    src: Endpoint,
    dst: Endpoint,
    config: Arc<SyncConfig>,
    ctx: RunContext,
    copier: Copier,
    verifier: Verifier,
}

impl Worker {
    pub fn new(config: Arc<SyncConfig>, src: Endpoint, dst: Endpoint, ctx: RunContext) -> Self {
        let copier = Copier::new(src.clone(), dst.clone(), ctx.clone(), &config);
        let verifier = Verifier::new(
            src.clone(),
            dst.clone(),
            ctx.clone(),
            config.block_size,
            config.retry_backoff,
        );
        Self {
            src,
            dst,
            config,
            ctx,
            copier,
            verifier,
        }
    }

    /// Execute one item; failures are counted, never returned.
    pub async fn handle(&self, item: WorkItem) {
        let start = std::time::Instant::now();
        if self.config.dry {
            tracing::info!("would {} {} ({})", item.action, item.entry.key, bytesize::ByteSize(item.entry.size));
        } else {
            match item.action {
                Action::DeleteSrc => self.delete(&self.src, &item.entry.key).await,
                Action::DeleteDst => self.delete(&self.dst, &item.entry.key).await,
                Action::CopyPerms => self.update_perms(&item.entry).await,
                Action::VerifyChecksum => self.verify(&item).await,
                Action::Copy => self.copy(&item.entry).await,
            }
        }
        self.ctx.stats.handled.inc();
        tracing::debug!("{} {} took {:?}", item.action, item.entry.key, start.elapsed());
    }

    async fn delete(&self, store: &Endpoint, key: &str) {
        let backoff = Backoff::Quadratic(self.config.retry_backoff);
        match retry::retry(&format!("delete {key}"), retry::ATTEMPTS, backoff, |_| store.delete(key)).await {
            Ok(()) => {
                self.ctx.stats.deleted.inc();
                tracing::debug!("deleted {key} from {store}");
            }
            Err(err) => {
                self.ctx.stats.failed.inc();
                tracing::error!("failed to delete {key} from {store}: {err}");
            }
        }
    }

    /// Counts the entry as copied when there was metadata to apply, skipped otherwise.
    async fn update_perms(&self, entry: &ObjectEntry) {
        if self.copy_perms(entry).await {
            self.ctx.stats.copied.inc();
        } else {
            self.ctx.stats.skipped.inc();
        }
    }

    /// `false` when the entry carries no file metadata.
    async fn copy_perms(&self, entry: &ObjectEntry) -> bool {
        let Some(meta) = &entry.file else {
            return false;
        };
        if let Err(err) = self.dst.chmod(&entry.key, meta.mode).await {
            tracing::warn!("chmod {} to {:o}: {err}", entry.key, meta.mode);
        }
        if let Err(err) = self.dst.chown(&entry.key, &meta.owner, &meta.group).await {
            tracing::warn!("chown {} to {}:{}: {err}", entry.key, meta.owner, meta.group);
        }
        true
    }

    async fn verify(&self, item: &WorkItem) {
        let entry = &item.entry;
        match self.verifier.verify(&entry.key, entry.size).await {
            Ok(true) if self.config.delete_src => self.delete(&self.src, &entry.key).await,
            Ok(true) if self.config.perms && entry.meta_differs(item.dst_meta.as_ref()) => {
                self.update_perms(entry).await;
            }
            Ok(true) => self.ctx.stats.skipped.inc(),
            Ok(false) => self.copy(entry).await,
            Err(err) => {
                self.ctx.stats.failed.inc();
                tracing::error!("{err}");
            }
        }
    }

    async fn copy(&self, entry: &ObjectEntry) {
        match self.copier.copy(entry).await {
            Ok(CopyOutcome::Copied) => {}
            Ok(CopyOutcome::SourceVanished) => {
                self.ctx.stats.skipped.inc();
                return;
            }
            Err(err) => {
                self.ctx.stats.failed.inc();
                tracing::error!("{err}");
                return;
            }
        }
        if self.config.check_new && !entry.is_dir {
            match self.verifier.verify(&entry.key, entry.size).await {
                Ok(true) => {}
                Ok(false) => {
                    self.ctx.stats.failed.inc();
                    tracing::error!("{}: copy does not match the source", entry.key);
                    return;
                }
                Err(err) => {
                    self.ctx.stats.failed.inc();
                    tracing::error!("{err}");
                    return;
                }
            }
        }
        let caps = self.dst.caps();
        if caps.mtime {
            if let Err(err) = self.dst.chtimes(&entry.key, entry.mtime).await {
                tracing::warn!("update mtime of {}: {err}", entry.key);
            }
        }
        if self.config.perms {
            self.copy_perms(entry).await;
        }
        if caps.storage_class && !entry.storage_class.is_empty() {
            if let Err(err) = self.dst.set_storage_class(&entry.key, &entry.storage_class).await {
                tracing::warn!("set storage class of {} to {}: {err}", entry.key, entry.storage_class);
            }
        }
        self.ctx.stats.copied.inc();
        tracing::debug!("copied {} ({})", entry.key, bytesize::ByteSize(entry.size));
    }
}

/// Run `threads` workers until `tasks` is closed and drained.
pub async fn run_workers(worker: Worker, threads: usize, tasks: async_channel::Receiver<WorkItem>) {
    let mut join_set = tokio::task::JoinSet::new();
    for _ in 0..threads.max(1) {
        let worker = worker.clone();
        let tasks = tasks.clone();
        join_set.spawn(async move {
            while let Ok(item) = tasks.recv().await {
                worker.handle(item).await;
            }
        });
    }
    drop(tasks);
    while let Some(res) = join_set.join_next().await {
        if let Err(err) = res {
            tracing::error!("worker task failed: {err}");
        }
    }
}
