//! Merge-diff of the source and destination listings into work items.
//!
//! Both listings come sorted, so a single pass over the two streams classifies every key: keys
//! only in the source are copied, keys only in the destination are deleted when asked to, and
//! keys on both sides are compared by [`classify`]. Items are sent to a bounded queue, so a
//! slow worker pool throttles the listing.

use crate::config::SyncConfig;
use crate::listing::{ListingError, SortedLister};
use crate::object::{Action, ObjectEntry, WorkItem};
use crate::stats::Stats;
use crate::store::Endpoint;

#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error(transparent)]
    Listing(#[from] ListingError),
    #[error("task queue closed before all keys were classified")]
    QueueClosed,
}

/// Decide what to do with a key present on both sides, `None` meaning skip.
pub fn classify(config: &SyncConfig, src: &ObjectEntry, dst: &ObjectEntry) -> Option<Action> {
    let size_differs = !src.is_dir && src.size != dst.size;
    if config.force_update
        || (config.update && src.mtime > dst.mtime)
        || (!config.update && size_differs)
    {
        return Some(Action::Copy);
    }
    if config.update && src.mtime < dst.mtime {
        return None;
    }
    if config.check_all && !src.is_dir {
        return Some(Action::VerifyChecksum);
    }
    if config.delete_src && !src.is_dir {
        return Some(Action::DeleteSrc);
    }
    if config.perms && src.meta_differs(dst.file.as_ref()) {
        return Some(Action::CopyPerms);
    }
    None
}

/// A listing with directories and filtered keys removed.
struct Keys<'a> {
    lister: SortedLister,
    config: &'a SyncConfig,
}

impl<'a> Keys<'a> {
    fn new(endpoint: Endpoint, config: &'a SyncConfig) -> Self {
        Self {
            lister: SortedLister::start(endpoint, "", &config.start, &config.end),
            config,
        }
    }

    async fn next(&mut self) -> Result<Option<ObjectEntry>, ListingError> {
        while let Some(item) = self.lister.next().await {
            let entry = item?;
            if entry.is_dir && !self.config.dirs {
                tracing::trace!("ignore directory {}", entry.key);
                continue;
            }
            let verdict = self.config.filters.should_include(&entry.key);
            if !verdict.is_included() {
                tracing::debug!("{}: {:?}", entry.key, verdict);
                continue;
            }
            return Ok(Some(entry));
        }
        Ok(None)
    }
}

struct Producer<'a> {
    config: &'a SyncConfig,
    stats: &'a Stats,
    tasks: async_channel::Sender<WorkItem>,
    /// Destination-only directories, deleted after everything below them.
    ///
    /// Held until both listings are exhausted, so memory grows with the number of directories
    /// being removed (not with the number of objects). Emitting a directory as soon as the
    /// merge moves past its prefix would queue it right behind its children, and concurrent
    /// workers would then try to remove it while it is still populated.
    doomed_dirs: Vec<ObjectEntry>,
}

impl Producer<'_> {
    async fn emit(&self, item: WorkItem) -> Result<(), DiffError> {
        self.stats.total.inc();
        tracing::trace!("{}: {}", item.action, item.entry.key);
        self.tasks.send(item).await.map_err(|_| DiffError::QueueClosed)
    }

    fn skip(&self, entry: &ObjectEntry) {
        tracing::trace!("skip {}", entry.key);
        self.stats.total.inc();
        self.stats.skipped.inc();
        self.stats.handled.inc();
    }

    async fn source_only(&self, entry: ObjectEntry) -> Result<(), DiffError> {
        self.emit(WorkItem::new(Action::Copy, entry)).await
    }

    async fn destination_only(&mut self, entry: ObjectEntry) -> Result<(), DiffError> {
        if !self.config.delete_dst {
            return Ok(());
        }
        if entry.is_dir {
            self.doomed_dirs.push(entry);
            return Ok(());
        }
        self.emit(WorkItem::new(Action::DeleteDst, entry)).await
    }

    async fn both(&self, src: ObjectEntry, dst: ObjectEntry) -> Result<(), DiffError> {
        match classify(self.config, &src, &dst) {
            Some(action) => {
                let item = WorkItem::new(action, src).with_dst_meta(dst.file);
                self.emit(item).await
            }
            None => {
                self.skip(&src);
                Ok(())
            }
        }
    }
}

/// Classify every key in the configured range and send the work items to `tasks`.
///
/// The queue is closed when this returns. A listing failure stops the classification; items
/// sent before it are still processed by the workers.
#[tracing::instrument(skip_all, fields(src = %src, dst = %dst))]
pub async fn produce(
    config: &SyncConfig,
    src: Endpoint,
    dst: Endpoint,
    stats: &Stats,
    tasks: async_channel::Sender<WorkItem>,
) -> Result<(), DiffError> {
    tracing::info!("syncing from {src} to {dst}");
    if !config.start.is_empty() {
        tracing::info!("first key: {:?}", config.start);
    }
    if !config.end.is_empty() {
        tracing::info!("last key: {:?}", config.end);
    }
    let mut src_keys = Keys::new(src, config);
    let mut dst_keys = Keys::new(dst, config);
    let mut producer = Producer {
        config,
        stats,
        tasks,
        doomed_dirs: vec![],
    };
    let mut pending = dst_keys.next().await?;
    while let Some(entry) = src_keys.next().await? {
        while let Some(dst_entry) = pending.take_if(|dst_entry| dst_entry.key < entry.key) {
            producer.destination_only(dst_entry).await?;
            pending = dst_keys.next().await?;
        }
        match pending.take_if(|dst_entry| dst_entry.key == entry.key) {
            Some(dst_entry) => {
                producer.both(entry, dst_entry).await?;
                pending = dst_keys.next().await?;
            }
            None => producer.source_only(entry).await?,
        }
    }
    if config.delete_dst {
        while let Some(dst_entry) = pending.take() {
            producer.destination_only(dst_entry).await?;
            pending = dst_keys.next().await?;
        }
        // children sort after their parent, so reversed order empties directories first
        for dir in std::mem::take(&mut producer.doomed_dirs).into_iter().rev() {
            producer.emit(WorkItem::new(Action::DeleteDst, dir)).await?;
        }
    }
    tracing::debug!("classified {} keys", stats.total.get());
    Ok(())
}
