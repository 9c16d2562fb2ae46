//! Local filesystem store rooted at a directory.
//!
//! Keys are `/`-separated paths relative to the root; directories are listed as `name/`.
//! The listing walks the tree depth-first and sorts the children of every directory by key,
//! which is enough for the whole stream to come out sorted: all keys under `name/` fall between
//! `name/` and the next sibling. Symbolic links to files are listed as files; links to
//! directories are skipped.

use std::collections::HashMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_recursion::async_recursion;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{ByteReader, Capabilities, EntryStream, ObjectStore, Result, StoreError};
use crate::object::{FileMeta, ObjectEntry};

const LIST_CHANNEL_SIZE: usize = 1000;

/// Caches uid/gid to name lookups, listings resolve the same few ids over and over.
#[derive(Debug, Default)]
struct Names {
    users: std::sync::Mutex<HashMap<u32, String>>,
    groups: std::sync::Mutex<HashMap<u32, String>>,
}

impl Names {
    fn user(&self, uid: u32) -> String {
        let mut users = self
            .users
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        users
            .entry(uid)
            .or_insert_with(|| {
                nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
                    .ok()
                    .flatten()
                    .map(|user| user.name)
                    .unwrap_or_else(|| uid.to_string())
            })
            .clone()
    }

    fn group(&self, gid: u32) -> String {
        let mut groups = self
            .groups
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        groups
            .entry(gid)
            .or_insert_with(|| {
                nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
                    .ok()
                    .flatten()
                    .map(|group| group.name)
                    .unwrap_or_else(|| gid.to_string())
            })
            .clone()
    }
}

fn resolve_uid(owner: &str) -> Result<u32> {
    if let Ok(Some(user)) = nix::unistd::User::from_name(owner) {
        return Ok(user.uid.as_raw());
    }
    owner
        .parse()
        .map_err(|_| StoreError::Other(format!("unknown user {owner:?}")))
}

fn resolve_gid(group: &str) -> Result<u32> {
    if let Ok(Some(found)) = nix::unistd::Group::from_name(group) {
        return Ok(found.gid.as_raw());
    }
    group
        .parse()
        .map_err(|_| StoreError::Other(format!("unknown group {group:?}")))
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    names: Arc<Names>,
}

impl FileStore {
    /// The root is created on first write if missing.
    pub fn new(root: &Path) -> anyhow::Result<Self> {
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };
        Ok(Self {
            root,
            names: Default::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_end_matches('/'))
    }

    fn entry(&self, key: String, metadata: &std::fs::Metadata) -> ObjectEntry {
        let mtime = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        let size = if metadata.is_dir() { 0 } else { metadata.len() };
        let mut entry = ObjectEntry::new(key, size, mtime).with_file_meta(FileMeta {
            owner: self.names.user(metadata.uid()),
            group: self.names.group(metadata.gid()),
            mode: metadata.mode() & 0o7777,
        });
        entry.is_dir = metadata.is_dir();
        entry
    }

    #[async_recursion]
    async fn walk(
        &self,
        dir: PathBuf,
        rel: String,
        prefix: &str,
        marker: &str,
        tx: &async_channel::Sender<Result<ObjectEntry>>,
    ) -> Result<bool> {
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && rel.is_empty() => {
                return Ok(true);
            }
            Err(err) => return Err(StoreError::io(dir.display().to_string(), err)),
        };
        let mut children = vec![];
        while let Some(child) = read_dir
            .next_entry()
            .await
            .map_err(|err| StoreError::io(dir.display().to_string(), err))?
        {
            let Some(name) = child.file_name().to_str().map(str::to_string) else {
                tracing::warn!("skipping non-utf8 name in {:?}", dir);
                continue;
            };
            let metadata = match tokio::fs::symlink_metadata(child.path()).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!("skipping {:?}: {}", child.path(), err);
                    continue;
                }
            };
            // links to files are listed with their target's content, links to directories are
            // never descended into
            let metadata = if metadata.is_symlink() {
                match tokio::fs::metadata(child.path()).await {
                    Ok(target) if target.is_file() => target,
                    Ok(_) => {
                        tracing::debug!("skipping link to directory {:?}", child.path());
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!("skipping dangling link {:?}: {}", child.path(), err);
                        continue;
                    }
                }
            } else {
                metadata
            };
            let key = if metadata.is_dir() {
                format!("{rel}{name}/")
            } else if metadata.is_file() {
                format!("{rel}{name}")
            } else {
                tracing::debug!("skipping special file {:?}", child.path());
                continue;
            };
            children.push((key, child.path(), metadata));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, path, metadata) in children {
            let compatible = key.starts_with(prefix) || prefix.starts_with(key.as_str());
            if !compatible {
                continue;
            }
            if key.as_str() > marker && key.starts_with(prefix) {
                let entry = self.entry(key.clone(), &metadata);
                if tx.send(Ok(entry)).await.is_err() {
                    // consumer went away
                    return Ok(false);
                }
            }
            // every key below `key` sorts before the marker unless the marker is inside it
            let below_marker = key.as_str() < marker && !marker.starts_with(key.as_str());
            if metadata.is_dir() && !below_marker && !self.walk(path, key, prefix, marker, tx).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    fn describe(&self) -> String {
        format!("file://{}/", self.root.display())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            multipart: false,
            permissions: true,
            mtime: true,
            storage_class: false,
            local_root: Some(self.root.clone()),
        }
    }

    async fn head(&self, key: &str) -> Result<ObjectEntry> {
        let path = self.path(key);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| StoreError::io(key, err))?;
        if metadata.is_dir() != key.ends_with('/') && !key.is_empty() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(self.entry(key.to_string(), &metadata))
    }

    async fn get(&self, key: &str, offset: u64, limit: Option<u64>) -> Result<ByteReader> {
        let mut file = tokio::fs::File::open(self.path(key))
            .await
            .map_err(|err| StoreError::io(key, err))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|err| StoreError::io(key, err))?;
        }
        match limit {
            Some(limit) if limit > 0 => Ok(Box::new(file.take(limit))),
            _ => Ok(Box::new(file)),
        }
    }

    async fn put(&self, key: &str, mut body: ByteReader) -> Result<()> {
        let path = self.path(key);
        if key.ends_with('/') {
            return tokio::fs::create_dir_all(&path)
                .await
                .map_err(|err| StoreError::io(key, err));
        }
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Other(format!("{key}: no parent directory")))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| StoreError::io(parent.display().to_string(), err))?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("object");
        let tmp = parent.join(format!(".{name}.tmp{}", rand::random::<u32>()));
        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            tokio::io::copy(&mut body, &mut file).await?;
            file.flush().await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::io(key, err));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        let res = if key.ends_with('/') {
            tokio::fs::remove_dir(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match res {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                Err(StoreError::io(key, err))
            }
            _ => Ok(()),
        }
    }

    async fn list_all(&self, prefix: &str, marker: &str) -> Result<EntryStream> {
        let (tx, rx) = async_channel::bounded(LIST_CHANNEL_SIZE);
        let store = self.clone();
        let prefix = prefix.to_string();
        let marker = marker.to_string();
        tokio::spawn(async move {
            let root = store.root.clone();
            if let Err(err) = store.walk(root, String::new(), &prefix, &marker, &tx).await {
                let _ = tx.send(Err(err)).await;
            }
        });
        Ok(Box::pin(rx))
    }

    async fn chmod(&self, key: &str, mode: u32) -> Result<()> {
        tokio::fs::set_permissions(self.path(key), std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|err| StoreError::io(key, err))
    }

    async fn chown(&self, key: &str, owner: &str, group: &str) -> Result<()> {
        let path = self.path(key);
        let (owner, group) = (owner.to_string(), group.to_string());
        let context = key.to_string();
        tokio::task::spawn_blocking(move || {
            let uid = resolve_uid(&owner)?;
            let gid = resolve_gid(&group)?;
            std::os::unix::fs::chown(&path, Some(uid), Some(gid))
                .map_err(|err| StoreError::io(context, err))
        })
        .await
        .map_err(|err| StoreError::Other(format!("{key}: chown task failed: {err}")))?
    }

    async fn chtimes(&self, key: &str, mtime: DateTime<Utc>) -> Result<()> {
        let path = self.path(key);
        let context = key.to_string();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path).map_err(|err| StoreError::io(&context, err))?;
            file.set_modified(mtime.into())
                .map_err(|err| StoreError::io(&context, err))
        })
        .await
        .map_err(|err| StoreError::Other(format!("{key}: chtimes task failed: {err}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(store: &FileStore, prefix: &str, marker: &str) -> Result<Vec<String>> {
        let mut stream = store.list_all(prefix, marker).await?;
        let mut keys = vec![];
        while let Some(entry) = stream.next().await {
            keys.push(entry?.key);
        }
        Ok(keys)
    }

    fn layout() -> std::io::Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("a/b"))?;
        std::fs::write(dir.path().join("a-b"), "1")?;
        std::fs::write(dir.path().join("a/x"), "22")?;
        std::fs::write(dir.path().join("a/b/y"), "333")?;
        std::fs::write(dir.path().join("a0"), "4444")?;
        Ok(dir)
    }

    #[tokio::test]
    async fn listing_is_globally_sorted() -> anyhow::Result<()> {
        let dir = layout()?;
        let store = FileStore::new(dir.path())?;
        let keys = collect(&store, "", "").await?;
        assert_eq!(keys, ["a-b", "a/", "a/b/", "a/b/y", "a/x", "a0"]);
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        Ok(())
    }

    #[tokio::test]
    async fn listing_resumes_after_marker() -> anyhow::Result<()> {
        let dir = layout()?;
        let store = FileStore::new(dir.path())?;
        assert_eq!(collect(&store, "", "a/b/y").await?, ["a/x", "a0"]);
        assert_eq!(collect(&store, "a/", "").await?, ["a/", "a/b/", "a/b/y", "a/x"]);
        Ok(())
    }

    #[tokio::test]
    async fn listing_does_not_follow_directory_links() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("a"))?;
        std::fs::write(dir.path().join("a/f"), "data")?;
        std::os::unix::fs::symlink("..", dir.path().join("a/up"))?;
        std::os::unix::fs::symlink(dir.path().join("a"), dir.path().join("b"))?;
        std::os::unix::fs::symlink("f", dir.path().join("a/lf"))?;
        std::os::unix::fs::symlink("missing", dir.path().join("a/dangling"))?;
        let store = FileStore::new(dir.path())?;
        assert_eq!(collect(&store, "", "").await?, ["a/", "a/f", "a/lf"]);
        assert_eq!(store.head("a/lf").await?.size, 4);
        Ok(())
    }

    #[tokio::test]
    async fn missing_root_lists_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(&dir.path().join("nope"))?;
        assert!(collect(&store, "", "").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn put_get_delete() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(dir.path())?;
        store
            .put("d/e/f", super::super::reader_from(bytes::Bytes::from_static(b"hello")))
            .await?;
        let head = store.head("d/e/f").await?;
        assert_eq!(head.size, 5);
        assert!(head.file.is_some());
        let data = super::super::read_all(store.get("d/e/f", 1, Some(3)).await?, "d/e/f", 0).await?;
        assert_eq!(&data[..], b"ell");
        store.delete("d/e/f").await?;
        store.delete("d/e/f").await?;
        assert!(store.head("d/e/f").await.err().is_some_and(|e| e.is_not_found()));
        Ok(())
    }

    #[tokio::test]
    async fn chmod_and_chtimes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("f"), "x")?;
        let store = FileStore::new(dir.path())?;
        store.chmod("f", 0o600).await?;
        let mtime = DateTime::<Utc>::from_timestamp(1_600_000_000, 0).unwrap_or_default();
        store.chtimes("f", mtime).await?;
        let entry = store.head("f").await?;
        assert_eq!(entry.mtime, mtime);
        assert_eq!(entry.file.map(|meta| meta.mode), Some(0o600));
        Ok(())
    }
}
