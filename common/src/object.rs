//! Entries produced by listings and the work items the differ hands to workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// POSIX-like metadata exposed by stores with the permissions capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub owner: String,
    pub group: String,
    pub mode: u32,
}

/// One key of a store listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class: String,
    /// Present only for stores that expose POSIX-like metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
}

impl ObjectEntry {
    pub fn new(key: impl Into<String>, size: u64, mtime: DateTime<Utc>) -> Self {
        let key = key.into();
        Self {
            is_dir: key.ends_with('/'),
            key,
            size,
            mtime,
            storage_class: String::new(),
            file: None,
        }
    }

    pub fn with_file_meta(mut self, meta: FileMeta) -> Self {
        self.file = Some(meta);
        self
    }

    pub fn with_storage_class(mut self, class: impl Into<String>) -> Self {
        self.storage_class = class.into();
        self
    }

    /// True when both sides carry metadata and it differs.
    pub fn meta_differs(&self, other: Option<&FileMeta>) -> bool {
        match (&self.file, other) {
            (Some(ours), Some(theirs)) => ours != theirs,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Copy,
    DeleteSrc,
    DeleteDst,
    CopyPerms,
    VerifyChecksum,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Copy => "copy",
            Action::DeleteSrc => "delete source",
            Action::DeleteDst => "delete destination",
            Action::CopyPerms => "copy permissions",
            Action::VerifyChecksum => "verify checksum",
        };
        write!(f, "{name}")
    }
}

/// A classified key waiting in the task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub action: Action,
    pub entry: ObjectEntry,
    /// Destination metadata when the differ saw it, used to decide on permission propagation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_meta: Option<FileMeta>,
}

impl WorkItem {
    pub fn new(action: Action, entry: ObjectEntry) -> Self {
        Self {
            action,
            entry,
            dst_meta: None,
        }
    }

    pub fn with_dst_meta(mut self, meta: Option<FileMeta>) -> Self {
        self.dst_meta = meta;
        self
    }
}
