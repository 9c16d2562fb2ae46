//! Configuration types for the sync policy, runtime and output

use std::time::Duration;

use crate::filter::FilterSettings;

/// Objects at or above this size are copied with multipart upload.
pub const DEFAULT_LARGE_OBJECT_THRESHOLD: u64 = 10 << 20;

/// Block size of the parallel downloader and chunk size of checksum comparisons.
pub const DEFAULT_BLOCK_SIZE: u64 = 5 << 20;

pub const DEFAULT_THREADS: usize = 10;

/// Immutable policy of one run, built once before the differ starts.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// First key to sync (inclusive), empty means from the beginning
    pub start: String,
    /// Last key to sync (inclusive), empty means to the end
    pub end: String,
    /// Number of concurrent workers draining the task queue
    pub threads: usize,
    /// Size of the global gate bounding parts, chunks and range fetches
    pub concurrency: usize,
    /// Copy when the source is newer
    pub update: bool,
    /// Always copy keys present on both sides
    pub force_update: bool,
    /// Propagate owner, group and mode
    pub perms: bool,
    /// Sync directory entries
    pub dirs: bool,
    pub delete_src: bool,
    pub delete_dst: bool,
    /// Verify every key present on both sides
    pub check_all: bool,
    /// Verify objects after copying them
    pub check_new: bool,
    /// Log actions without performing them
    pub dry: bool,
    pub filters: FilterSettings,
    /// Bytes per second before overhead, `None` for unlimited
    pub bandwidth: Option<u64>,
    pub large_object_threshold: u64,
    pub block_size: u64,
    /// Base of the quadratic backoff between retried transfers
    pub retry_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            start: String::new(),
            end: String::new(),
            threads: DEFAULT_THREADS,
            concurrency: DEFAULT_THREADS,
            update: false,
            force_update: false,
            perms: false,
            dirs: false,
            delete_src: false,
            delete_dst: false,
            check_all: false,
            check_new: false,
            dry: false,
            filters: FilterSettings::default(),
            bandwidth: None,
            large_object_threshold: DEFAULT_LARGE_OBJECT_THRESHOLD,
            block_size: DEFAULT_BLOCK_SIZE,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl SyncConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.delete_src && self.delete_dst {
            return Err("--delete-src and --delete-dst cannot be used together".to_string());
        }
        if !self.start.is_empty() && !self.end.is_empty() && self.start > self.end {
            return Err(format!(
                "--start {:?} is after --end {:?}",
                self.start, self.end
            ));
        }
        if self.threads == 0 {
            return Err("--threads must be at least 1".to_string());
        }
        if self.block_size == 0 {
            return Err("block size must be positive".to_string());
        }
        Ok(())
    }
}

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_conflicting_deletes() {
        let config = SyncConfig {
            delete_src: true,
            delete_dst: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_range() {
        let config = SyncConfig {
            start: "b".to_string(),
            end: "a".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = SyncConfig {
            start: "a".to_string(),
            end: "b".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
