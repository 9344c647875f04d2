//! Configuration for the file cache.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`FileCache`](crate::FileCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the cached segment files.
    pub cache_dir: PathBuf,

    /// Byte quota for all cached segments together.
    /// Default: 10 GiB.
    pub max_size: u64,

    /// Maximum number of segments in the index.
    /// Default: 1,048,576.
    pub max_elements: usize,

    /// Upper bound on the size of a single segment created for a miss.
    /// Requests larger than this are split into multiple segments.
    /// Default: 100 MiB.
    pub max_segment_size: u64,

    /// How long a waiter blocks on a segment being downloaded by another
    /// client before re-reading its state.
    /// Default: 60 seconds.
    pub wait_timeout: Duration,

    /// Synchronization mode for segment writes.
    pub sync_mode: SyncMode,

    /// Whether to re-index fully downloaded segments found in `cache_dir`
    /// on startup. Default: true.
    pub recover_on_startup: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/cache/filecache"),
            max_size: 10 * 1024 * 1024 * 1024,
            max_elements: 1024 * 1024,
            max_segment_size: 100 * 1024 * 1024,
            wait_timeout: Duration::from_secs(60),
            sync_mode: SyncMode::default(),
            recover_on_startup: true,
        }
    }
}

impl CacheConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache directory.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set the byte quota.
    pub fn max_size(mut self, size: u64) -> Self {
        self.max_size = size;
        self
    }

    /// Set the maximum number of indexed segments.
    pub fn max_elements(mut self, elements: usize) -> Self {
        self.max_elements = elements;
        self
    }

    /// Set the maximum size of a single segment.
    pub fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Set the waiter timeout.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set the synchronization mode.
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Set whether to recover existing segments on startup.
    pub fn recover_on_startup(mut self, recover: bool) -> Self {
        self.recover_on_startup = recover;
        self
    }
}

/// Synchronization mode for segment writes.
///
/// Controls how aggressively downloaded bytes are flushed to disk, trading
/// off durability against write performance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// fsync after every append. Strongest durability, lowest throughput.
    Sync,

    /// fsync once when the download finalizes. Default mode.
    #[default]
    Async,

    /// No explicit fsync; the OS flushes when it pleases. Suitable when
    /// losing cached bytes on crash is acceptable.
    None,
}

impl SyncMode {
    /// Check if this mode requires fsync after each append.
    pub fn is_sync(&self) -> bool {
        matches!(self, SyncMode::Sync)
    }

    /// Check if this mode syncs only at finalization.
    pub fn is_async(&self) -> bool {
        matches!(self, SyncMode::Async)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.max_size, 10 * 1024 * 1024 * 1024);
        assert_eq!(config.max_elements, 1024 * 1024);
        assert_eq!(config.max_segment_size, 100 * 1024 * 1024);
        assert_eq!(config.wait_timeout, Duration::from_secs(60));
        assert_eq!(config.sync_mode, SyncMode::Async);
        assert!(config.recover_on_startup);
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new()
            .cache_dir("/tmp/filecache-test")
            .max_size(1024 * 1024)
            .max_elements(64)
            .max_segment_size(128 * 1024)
            .wait_timeout(Duration::from_secs(5))
            .sync_mode(SyncMode::Sync)
            .recover_on_startup(false);

        assert_eq!(config.cache_dir, PathBuf::from("/tmp/filecache-test"));
        assert_eq!(config.max_size, 1024 * 1024);
        assert_eq!(config.max_elements, 64);
        assert_eq!(config.max_segment_size, 128 * 1024);
        assert_eq!(config.wait_timeout, Duration::from_secs(5));
        assert_eq!(config.sync_mode, SyncMode::Sync);
        assert!(!config.recover_on_startup);
    }

    #[test]
    fn test_sync_mode_checks() {
        assert!(SyncMode::Sync.is_sync());
        assert!(!SyncMode::Sync.is_async());

        assert!(!SyncMode::Async.is_sync());
        assert!(SyncMode::Async.is_async());

        assert!(!SyncMode::None.is_sync());
        assert!(!SyncMode::None.is_async());
    }
}
