//! The cache manager: segment index, byte quota, and LRU eviction.
//!
//! [`FileCache`] owns the canonical reference to every segment through its
//! index and mediates all global concerns: charging reservations against
//! the byte quota (evicting unheld segments to make room), detecting the
//! last holder of a segment, deleting abandoned segments, shrinking
//! partially downloaded segments, and mapping `(key, offset)` pairs to
//! backing files on disk.
//!
//! # Directory layout
//!
//! ```text
//! <cache_dir>/
//!   <key as 16-digit hex>/
//!     <offset>          segment bytes, appended in order
//! ```
//!
//! On startup (unless disabled) every non-empty file found under this
//! layout is re-indexed as a fully downloaded segment.
//!
//! # Locking
//!
//! The index is guarded by a single mutex that nests *inside* any segment
//! mutex: segments lock themselves first and the index second. Methods
//! taking a [`CacheIndex`] reference require the caller to hold that lock.
//! While holding the index lock the cache never locks a segment another
//! client could be holding; the only segments it touches are unheld ones
//! (eviction victims), which no other thread can have in flight.

use crate::caller::{CallerIdSource, ClientId, ScopedCallerId};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::holder::FileSegmentsHolder;
use crate::key::CacheKey;
use crate::metrics::CacheMetrics;
use crate::segment::FileSegment;
use crate::state::DownloadState;

use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info, warn};

/// One indexed segment plus its quota bookkeeping.
struct CacheCell {
    /// The canonical segment reference; holders clone it.
    segment: Arc<FileSegment>,
    /// Bytes charged against the quota for this segment (its reserved
    /// prefix).
    recorded: u64,
}

/// Least-recently-used queue of `(key, offset)` entries.
///
/// Touched on every cache hit; eviction walks it front to back.
#[derive(Default)]
struct LruQueue {
    entries: VecDeque<(CacheKey, u64)>,
}

impl LruQueue {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, key: CacheKey, offset: u64) {
        self.entries.push_back((key, offset));
    }

    /// Move an entry to the most-recently-used position.
    fn touch(&mut self, key: CacheKey, offset: u64) {
        if let Some(position) = self
            .entries
            .iter()
            .position(|&entry| entry == (key, offset))
        {
            self.entries.remove(position);
            self.entries.push_back((key, offset));
        }
    }

    fn remove(&mut self, key: CacheKey, offset: u64) {
        if let Some(position) = self
            .entries
            .iter()
            .position(|&entry| entry == (key, offset))
        {
            self.entries.remove(position);
        }
    }

    fn iter(&self) -> impl Iterator<Item = &(CacheKey, u64)> {
        self.entries.iter()
    }
}

/// The segment index, guarded by the cache mutex.
#[derive(Default)]
pub(crate) struct CacheIndex {
    /// Per-key segments ordered by offset.
    files: HashMap<CacheKey, BTreeMap<u64, CacheCell>, ahash::RandomState>,
    /// Eviction order.
    queue: LruQueue,
    /// Sum of all `recorded` cell sizes.
    used_bytes: u64,
}

impl CacheIndex {
    fn cell(&self, key: CacheKey, offset: u64) -> Option<&CacheCell> {
        self.files.get(&key).and_then(|file| file.get(&offset))
    }

    fn cell_mut(&mut self, key: CacheKey, offset: u64) -> Option<&mut CacheCell> {
        self.files.get_mut(&key).and_then(|file| file.get_mut(&offset))
    }
}

/// Statistics from re-indexing an existing cache directory on startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Segments re-indexed as fully downloaded.
    pub segments_recovered: u64,
    /// Bytes covered by the recovered segments.
    pub bytes_recovered: u64,
    /// Files deleted because they were empty, unparseable, or over quota.
    pub files_discarded: u64,
}

/// Shared on-disk cache of byte-range file segments.
///
/// Clients call [`get_or_set`](Self::get_or_set) to obtain a
/// [`FileSegmentsHolder`] covering their requested range, then drive each
/// segment through the coordination protocol described in
/// [`FileSegment`](crate::FileSegment).
pub struct FileCache {
    config: CacheConfig,
    index: Mutex<CacheIndex>,
    metrics: CacheMetrics,
    caller_source: Arc<dyn CallerIdSource>,
    recovery: OnceLock<RecoveryStats>,
    weak_self: Weak<FileCache>,
}

impl FileCache {
    /// Create a cache with the default caller-id source (the scoped
    /// thread-local installed by [`CallerScope`](crate::CallerScope)).
    pub fn new(config: CacheConfig) -> CacheResult<Arc<Self>> {
        Self::with_caller_source(config, Arc::new(ScopedCallerId))
    }

    /// Create a cache with a custom caller-id source.
    pub fn with_caller_source(
        config: CacheConfig,
        caller_source: Arc<dyn CallerIdSource>,
    ) -> CacheResult<Arc<Self>> {
        std::fs::create_dir_all(&config.cache_dir)?;

        let cache = Arc::new_cyclic(|weak| Self {
            config,
            index: Mutex::new(CacheIndex::default()),
            metrics: CacheMetrics::default(),
            caller_source,
            recovery: OnceLock::new(),
            weak_self: weak.clone(),
        });

        if cache.config.recover_on_startup {
            let stats = cache.recover()?;
            if stats.segments_recovered > 0 || stats.files_discarded > 0 {
                info!(
                    segments = stats.segments_recovered,
                    bytes = stats.bytes_recovered,
                    discarded = stats.files_discarded,
                    "recovered cache directory"
                );
            }
            let _ = cache.recovery.set(stats);
        }

        Ok(cache)
    }

    /// The configuration this cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Counters describing cache activity.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Statistics from startup recovery, if it ran.
    pub fn recovery_stats(&self) -> Option<RecoveryStats> {
        self.recovery.get().copied()
    }

    /// Bytes currently charged against the quota.
    pub fn used_bytes(&self) -> u64 {
        self.index.lock().used_bytes
    }

    /// Number of indexed segments.
    pub fn segment_count(&self) -> usize {
        self.index.lock().queue.len()
    }

    /// The id of the current caller, resolved through the injected source.
    pub fn caller_id(&self) -> Option<ClientId> {
        self.caller_source.caller_id()
    }

    /// Filesystem path of the segment at `(key, offset)`.
    ///
    /// A pure function of the configuration; takes no locks.
    pub fn segment_path(&self, key: CacheKey, offset: u64) -> PathBuf {
        self.config
            .cache_dir
            .join(key.to_string())
            .join(offset.to_string())
    }

    /// Get segments covering the closed range
    /// `[offset, offset + size - 1]`, creating empty ones for the gaps.
    ///
    /// Returned segments are in ascending offset order and together cover
    /// at least the requested range (an existing segment may extend past
    /// either end). Newly created segments are capped at
    /// `max_segment_size`. Existing segments count as hits and are
    /// LRU-touched; created ones count as misses.
    pub fn get_or_set(
        &self,
        key: CacheKey,
        offset: u64,
        size: u64,
    ) -> CacheResult<FileSegmentsHolder> {
        if size == 0 {
            return Err(CacheError::EmptyRange);
        }
        let end = offset + size;

        let mut guard = self.index.lock();
        let index = &mut *guard;

        let mut segments: Vec<Arc<FileSegment>> = Vec::new();
        let mut hits: Vec<u64> = Vec::new();
        let mut gaps: Vec<(u64, u64)> = Vec::new();
        let mut covered = offset;

        let file = index.files.entry(key).or_default();

        // The cell starting at or before `offset` may still reach into the
        // requested range; start the scan there.
        let scan_start = match file.range(..=offset).next_back() {
            Some((&cell_offset, cell)) if cell.segment.range().right >= offset => cell_offset,
            _ => offset,
        };

        for (&cell_offset, cell) in file.range(scan_start..end) {
            let range = cell.segment.range();
            if range.right < offset {
                continue;
            }
            if range.left > covered {
                gaps.push((covered, range.left - 1));
            }
            segments.push(cell.segment.clone());
            hits.push(cell_offset);
            covered = covered.max(range.right + 1);
            if covered >= end {
                break;
            }
        }
        if covered < end {
            gaps.push((covered, end - 1));
        }

        for &hit_offset in &hits {
            index.queue.touch(key, hit_offset);
        }
        self.metrics.add_hits(hits.len() as u64);

        for (gap_left, gap_right) in gaps {
            let mut position = gap_left;
            while position <= gap_right {
                let len = self
                    .config
                    .max_segment_size
                    .min(gap_right - position + 1);
                let segment =
                    self.make_segment(key, position, len, DownloadState::Empty)?;
                segments.push(segment.clone());
                index.files.entry(key).or_default().insert(
                    position,
                    CacheCell {
                        segment,
                        recorded: 0,
                    },
                );
                index.queue.push(key, position);
                self.metrics.record_miss();
                position += len;
            }
        }

        segments.sort_by_key(|segment| segment.offset());
        Ok(FileSegmentsHolder::new(segments))
    }

    fn make_segment(
        &self,
        key: CacheKey,
        offset: u64,
        size: u64,
        state: DownloadState,
    ) -> CacheResult<Arc<FileSegment>> {
        Ok(Arc::new(FileSegment::new(
            self.weak_self.clone(),
            key,
            offset,
            size,
            state,
            self.config.wait_timeout,
            self.config.sync_mode,
        )?))
    }

    /// Lock the index. Callers inside a segment operation must already
    /// hold that segment's mutex (segment before cache, always).
    pub(crate) fn lock_index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock()
    }

    /// Charge `size` further bytes for the segment at `(key, offset)`,
    /// evicting unheld segments if the quota or element cap is exceeded.
    ///
    /// Returns false, leaving the index unchanged, when not enough
    /// evictable space exists.
    pub(crate) fn try_reserve_locked(
        &self,
        index: &mut CacheIndex,
        key: CacheKey,
        offset: u64,
        size: u64,
    ) -> bool {
        if index.cell(key, offset).is_none() {
            warn!(%key, offset, "reservation for a segment that is no longer indexed");
            return false;
        }

        let needed_bytes = (index.used_bytes + size).saturating_sub(self.config.max_size);
        let needed_elements = index.queue.len().saturating_sub(self.config.max_elements);

        if needed_bytes > 0 || needed_elements > 0 {
            let mut victims: Vec<(CacheKey, u64)> = Vec::new();
            let mut freed_bytes = 0u64;

            for &(victim_key, victim_offset) in index.queue.iter() {
                if freed_bytes >= needed_bytes && victims.len() >= needed_elements {
                    break;
                }
                if victim_key == key && victim_offset == offset {
                    continue;
                }
                let Some(cell) = index.cell(victim_key, victim_offset) else {
                    continue;
                };
                // Only the index references an unheld cell, so no thread
                // can be inside one of its segment operations.
                if Arc::strong_count(&cell.segment) > 1 {
                    continue;
                }
                freed_bytes += cell.recorded;
                victims.push((victim_key, victim_offset));
            }

            if freed_bytes < needed_bytes || victims.len() < needed_elements {
                self.metrics.record_reserve_refusal();
                return false;
            }

            for (victim_key, victim_offset) in victims {
                debug!(key = %victim_key, offset = victim_offset, "evicting segment");
                self.metrics.record_eviction();
                self.remove_locked(index, victim_key, victim_offset);
            }
        }

        index.used_bytes += size;
        if let Some(cell) = index.cell_mut(key, offset) {
            cell.recorded += size;
        }
        true
    }

    /// True iff the calling holder is the only one left for the segment at
    /// `(key, offset)`: the index's own reference plus the caller's.
    pub(crate) fn is_last_segment_holder_locked(
        &self,
        index: &CacheIndex,
        key: CacheKey,
        offset: u64,
    ) -> bool {
        match index.cell(key, offset) {
            Some(cell) => Arc::strong_count(&cell.segment) <= 2,
            None => true,
        }
    }

    /// Drop the segment at `(key, offset)` from the index and delete its
    /// backing file.
    pub(crate) fn remove_locked(&self, index: &mut CacheIndex, key: CacheKey, offset: u64) {
        if let Some(file) = index.files.get_mut(&key) {
            if let Some(cell) = file.remove(&offset) {
                index.used_bytes = index.used_bytes.saturating_sub(cell.recorded);
                index.queue.remove(key, offset);
                self.metrics.record_removal();
            }
            if file.is_empty() {
                index.files.remove(&key);
            }
        }

        let path = self.segment_path(key, offset);
        if path.exists() {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), %err, "failed to delete segment file");
            }
            if let Some(parent) = path.parent() {
                // Succeeds only once the key directory is empty.
                let _ = std::fs::remove_dir(parent);
            }
        }
    }

    /// Shrink the indexed segment at `(key, offset)` to its downloaded
    /// prefix, refunding the unreserved tail.
    ///
    /// The indexed cell is replaced by a fresh fully-downloaded segment of
    /// `downloaded` bytes; holders of the old object keep it, unindexed.
    /// Legal only while the caller is the last holder.
    pub(crate) fn reduce_size_locked(
        &self,
        index: &mut CacheIndex,
        key: CacheKey,
        offset: u64,
        downloaded: u64,
    ) {
        debug_assert!(downloaded > 0, "zero-byte segments are removed, not shrunk");

        let Some(cell) = index.cell_mut(key, offset) else {
            return;
        };
        let refund = cell.recorded.saturating_sub(downloaded);

        match self.make_segment(key, offset, downloaded, DownloadState::Downloaded) {
            Ok(segment) => {
                cell.segment = segment;
                cell.recorded = downloaded;
            }
            Err(err) => {
                warn!(%key, offset, %err, "failed to shrink indexed segment");
                return;
            }
        }
        index.used_bytes = index.used_bytes.saturating_sub(refund);

        // The backing file keeps exactly the downloaded prefix.
        let path = self.segment_path(key, offset);
        let truncated = OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_len(downloaded));
        if let Err(err) = truncated {
            warn!(path = %path.display(), %err, "failed to truncate segment file");
        }
    }

    /// Re-index fully downloaded segments left behind by a previous run.
    fn recover(&self) -> CacheResult<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        let mut guard = self.index.lock();
        let index = &mut *guard;

        for key_entry in std::fs::read_dir(&self.config.cache_dir)? {
            let key_entry = key_entry?;
            if !key_entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = key_entry.file_name();
            let Some(key) = dir_name.to_str().and_then(CacheKey::from_hex) else {
                warn!(dir = ?dir_name, "skipping unrecognized cache directory");
                continue;
            };

            for segment_entry in std::fs::read_dir(key_entry.path())? {
                let segment_entry = segment_entry?;
                if !segment_entry.file_type()?.is_file() {
                    continue;
                }
                let file_name = segment_entry.file_name();
                let offset = file_name.to_str().and_then(|name| name.parse::<u64>().ok());
                let len = segment_entry.metadata()?.len();

                let fits = index.used_bytes + len <= self.config.max_size
                    && index.queue.len() < self.config.max_elements;
                match offset {
                    Some(offset) if len > 0 && fits => {
                        let segment =
                            self.make_segment(key, offset, len, DownloadState::Downloaded)?;
                        index.files.entry(key).or_default().insert(
                            offset,
                            CacheCell {
                                segment,
                                recorded: len,
                            },
                        );
                        index.queue.push(key, offset);
                        index.used_bytes += len;
                        stats.segments_recovered += 1;
                        stats.bytes_recovered += len;
                    }
                    _ => {
                        debug!(file = ?file_name, "discarding unusable cache file");
                        stats.files_discarded += 1;
                        let _ = std::fs::remove_file(segment_entry.path());
                    }
                }
            }
        }

        self.metrics.add_recovered(stats.segments_recovered);
        Ok(stats)
    }
}
