//! Per-segment download coordination.
//!
//! A [`FileSegment`] tracks the download lifecycle of one contiguous byte
//! range of a logical file. All current holders share the segment; exactly
//! one of them (the *downloader*) is authorized to append bytes to the
//! backing file, while the others block on a condition variable until the
//! download makes progress.
//!
//! # Protocol
//!
//! ```text
//!   downloader                              waiter
//!   ----------                              ------
//!   get_or_set_downloader() == me           get_or_set_downloader() != me
//!   reserve(n)                              wait()  -> blocks
//!   write(bytes)
//!   complete(Downloaded)  ----------------> wait()  -> Downloaded
//! ```
//!
//! A downloader that cannot finish transitions the segment to one of the
//! partial states instead; the shared finalizer then decides, together with
//! the cache, whether the segment is kept for a later claimant, shrunk to
//! its downloaded prefix, or dropped entirely.
//!
//! # Locking
//!
//! One mutex guards all mutable fields. When a segment operation needs the
//! cache index, the segment mutex is acquired first and the cache mutex
//! second; the cache never calls into a segment it does not exclusively
//! reference while holding its own mutex. Violating this order deadlocks.

use crate::cache::FileCache;
use crate::caller::ClientId;
use crate::config::SyncMode;
use crate::error::{CacheError, CacheResult};
use crate::key::{CacheKey, SegmentRange};
use crate::state::DownloadState;
use crate::writer::SegmentWriter;

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Weak;
use std::time::Duration;
use tracing::{trace, warn};

/// Mutable segment fields, guarded by the segment mutex.
struct SegmentInner {
    state: DownloadState,
    /// Bytes persisted to the backing file. Monotone increasing, never
    /// exceeds `reserved_size`.
    downloaded_size: u64,
    /// Bytes charged against the cache quota for this segment. Never
    /// exceeds the declared range size.
    reserved_size: u64,
    /// Client currently authorized to write, if any.
    downloader_id: Option<ClientId>,
    /// Backing file sink; present while a download is in flight.
    writer: Option<SegmentWriter>,
}

impl SegmentInner {
    /// Reserved bytes not yet written.
    fn available(&self) -> u64 {
        self.reserved_size - self.downloaded_size
    }
}

/// One contiguous byte range of a logical file in the cache.
///
/// Shared by all current holders; the segment lives as long as its
/// longest-living holder plus the cache index entry. See the module docs
/// for the coordination protocol.
pub struct FileSegment {
    key: CacheKey,
    range: SegmentRange,
    cache: Weak<FileCache>,
    wait_timeout: Duration,
    sync_mode: SyncMode,
    inner: Mutex<SegmentInner>,
    cv: Condvar,
}

impl FileSegment {
    /// Create a segment in `Empty` (fresh miss) or `Downloaded` (recovered
    /// on startup) state. Any other initial state is rejected.
    pub(crate) fn new(
        cache: Weak<FileCache>,
        key: CacheKey,
        offset: u64,
        size: u64,
        state: DownloadState,
        wait_timeout: Duration,
        sync_mode: SyncMode,
    ) -> CacheResult<Self> {
        debug_assert!(size > 0, "segments cover at least one byte");

        let (downloaded_size, reserved_size) = match state {
            DownloadState::Downloaded => (size, size),
            DownloadState::Empty => (0, 0),
            other => return Err(CacheError::InvalidInitialState(other)),
        };

        Ok(Self {
            key,
            range: SegmentRange::new(offset, offset + size - 1),
            cache,
            wait_timeout,
            sync_mode,
            inner: Mutex::new(SegmentInner {
                state,
                downloaded_size,
                reserved_size,
                downloader_id: None,
                writer: None,
            }),
            cv: Condvar::new(),
        })
    }

    /// Key of the logical file this segment belongs to.
    #[inline]
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// Absolute offset of the segment's first byte.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.range.left
    }

    /// The closed byte range `[offset, offset + size - 1]`.
    #[inline]
    pub fn range(&self) -> SegmentRange {
        self.range
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DownloadState {
        self.inner.lock().state
    }

    /// Bytes persisted so far.
    pub fn downloaded_size(&self) -> u64 {
        self.inner.lock().downloaded_size
    }

    /// Absolute offset of the last persisted byte.
    ///
    /// Meaningful only when at least one byte has been downloaded.
    pub fn download_offset(&self) -> u64 {
        let inner = self.inner.lock();
        (self.range.left + inner.downloaded_size).saturating_sub(1)
    }

    /// The id of the caller, resolved through the cache's injected source.
    fn caller(&self) -> CacheResult<ClientId> {
        let cache = self.cache.upgrade().ok_or(CacheError::CacheDetached)?;
        cache.caller_id().ok_or(CacheError::NoCallerId)
    }

    fn not_downloader(
        op: &'static str,
        caller: &ClientId,
        inner: &SegmentInner,
    ) -> CacheError {
        CacheError::NotDownloader {
            op,
            caller: caller.to_string(),
            downloader: inner
                .downloader_id
                .as_ref()
                .map_or_else(|| "none".to_owned(), ClientId::to_string),
        }
    }

    /// Elect the caller as downloader if the seat is empty, and return the
    /// current downloader's id either way.
    ///
    /// The caller compares the returned id against its own to learn
    /// whether it won the election. Linearizable: concurrent claimants all
    /// observe the same winner.
    pub fn get_or_set_downloader(&self) -> CacheResult<ClientId> {
        let caller = self.caller()?;
        let mut inner = self.inner.lock();

        let downloader = match &inner.downloader_id {
            Some(id) => id.clone(),
            None => {
                trace!(
                    segment = %self.range,
                    downloader = %caller,
                    prev_state = %inner.state,
                    "set downloader"
                );
                inner.state = DownloadState::Downloading;
                inner.downloader_id = Some(caller.clone());
                caller
            }
        };

        Ok(downloader)
    }

    /// Check whether the caller is the current downloader.
    ///
    /// Returns false when the calling context has no caller id.
    pub fn is_downloader(&self) -> bool {
        let Ok(caller) = self.caller() else {
            return false;
        };
        self.inner.lock().downloader_id.as_ref() == Some(&caller)
    }

    /// Reserve `size` further bytes against the cache quota.
    ///
    /// Only the yet-unreserved portion `size - (reserved - downloaded)` is
    /// charged; a previous downloader may have left a reserved prefix
    /// behind. Returns false (without mutating the segment) when the cache
    /// refuses the reservation.
    pub fn reserve(&self, size: u64) -> CacheResult<bool> {
        if size == 0 {
            return Err(CacheError::ZeroReserve);
        }

        let caller = self.caller()?;
        let cache = self.cache.upgrade().ok_or(CacheError::CacheDetached)?;
        let mut inner = self.inner.lock();

        if inner.downloaded_size + size > self.range.size() {
            return Err(CacheError::ReserveExceedsSize {
                requested: size,
                range: self.range,
                downloaded: inner.downloaded_size,
            });
        }
        if inner.downloader_id.as_ref() != Some(&caller) {
            return Err(Self::not_downloader("reserve space", &caller, &inner));
        }

        debug_assert!(inner.reserved_size >= inner.downloaded_size);

        let to_reserve = size.saturating_sub(inner.available());
        let reserved = to_reserve == 0 || {
            // Segment mutex is held here; the cache mutex nests inside it.
            let mut index = cache.lock_index();
            cache.try_reserve_locked(&mut index, self.key, self.range.left, to_reserve)
        };

        if reserved {
            // Grows by the charged delta, landing on downloaded + size;
            // this keeps reserved_size within the declared range even when
            // a previous downloader left an unconsumed prefix.
            inner.reserved_size += to_reserve;
        }
        Ok(reserved)
    }

    /// Append bytes to the segment's backing file.
    ///
    /// Requires the caller to be the downloader and the write to fit in
    /// the reserved prefix. The state stays `Downloading`; only the
    /// `complete` family changes it.
    pub fn write(&self, data: &[u8]) -> CacheResult<()> {
        if data.is_empty() {
            return Err(CacheError::ZeroWrite);
        }

        let caller = self.caller()?;
        let mut inner = self.inner.lock();

        let requested = data.len() as u64;
        if requested > inner.available() {
            return Err(CacheError::WriteExceedsReserved {
                available: inner.available(),
                requested,
            });
        }
        if inner.downloader_id.as_ref() != Some(&caller) {
            return Err(Self::not_downloader("write", &caller, &inner));
        }

        if inner.writer.is_none() {
            let cache = self.cache.upgrade().ok_or(CacheError::CacheDetached)?;
            let path = cache.segment_path(self.key, self.range.left);
            trace!(segment = %self.range, path = %path.display(), "opening segment writer");
            inner.writer = Some(SegmentWriter::open(path, self.sync_mode)?);
        }
        let writer = inner.writer.as_mut().expect("writer was just created");

        writer.append(data)?;
        inner.downloaded_size += requested;
        Ok(())
    }

    /// Block until the current downloader makes progress, then return the
    /// state.
    ///
    /// Legal only on claimed segments; waiting on `Empty` fails because no
    /// download is coming. The wait is bounded by the configured timeout
    /// and subject to spurious wakeups, so callers must re-evaluate the
    /// returned state and loop if necessary.
    pub fn wait(&self) -> CacheResult<DownloadState> {
        let mut inner = self.inner.lock();

        if inner.state == DownloadState::Empty {
            return Err(CacheError::WaitOnEmpty);
        }

        if inner.state == DownloadState::Downloading {
            trace!(segment = %self.range, downloader = ?inner.downloader_id, "waiting");
            let _ = self.cv.wait_for(&mut inner, self.wait_timeout);
        }

        Ok(inner.state)
    }

    /// Release authorship after a batch of writes without finalizing.
    ///
    /// Promotes to `Downloaded` when the whole range is persisted;
    /// otherwise the segment stays `Downloading` with no downloader and an
    /// open writer, to be adopted by the next claimant. No quota
    /// reconciliation or last-holder handling happens here.
    pub fn complete_batch(&self) -> CacheResult<()> {
        let caller = self.caller()?;
        {
            let mut inner = self.inner.lock();

            if inner.downloader_id.as_ref() != Some(&caller) {
                self.cv.notify_all();
                return Err(Self::not_downloader("complete", &caller, &inner));
            }

            if inner.downloaded_size == self.range.size() {
                inner.state = DownloadState::Downloaded;
            }
            inner.downloader_id = None;
        }
        self.cv.notify_all();
        Ok(())
    }

    /// Explicitly finish the download attempt with a terminal state.
    ///
    /// `state` must be `Downloaded`, `PartiallyDownloaded`, or
    /// `PartiallyDownloadedNoContinuation`; only the downloader may call
    /// this. Runs the shared finalizer and wakes all waiters.
    pub fn complete(&self, state: DownloadState) -> CacheResult<()> {
        let caller = self.caller()?;
        {
            let mut inner = self.inner.lock();

            if inner.downloader_id.as_ref() != Some(&caller) {
                self.cv.notify_all();
                return Err(Self::not_downloader("complete", &caller, &inner));
            }

            if !matches!(
                state,
                DownloadState::Downloaded
                    | DownloadState::PartiallyDownloaded
                    | DownloadState::PartiallyDownloadedNoContinuation
            ) {
                self.cv.notify_all();
                return Err(CacheError::InvalidCompleteState(state));
            }

            inner.state = state;
            self.finalize(&mut inner, Some(&caller));
        }
        self.cv.notify_all();
        Ok(())
    }

    /// Release path run for every holder letting go of the segment.
    ///
    /// A fully persisted range is promoted to `Downloaded`; a segment
    /// still `Downloading` or `Empty` degrades to `PartiallyDownloaded`
    /// (the departing holder may have been the downloader, or nobody ever
    /// claimed the segment). Runs the shared finalizer.
    pub fn complete_on_release(&self) -> CacheResult<()> {
        let caller = self.cache.upgrade().and_then(|cache| cache.caller_id());
        {
            let mut inner = self.inner.lock();

            if inner.state == DownloadState::SkipCache {
                return Ok(());
            }

            if inner.downloaded_size == self.range.size()
                && inner.state != DownloadState::Downloaded
            {
                inner.state = DownloadState::Downloaded;
            }

            if inner.state == DownloadState::Downloading || inner.state == DownloadState::Empty {
                inner.state = DownloadState::PartiallyDownloaded;
            }

            self.finalize(&mut inner, caller.as_ref());
        }
        self.cv.notify_all();
        Ok(())
    }

    /// Shared epilogue of the `complete` paths. Runs under the segment
    /// mutex; reconciles partial outcomes with the cache.
    fn finalize(&self, inner: &mut SegmentInner, caller: Option<&ClientId>) {
        let mut download_can_continue = false;
        let mut remove_from_index = false;
        let cache = self.cache.upgrade();

        if inner.state.is_partial() {
            if let Some(cache) = &cache {
                let mut index = cache.lock_index();

                let is_last_holder =
                    cache.is_last_segment_holder_locked(&index, self.key, self.range.left);
                download_can_continue =
                    !is_last_holder && inner.state == DownloadState::PartiallyDownloaded;

                if !download_can_continue {
                    if inner.downloaded_size == 0 {
                        // Nothing usable was persisted; readers bypass the
                        // cache for this range from now on.
                        inner.state = DownloadState::SkipCache;
                        remove_from_index = true;
                    } else if is_last_holder {
                        // Only the last holder may shrink the declared
                        // range: every earlier holder was promised the
                        // full one.
                        trace!(
                            segment = %self.range,
                            downloaded = inner.downloaded_size,
                            "shrinking segment to downloaded size"
                        );
                        cache.reduce_size_locked(
                            &mut index,
                            self.key,
                            self.range.left,
                            inner.downloaded_size,
                        );
                    }
                }
            }
        }

        if caller.is_some() && inner.downloader_id.as_ref() == caller {
            trace!(
                segment = %self.range,
                downloader = ?inner.downloader_id,
                state = %inner.state,
                "clearing downloader"
            );
            inner.downloader_id = None;
        }

        if !download_can_continue {
            if let Some(writer) = inner.writer.take() {
                trace!(
                    segment = %self.range,
                    bytes = writer.bytes_written(),
                    "syncing segment writer"
                );
                if let Err(err) = writer.sync() {
                    warn!(segment = %self.range, %err, "failed to sync segment writer");
                }
            }
        }

        // Deletion comes after the writer is synced and closed.
        if remove_from_index {
            if let Some(cache) = &cache {
                trace!(segment = %self.range, "removing abandoned segment");
                let mut index = cache.lock_index();
                cache.remove_locked(&mut index, self.key, self.range.left);
            }
        }
    }
}

impl fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("FileSegment");
        builder
            .field("key", &self.key)
            .field("range", &self.range);
        match self.inner.try_lock() {
            Some(inner) => builder
                .field("state", &inner.state)
                .field("downloaded_size", &inner.downloaded_size)
                .field("reserved_size", &inner.reserved_size)
                .field("downloader_id", &inner.downloader_id)
                .finish(),
            None => builder.finish_non_exhaustive(),
        }
    }
}
