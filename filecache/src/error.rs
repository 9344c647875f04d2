//! Error types for cache operations.

use crate::key::SegmentRange;
use crate::state::DownloadState;

/// Errors that can occur during cache and segment operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The calling thread has no caller id installed.
    #[error("cannot use the cache without a caller id")]
    NoCallerId,

    /// Segments may only be constructed empty or fully downloaded.
    #[error("a segment can be created only in EMPTY or DOWNLOADED state, got {0}")]
    InvalidInitialState(DownloadState),

    /// A zero-length write was attempted.
    #[error("writing zero bytes is not allowed")]
    ZeroWrite,

    /// A zero-byte reservation was attempted.
    #[error("reserving zero bytes is not allowed")]
    ZeroReserve,

    /// A zero-length range was requested from the cache.
    #[error("cannot request a zero-length range")]
    EmptyRange,

    /// A write exceeded the reserved prefix of the segment.
    #[error("not enough space reserved: available {available}, requested {requested}")]
    WriteExceedsReserved {
        /// Reserved bytes not yet written.
        available: u64,
        /// Bytes the caller attempted to write.
        requested: u64,
    },

    /// A reservation would extend past the declared segment size.
    #[error(
        "attempt to reserve {requested} bytes beyond segment range {range} \
         (downloaded: {downloaded})"
    )]
    ReserveExceedsSize {
        /// Bytes the caller attempted to reserve.
        requested: u64,
        /// The segment's declared range.
        range: SegmentRange,
        /// Bytes already persisted.
        downloaded: u64,
    },

    /// A mutating operation was attempted by a client that is not the
    /// current downloader.
    #[error("only the downloader may {op} (caller: {caller}, downloader: {downloader})")]
    NotDownloader {
        /// The operation that was attempted.
        op: &'static str,
        /// The caller's id.
        caller: String,
        /// The current downloader's id, or `"none"`.
        downloader: String,
    },

    /// `complete` was called with a state that is not a permitted terminal.
    #[error("cannot complete a segment with state {0}")]
    InvalidCompleteState(DownloadState),

    /// `wait` was called on a segment no client has claimed.
    #[error("cannot wait on a segment in EMPTY state")]
    WaitOnEmpty,

    /// The owning cache was dropped while the segment was still in use.
    #[error("the cache was dropped while the segment was still in use")]
    CacheDetached,

    /// An underlying filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
