//! filecache: shared on-disk cache of byte-range file segments.
//!
//! The cache fronts a remote object store: reader clients request fixed
//! offsets and lengths of logical files and get back a set of contiguous
//! *segments* that either already hold the bytes locally or that a single
//! elected *downloader* populates while the other clients block until the
//! bytes are visible.
//!
//! # Architecture
//!
//! ```text
//!                  +---------------------------+
//!                  |         FileCache         |
//!                  | (index + quota + LRU)     |
//!                  +-------------+-------------+
//!                                |
//!               get_or_set(key, offset, size)
//!                                |
//!                                v
//!                  +---------------------------+
//!                  |    FileSegmentsHolder     |
//!                  +------+------+------+------+
//!                         |      |      |
//!                         v      v      v
//!                  +-----------------------------+
//!                  |   FileSegment (per range)   |
//!                  | state machine + condvar     |
//!                  | elected downloader appends  |
//!                  | through a SegmentWriter     |
//!                  +-----------------------------+
//! ```
//!
//! Each segment elects exactly one downloader among the clients holding
//! it; the downloader reserves bytes against the cache-wide quota,
//! appends them to the segment's backing file, and finalizes with one of
//! the terminal states. Everyone else waits on the segment's condition
//! variable and re-reads its state.
//!
//! # Example
//!
//! ```no_run
//! use filecache::{CacheConfig, CacheKey, CallerScope, DownloadState, FileCache};
//!
//! # fn main() -> filecache::CacheResult<()> {
//! let cache = FileCache::new(CacheConfig::new().cache_dir("/var/cache/filecache"))?;
//! let key = CacheKey::from_path("bucket/data/part-000.bin");
//!
//! let _scope = CallerScope::enter("query-42");
//! let holder = cache.get_or_set(key, 0, 1024)?;
//! for segment in holder.iter() {
//!     match segment.state() {
//!         DownloadState::Downloaded => { /* read segment_path(..) */ }
//!         _ => {
//!             let me = cache.caller_id().ok_or(filecache::CacheError::NoCallerId)?;
//!             if segment.get_or_set_downloader()? == me {
//!                 // fetch from the remote store, then:
//!                 // segment.reserve(n)?; segment.write(&bytes)?;
//!                 segment.complete(DownloadState::Downloaded)?;
//!             } else {
//!                 segment.wait()?;
//!             }
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cache;
mod caller;
mod config;
mod error;
mod holder;
mod key;
mod metrics;
mod segment;
mod state;
mod writer;

pub use cache::{FileCache, RecoveryStats};
pub use caller::{CallerIdSource, CallerScope, ClientId, ScopedCallerId};
pub use config::{CacheConfig, SyncMode};
pub use error::{CacheError, CacheResult};
pub use holder::FileSegmentsHolder;
pub use key::{CacheKey, SegmentRange};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use segment::FileSegment;
pub use state::DownloadState;
