//! Segment download lifecycle states.

use std::fmt;

/// State of a segment in its download lifecycle.
///
/// # State Semantics
///
/// - **Empty**: Created for a cache miss; no bytes persisted, no downloader.
/// - **Downloading**: A downloader has been elected and may append bytes.
/// - **Downloaded**: The full declared range is on disk. Terminal.
/// - **PartiallyDownloaded**: The downloader stopped short but another
///   holder may claim the segment and resume the download.
/// - **PartiallyDownloadedNoContinuation**: The downloader stopped short
///   and resumption is not possible (e.g. the source went away).
/// - **SkipCache**: The segment was abandoned with zero bytes and dropped
///   from the cache index; readers must bypass the cache. Terminal.
///
/// # State Transition Diagram
///
/// ```text
///              claim                    full download
///   Empty ------------> Downloading -------------------> Downloaded
///     |                     |
///     |                     +--> PartiallyDownloaded ---> Downloading
///     |                     |         |                  (next claimant)
///     |                     |         v
///     |                     |     SkipCache   (zero bytes, last holder)
///     |                     |
///     |                     +--> PartiallyDownloadedNoContinuation
///     |                                   |
///     |                                   v
///     |                               SkipCache
///     |
///     +--> PartiallyDownloaded   (released without ever being claimed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// No bytes persisted, no downloader elected.
    Empty,
    /// A downloader is authorized to append bytes.
    Downloading,
    /// The full declared range is on disk.
    Downloaded,
    /// Incomplete, but a later claimant may resume.
    PartiallyDownloaded,
    /// Incomplete and not resumable.
    PartiallyDownloadedNoContinuation,
    /// Abandoned with zero bytes; dropped from the index.
    SkipCache,
}

impl DownloadState {
    /// Check whether the segment can never change state again.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadState::Downloaded | DownloadState::SkipCache)
    }

    /// Check whether the segment holds an incomplete prefix of its range.
    #[inline]
    pub fn is_partial(self) -> bool {
        matches!(
            self,
            DownloadState::PartiallyDownloaded | DownloadState::PartiallyDownloadedNoContinuation
        )
    }

    /// Check whether a new downloader may claim the segment.
    #[inline]
    pub fn can_resume(self) -> bool {
        matches!(self, DownloadState::Empty | DownloadState::PartiallyDownloaded)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownloadState::Empty => "EMPTY",
            DownloadState::Downloading => "DOWNLOADING",
            DownloadState::Downloaded => "DOWNLOADED",
            DownloadState::PartiallyDownloaded => "PARTIALLY_DOWNLOADED",
            DownloadState::PartiallyDownloadedNoContinuation => {
                "PARTIALLY_DOWNLOADED_NO_CONTINUATION"
            }
            DownloadState::SkipCache => "SKIP_CACHE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(DownloadState::Downloaded.is_terminal());
        assert!(DownloadState::SkipCache.is_terminal());
        assert!(!DownloadState::Empty.is_terminal());
        assert!(!DownloadState::Downloading.is_terminal());
        assert!(!DownloadState::PartiallyDownloaded.is_terminal());
        assert!(!DownloadState::PartiallyDownloadedNoContinuation.is_terminal());
    }

    #[test]
    fn test_partial_states() {
        assert!(DownloadState::PartiallyDownloaded.is_partial());
        assert!(DownloadState::PartiallyDownloadedNoContinuation.is_partial());
        assert!(!DownloadState::Downloaded.is_partial());
        assert!(!DownloadState::Empty.is_partial());
    }

    #[test]
    fn test_resumable_states() {
        assert!(DownloadState::Empty.can_resume());
        assert!(DownloadState::PartiallyDownloaded.can_resume());
        assert!(!DownloadState::PartiallyDownloadedNoContinuation.can_resume());
        assert!(!DownloadState::Downloaded.can_resume());
        assert!(!DownloadState::SkipCache.can_resume());
    }

    #[test]
    fn test_display() {
        assert_eq!(DownloadState::Empty.to_string(), "EMPTY");
        assert_eq!(DownloadState::Downloading.to_string(), "DOWNLOADING");
        assert_eq!(DownloadState::Downloaded.to_string(), "DOWNLOADED");
        assert_eq!(
            DownloadState::PartiallyDownloaded.to_string(),
            "PARTIALLY_DOWNLOADED"
        );
        assert_eq!(
            DownloadState::PartiallyDownloadedNoContinuation.to_string(),
            "PARTIALLY_DOWNLOADED_NO_CONTINUATION"
        );
        assert_eq!(DownloadState::SkipCache.to_string(), "SKIP_CACHE");
    }
}
