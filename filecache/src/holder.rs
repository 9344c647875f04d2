//! RAII holder over the segments covering a requested range.

use crate::segment::FileSegment;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::warn;

/// The segments covering one requested byte range, in ascending offset
/// order.
///
/// Returned by [`FileCache::get_or_set`](crate::FileCache::get_or_set).
/// Holding one keeps every contained segment alive; dropping it runs the
/// release path on each segment, which is what triggers last-holder
/// finalization (shrink to the downloaded prefix, or removal of abandoned
/// segments).
pub struct FileSegmentsHolder {
    segments: Vec<Arc<FileSegment>>,
}

impl FileSegmentsHolder {
    pub(crate) fn new(segments: Vec<Arc<FileSegment>>) -> Self {
        Self { segments }
    }

    /// The held segments, in ascending offset order.
    pub fn segments(&self) -> &[Arc<FileSegment>] {
        &self.segments
    }
}

impl Deref for FileSegmentsHolder {
    type Target = [Arc<FileSegment>];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}

impl Drop for FileSegmentsHolder {
    fn drop(&mut self) {
        for segment in &self.segments {
            if let Err(err) = segment.complete_on_release() {
                warn!(
                    key = %segment.key(),
                    segment = %segment.range(),
                    %err,
                    "failed to release segment"
                );
            }
        }
    }
}

impl fmt::Debug for FileSegmentsHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.segments.iter()).finish()
    }
}
