//! Scoped append-only writer over a segment's backing file.

use crate::config::SyncMode;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::Write;
use std::path::PathBuf;

/// Append-only sink for a segment's backing file.
///
/// Created lazily on the downloader's first write and owned by the segment
/// until finalization. The lifecycle is `open -> append* -> sync -> close`;
/// no bytes are buffered in memory, every append goes straight to the file.
pub struct SegmentWriter {
    file: File,
    sync_mode: SyncMode,
    bytes_written: u64,
}

impl SegmentWriter {
    /// Open (or create) the backing file for appending.
    pub(crate) fn open(path: PathBuf, sync_mode: SyncMode) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            file,
            sync_mode,
            bytes_written: 0,
        })
    }

    /// Append bytes to the backing file.
    ///
    /// A short write surfaces as an error; the caller decides whether the
    /// segment degrades to a partial state.
    pub(crate) fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        if self.sync_mode.is_sync() {
            self.file.sync_data()?;
        }
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Flush written bytes to stable storage.
    ///
    /// A no-op under [`SyncMode::None`].
    pub(crate) fn sync(&self) -> io::Result<()> {
        match self.sync_mode {
            SyncMode::None => Ok(()),
            SyncMode::Sync | SyncMode::Async => self.file.sync_data(),
        }
    }

    /// Bytes appended through this writer.
    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        // Finalization syncs explicitly; this covers the batch hand-off
        // path where the writer outlives its downloader.
        if !matches!(self.sync_mode, SyncMode::None) {
            let _ = self.file.sync_data();
        }
    }
}
