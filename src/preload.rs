//! Preloader: materializes a query-scoped snapshot of chunks in memory.
//!
//! A preloader accumulates `(fingerprint, time range)` requests. Each
//! request locates the series (unarchiving it if needed), loads evicted
//! chunk bodies from the chunk store, and pins every covered chunk so the
//! eviction loop leaves it alone. Closing the preloader releases all pins.

use crate::error::Result;
use crate::series::ChunkDesc;
use crate::storage::MemorySeriesStorage;
use crate::types::{Fingerprint, Timestamp};
use std::sync::Arc;
use std::time::Instant;

/// Pin accumulator tied to one query. Dropping it releases every pin it
/// took, so an early return cannot leak pinned chunks.
pub struct Preloader<'a> {
    storage: &'a MemorySeriesStorage,
    pinned: Vec<(Fingerprint, Vec<Arc<ChunkDesc>>)>,
}

impl<'a> Preloader<'a> {
    pub(crate) fn new(storage: &'a MemorySeriesStorage) -> Preloader<'a> {
        Preloader {
            storage,
            pinned: Vec::new(),
        }
    }

    /// Pins all chunks of `fp` overlapping `[from, through]`, loading
    /// evicted bodies from disk. Subject to the configured preload
    /// deadline: on expiry the request takes no pins and returns
    /// `PreloadDeadlineExceeded`; pins from earlier requests are kept until
    /// `close`.
    pub fn preload_range(
        &mut self,
        fp: Fingerprint,
        from: Timestamp,
        through: Timestamp,
    ) -> Result<()> {
        let deadline = Instant::now() + self.storage.config().preload_deadline;
        let descs = self.storage.pin_range(fp, from, through, deadline)?;
        if !descs.is_empty() {
            self.pinned.push((fp, descs));
        }
        Ok(())
    }

    /// Releases every pin taken by this preloader.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        for (_fp, descs) in self.pinned.drain(..) {
            for desc in descs {
                desc.unpin();
            }
        }
    }
}

impl Drop for Preloader<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
