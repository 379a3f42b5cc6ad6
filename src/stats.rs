//! Process-wide counters exposed by [`crate::manager::StorageManager`].

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StorageStats {
    pub chunks_loaded: AtomicU64,
    pub chunks_saved: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub prefetch_hits: AtomicU64,
    pub backpressure_rejections: AtomicU64,
    pub integrity_repairs: AtomicU64,
    pub integrity_corruptions: AtomicU64,
    pub mca_lz4_reads_skipped: AtomicU64,
    pub regions_converted: AtomicU64,
    pub conversion_failures: AtomicU64,
}

impl StorageStats {
    pub fn snapshot(&self) -> StorageStatsSnapshot {
        StorageStatsSnapshot {
            chunks_loaded: self.chunks_loaded.load(Ordering::Relaxed),
            chunks_saved: self.chunks_saved.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            prefetch_hits: self.prefetch_hits.load(Ordering::Relaxed),
            backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
            integrity_repairs: self.integrity_repairs.load(Ordering::Relaxed),
            integrity_corruptions: self.integrity_corruptions.load(Ordering::Relaxed),
            mca_lz4_reads_skipped: self.mca_lz4_reads_skipped.load(Ordering::Relaxed),
            regions_converted: self.regions_converted.load(Ordering::Relaxed),
            conversion_failures: self.conversion_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A consistent-enough point-in-time read of [`StorageStats`]; fields are
/// read independently so concurrent updates may interleave, which is fine
/// for monitoring purposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStatsSnapshot {
    pub chunks_loaded: u64,
    pub chunks_saved: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub prefetch_hits: u64,
    pub backpressure_rejections: u64,
    pub integrity_repairs: u64,
    pub integrity_corruptions: u64,
    pub mca_lz4_reads_skipped: u64,
    pub regions_converted: u64,
    pub conversion_failures: u64,
}
