//! Memory-mapped read-ahead cache over region files: an LRU of resident
//! mappings bounded both by entry count and total resident bytes, a soft
//! TTL that forces a remap of stale entries, and prefetching driven by
//! [`crate::intent::IntentPredictor`].

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lru::LruCache;
use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

struct MappedRegion {
    mmap: Arc<Mmap>,
    mapped_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct MmapReadAheadConfig {
    pub max_entries: usize,
    pub max_resident_bytes: usize,
    pub soft_ttl: Duration,
    /// Square radius (in regions) used when a viewer's intent predictor has
    /// nothing to offer (stationary, or too little history): every region
    /// within this Chebyshev distance of the viewer's current one is
    /// prefetched instead.
    pub prefetch_radius: i32,
}

impl Default for MmapReadAheadConfig {
    fn default() -> Self {
        Self {
            max_entries: 512,
            max_resident_bytes: 256 * 1024 * 1024,
            soft_ttl: Duration::from_secs(300),
            prefetch_radius: 2,
        }
    }
}

struct Inner {
    config: MmapReadAheadConfig,
    cache: Mutex<LruCache<PathBuf, MappedRegion>>,
    resident_bytes: Mutex<usize>,
}

impl Inner {
    fn map_fresh(self: &Arc<Self>, path: &Path) -> Result<Arc<Mmap>> {
        let file = File::open(path)?;
        // Safety: the mapped file is a region file this process owns
        // exclusively through `StorageManager`; concurrent external
        // truncation is outside this crate's contract, matching the
        // guarantee mmap-based readers in this ecosystem generally rely on.
        let mmap = unsafe { Mmap::map(&file)? };
        let mmap = Arc::new(mmap);
        let size = mmap.len();

        let mut cache = self.cache.lock();
        if let Some(old) = cache.put(
            path.to_path_buf(),
            MappedRegion {
                mmap: Arc::clone(&mmap),
                mapped_at: Instant::now(),
            },
        ) {
            *self.resident_bytes.lock() -= old.mmap.len();
        }
        *self.resident_bytes.lock() += size;
        drop(cache);

        self.evict_to_budget(self.config.max_resident_bytes, self.config.max_entries);
        Ok(mmap)
    }

    fn evict_to_budget(&self, resident_limit: usize, entry_limit: usize) {
        loop {
            let over_budget = *self.resident_bytes.lock() > resident_limit;
            let over_count = self.cache.lock().len() > entry_limit;
            if !over_budget && !over_count {
                break;
            }
            let mut cache = self.cache.lock();
            match cache.pop_lru() {
                Some((path, region)) => {
                    drop(cache);
                    *self.resident_bytes.lock() -= region.mmap.len();
                    debug!(path = %path.display(), "evicted mmap entry over resident budget");
                }
                None => break,
            }
        }
    }

    fn invalidate(&self, path: &Path) {
        let mut cache = self.cache.lock();
        if let Some(region) = cache.pop(path) {
            drop(cache);
            *self.resident_bytes.lock() -= region.mmap.len();
        }
    }

    /// One maintenance pass: drop every entry past its soft TTL outright
    /// (rather than waiting for a caller to notice on the next
    /// `get_or_map`), then evict LRU entries down to 90% of the resident
    /// budget so routine traffic has headroom before hitting the hard cap.
    fn run_maintenance(&self) {
        let stale: Vec<PathBuf> = self
            .cache
            .lock()
            .iter()
            .filter(|(_, region)| region.mapped_at.elapsed() >= self.config.soft_ttl)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &stale {
            self.invalidate(path);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "maintenance expired stale mmap entries");
        }

        let soft_limit = (self.config.max_resident_bytes as f64 * 0.9) as usize;
        self.evict_to_budget(soft_limit, self.config.max_entries);
    }
}

/// Read-only mmap cache keyed by region file path. Runs a background
/// maintenance thread that expires TTL'd entries and evicts down to a soft
/// resident-byte budget every 30 seconds, independent of read traffic.
pub struct MmapReadAhead {
    inner: Arc<Inner>,
    maintenance_running: Arc<AtomicBool>,
    maintenance_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MmapReadAhead {
    pub fn new(config: MmapReadAheadConfig) -> Self {
        let inner = Arc::new(Inner {
            config,
            // Unbounded: entry-count and resident-byte limits are both
            // enforced explicitly in `evict_to_budget`, since the crate's
            // own capacity-based eviction wouldn't report back the bytes
            // it silently dropped.
            cache: Mutex::new(LruCache::unbounded()),
            resident_bytes: Mutex::new(0),
        });

        let maintenance_running = Arc::new(AtomicBool::new(true));
        let handle = spawn_maintenance(Arc::clone(&inner), Arc::clone(&maintenance_running));

        Self {
            inner,
            maintenance_running,
            maintenance_handle: Mutex::new(Some(handle)),
        }
    }

    /// Return the mmap for `path`, mapping it fresh if absent or past its
    /// soft TTL.
    pub fn get_or_map(&self, path: &Path) -> Result<Arc<Mmap>> {
        {
            let mut cache = self.inner.cache.lock();
            if let Some(region) = cache.get(path) {
                if region.mapped_at.elapsed() < self.inner.config.soft_ttl {
                    return Ok(Arc::clone(&region.mmap));
                }
                debug!(path = %path.display(), "mmap entry past soft TTL, remapping");
            }
        }
        self.inner.map_fresh(path)
    }

    /// Drop a cached mapping, e.g. after a flush changed the underlying
    /// file; the next `get_or_map` call remaps fresh bytes.
    pub fn invalidate(&self, path: &Path) {
        self.inner.invalidate(path);
    }

    /// Whether `path` is already resident, without promoting it in the LRU
    /// or resetting its soft TTL. Used to tell a warm read-ahead hit apart
    /// from a cold `get_or_map` that had to map the file itself.
    pub fn contains(&self, path: &Path) -> bool {
        self.inner.cache.lock().contains(path)
    }

    /// Best-effort prefetch: map each path, logging and continuing past
    /// any individual failure (missing file, permission error) rather
    /// than aborting the whole batch.
    pub fn prefetch(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = self.get_or_map(path) {
                warn!(path = %path.display(), error = %e, "prefetch failed");
            }
        }
    }

    /// Prefetch `center` plus every region within `prefetch_radius` of it
    /// (a Chebyshev square), used as the static fallback when a viewer's
    /// intent predictor has nothing better to offer.
    pub fn prefetch_square(&self, root: &Path, center: (i32, i32), paths_for: impl Fn(&Path, i32, i32) -> PathBuf) {
        let radius = self.inner.config.prefetch_radius;
        let mut targets = Vec::new();
        for dz in -radius..=radius {
            for dx in -radius..=radius {
                targets.push(paths_for(root, center.0 + dx, center.1 + dz));
            }
        }
        self.prefetch(&targets);
    }

    pub fn prefetch_radius(&self) -> i32 {
        self.inner.config.prefetch_radius
    }

    pub fn resident_bytes(&self) -> usize {
        *self.inner.resident_bytes.lock()
    }

    pub fn len(&self) -> usize {
        self.inner.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for MmapReadAhead {
    fn drop(&mut self) {
        self.maintenance_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.maintenance_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

fn spawn_maintenance(inner: Arc<Inner>, running: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("turbo-region-mmap-maintenance".into())
        .spawn(move || {
            // Wake on a short tick rather than sleeping the full interval in
            // one call, so `Drop` doesn't have to wait out a whole period.
            let tick = Duration::from_millis(200);
            let mut elapsed = Duration::ZERO;
            while running.load(Ordering::SeqCst) {
                std::thread::sleep(tick);
                elapsed += tick;
                if elapsed >= MAINTENANCE_INTERVAL {
                    elapsed = Duration::ZERO;
                    inner.run_maintenance();
                }
            }
        })
        .expect("spawning the mmap maintenance thread should not fail")
}

/// Maps each viewer id to its own intent predictor history, used by
/// [`crate::manager::StorageManager`] to turn viewer movement into
/// concrete region paths for [`MmapReadAhead::prefetch`].
pub struct ViewerIntentTable {
    predictors: Mutex<HashMap<u64, crate::intent::IntentPredictor>>,
    config: crate::intent::IntentPredictorConfig,
}

impl ViewerIntentTable {
    pub fn new(config: crate::intent::IntentPredictorConfig) -> Self {
        Self {
            predictors: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn observe(&self, viewer_id: u64, cx: f64, cz: f64, at: Instant) {
        let mut table = self.predictors.lock();
        table
            .entry(viewer_id)
            .or_insert_with(|| crate::intent::IntentPredictor::new(self.config))
            .observe(cx, cz, at);
    }

    /// `None` means the predictor has nothing to offer (no history yet, or
    /// the viewer is judged stationary); the caller falls back to
    /// [`MmapReadAhead::prefetch_square`] in that case.
    pub fn prefetch_targets(&self, viewer_id: u64) -> Option<Vec<(i32, i32)>> {
        self.predictors.lock().get(&viewer_id).and_then(|p| p.prefetch_targets())
    }

    /// The viewer's last observed chunk position, for callers that need a
    /// center to prefetch around when `prefetch_targets` returns `None`.
    pub fn last_position(&self, viewer_id: u64) -> Option<(i32, i32)> {
        self.predictors.lock().get(&viewer_id).and_then(|p| p.last_position())
    }

    pub fn forget(&self, viewer_id: u64) {
        self.predictors.lock().remove(&viewer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn maps_and_reuses_cached_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.0.0.bin");
        fs::write(&path, vec![1u8; 4096]).unwrap();

        let cache = MmapReadAhead::new(MmapReadAheadConfig::default());
        let a = cache.get_or_map(&path).unwrap();
        let b = cache.get_or_map(&path).unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidate_forces_remap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.0.0.bin");
        fs::write(&path, vec![1u8; 4096]).unwrap();

        let cache = MmapReadAhead::new(MmapReadAheadConfig::default());
        cache.get_or_map(&path).unwrap();
        cache.invalidate(&path);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn eviction_keeps_resident_bytes_under_budget() {
        let dir = tempdir().unwrap();
        let cache = MmapReadAhead::new(MmapReadAheadConfig {
            max_entries: 16,
            max_resident_bytes: 8192,
            soft_ttl: Duration::from_secs(60),
            prefetch_radius: 2,
        });

        for i in 0..4 {
            let path = dir.path().join(format!("r.{i}.0.bin"));
            fs::write(&path, vec![1u8; 4096]).unwrap();
            cache.get_or_map(&path).unwrap();
        }
        assert!(cache.resident_bytes() <= 8192);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = MmapReadAheadConfig::default();
        assert_eq!(cfg.max_entries, 512);
        assert_eq!(cfg.max_resident_bytes, 256 * 1024 * 1024);
        assert_eq!(cfg.soft_ttl, Duration::from_secs(300));
    }

    #[test]
    fn maintenance_expires_stale_entries_without_being_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.0.0.bin");
        fs::write(&path, vec![1u8; 4096]).unwrap();

        let cache = MmapReadAhead::new(MmapReadAheadConfig {
            max_entries: 16,
            max_resident_bytes: 1024 * 1024,
            soft_ttl: Duration::from_millis(1),
            prefetch_radius: 2,
        });
        cache.get_or_map(&path).unwrap();
        assert_eq!(cache.len(), 1);

        // The maintenance thread ticks on a 200ms cadence and runs its
        // sweep once MAINTENANCE_INTERVAL has accumulated; rather than
        // waiting 30s in a test, call the sweep directly.
        cache.inner.run_maintenance();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn prefetch_square_covers_the_configured_radius() {
        let dir = tempdir().unwrap();
        for dx in -1..=1 {
            for dz in -1..=1 {
                let path = dir.path().join(format!("r.{dx}.{dz}.bin"));
                fs::write(&path, vec![1u8; 16]).unwrap();
            }
        }

        let cache = MmapReadAhead::new(MmapReadAheadConfig {
            max_entries: 16,
            max_resident_bytes: 1024 * 1024,
            soft_ttl: Duration::from_secs(60),
            prefetch_radius: 1,
        });
        cache.prefetch_square(dir.path(), (0, 0), |root, cx, cz| root.join(format!("r.{cx}.{cz}.bin")));
        assert_eq!(cache.len(), 9);
    }
}
