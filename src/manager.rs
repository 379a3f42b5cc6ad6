//! Process-wide façade dispatching chunk load/save requests to per-region
//! components: the batch loader/saver, the mmap read-ahead cache, and the
//! integrity validator.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::batch::{BatchLoader, BatchSaver, SaveFormat};
use crate::chunk::ChunkEntry;
use crate::codec::{Algorithm, Codec};
use crate::config::{ConversionMode, FormatPreference, StorageConfig};
use crate::convert::{ConversionTarget, RegionConverter};
use crate::coord::RegionCoord;
use crate::error::{Result, StorageError};
use crate::format::RegionBackend;
use crate::integrity::{IntegrityValidator, ValidationReport};
use crate::mmap_cache::{MmapReadAhead, ViewerIntentTable};
use crate::pending::{pending, PendingResult};
use crate::stats::{StorageStats, StorageStatsSnapshot};

/// Which format newly-created regions are written in. Existing files on
/// disk keep whatever format they were found in, regardless of this
/// setting (migration is [`crate::convert::RegionConverter`]'s job).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredFormat {
    Lrf(Algorithm),
    Mca,
}

impl PreferredFormat {
    fn from_config(config: &StorageConfig) -> Self {
        let algorithm = config.compression_algorithm.0;
        match config.format {
            FormatPreference::Mca => Self::Mca,
            FormatPreference::Auto | FormatPreference::Lrf => Self::Lrf(algorithm),
        }
    }
}

struct RegionHandle {
    backend: Mutex<Option<Arc<RegionBackend>>>,
    loader: BatchLoader,
    saver: BatchSaver,
    validator: Arc<IntegrityValidator>,
}

pub struct StorageManager {
    root: PathBuf,
    codec: Arc<Codec>,
    config: StorageConfig,
    preferred_format: PreferredFormat,
    regions: Mutex<HashMap<RegionCoord, Arc<RegionHandle>>>,
    mmap_cache: MmapReadAhead,
    viewer_intent: ViewerIntentTable,
    stats: Arc<StorageStats>,
    closed: AtomicBool,
    closed_regions: Mutex<HashSet<RegionCoord>>,
}

impl StorageManager {
    /// Open `root`, deriving the preferred format for newly-created regions
    /// from `config.format`/`config.compression_algorithm` (use
    /// [`Self::with_format`] to override it explicitly). Runs
    /// `storage.auto-convert`'s startup-time conversion mode (`full-lrf`)
    /// synchronously before returning, if configured.
    pub fn open(root: impl Into<PathBuf>, config: StorageConfig) -> Self {
        let preferred_format = PreferredFormat::from_config(&config);
        Self::with_format(root, config, preferred_format)
    }

    pub fn with_format(
        root: impl Into<PathBuf>,
        config: StorageConfig,
        preferred_format: PreferredFormat,
    ) -> Self {
        let root = root.into();
        let mmap_cache = MmapReadAhead::new(config.mmap.clone().into());
        let viewer_intent = ViewerIntentTable::new(config.intent.clone().into());
        let codec = Arc::new(Codec::default());
        let stats = Arc::new(StorageStats::default());

        if config.auto_convert && config.conversion_mode == ConversionMode::FullLrf {
            let converter = RegionConverter::new(Arc::clone(&codec), Arc::clone(&stats));
            let algorithm = match preferred_format {
                PreferredFormat::Lrf(a) => a,
                PreferredFormat::Mca => config.compression_algorithm.0,
            };
            let report = converter.convert_directory(&root, ConversionTarget::Lrf(algorithm));
            if !report.errors.is_empty() {
                warn!(
                    root = %root.display(),
                    errors = report.errors.len(),
                    "startup full-lrf conversion had failures"
                );
            }
        }

        Self {
            root,
            codec,
            config,
            preferred_format,
            regions: Mutex::new(HashMap::new()),
            mmap_cache,
            viewer_intent,
            stats,
            closed: AtomicBool::new(false),
            closed_regions: Mutex::new(HashSet::new()),
        }
    }

    pub fn stats(&self) -> StorageStatsSnapshot {
        self.stats.snapshot()
    }

    fn region_path(&self, coord: RegionCoord, ext: &str) -> PathBuf {
        self.root.join(coord.file_name(ext))
    }

    fn existing_region_path(&self, coord: RegionCoord) -> Option<PathBuf> {
        let lrf = self.region_path(coord, "lrf");
        if lrf.exists() {
            return Some(lrf);
        }
        let mca = self.region_path(coord, "mca");
        if mca.exists() {
            return Some(mca);
        }
        None
    }

    /// Resolve `coord`'s handle, creating it on first access. Fails with
    /// [`StorageError::Closed`] once `close` or `close_region(coord)` has
    /// run; a closed manager/region stays closed rather than silently
    /// reopening on the next request.
    fn handle_for(&self, coord: RegionCoord) -> Result<Arc<RegionHandle>> {
        if self.closed.load(Ordering::SeqCst) || self.closed_regions.lock().contains(&coord) {
            return Err(StorageError::Closed);
        }

        let mut regions = self.regions.lock();
        if let Some(handle) = regions.get(&coord) {
            return Ok(Arc::clone(handle));
        }

        let mut path = self
            .existing_region_path(coord)
            .unwrap_or_else(|| match self.preferred_format {
                PreferredFormat::Lrf(_) => self.region_path(coord, "lrf"),
                PreferredFormat::Mca => self.region_path(coord, "mca"),
            });

        if self.config.auto_convert
            && self.config.conversion_mode == ConversionMode::OnDemand
            && path.exists()
        {
            let wrong_format = match self.preferred_format {
                PreferredFormat::Lrf(_) => path.extension().and_then(|e| e.to_str()) == Some("mca"),
                PreferredFormat::Mca => path.extension().and_then(|e| e.to_str()) == Some("lrf"),
            };
            if wrong_format {
                let target = match self.preferred_format {
                    PreferredFormat::Lrf(algo) => ConversionTarget::Lrf(algo),
                    PreferredFormat::Mca => ConversionTarget::Mca,
                };
                let converter = RegionConverter::new(Arc::clone(&self.codec), Arc::clone(&self.stats));
                match converter.convert_region_in_place(&path, target) {
                    Ok(new_path) => path = new_path,
                    Err(e) => warn!(path = %path.display(), error = %e, "on-demand conversion failed"),
                }
            }
        }

        let backend = RegionBackend::open(&path).ok().map(Arc::new);

        let save_format = match path.extension().and_then(|e| e.to_str()) {
            Some("mca") => SaveFormat::Mca,
            _ => match self.preferred_format {
                PreferredFormat::Lrf(algo) => SaveFormat::Lrf(algo),
                PreferredFormat::Mca => SaveFormat::Mca,
            },
        };

        let loader = BatchLoader::new(self.config.loader.clone().into())
            .expect("thread pool construction should not fail under reasonable config");
        let saver = BatchSaver::new(
            path,
            Arc::clone(&self.codec),
            save_format,
            self.config.saver.clone().into(),
        )
        .expect("thread pool construction should not fail under reasonable config");

        let validator = Arc::new(IntegrityValidator::new(
            self.config.integrity.retries,
            self.config.integrity.retries_speculative,
            self.config.integrity.backoff(),
        ));
        saver.set_validator(Arc::clone(&validator));

        let handle = Arc::new(RegionHandle {
            backend: Mutex::new(backend),
            loader,
            saver,
            validator,
        });
        regions.insert(coord, Arc::clone(&handle));
        Ok(handle)
    }

    /// Load a chunk, honoring read-your-writes: a pending (not yet
    /// flushed) save for `(cx, cz)` is returned before consulting disk.
    pub fn load_chunk(&self, cx: i32, cz: i32) -> Result<Option<ChunkEntry>> {
        let coord = RegionCoord::of_chunk(cx, cz);
        let handle = self.handle_for(coord)?;

        if let Some(pending) = handle.saver.peek_pending(cx, cz) {
            StorageStats::incr(&self.stats.chunks_loaded);
            StorageStats::incr(&self.stats.cache_hits);
            return Ok(Some(pending));
        }

        let backend = { handle.backend.lock().clone() };
        let Some(backend) = backend else {
            return Ok(None);
        };

        let path = backend.path();
        let mmap = if self.config.mmap.enabled {
            if self.mmap_cache.contains(&path) {
                StorageStats::incr(&self.stats.prefetch_hits);
            }
            self.mmap_cache.get_or_map(&path).ok()
        } else {
            None
        };

        let Some(pending) = handle
            .loader
            .request(Arc::clone(&backend), Arc::clone(&self.codec), mmap, cx, cz)
        else {
            StorageStats::incr(&self.stats.backpressure_rejections);
            return Ok(None);
        };
        let loaded = pending.wait().unwrap_or(Ok(None))?;

        if let Some(entry) = &loaded {
            if self.config.integrity.enabled {
                let report = handle
                    .validator
                    .validate(entry.cx, entry.cz, &entry.payload, false);
                match report {
                    ValidationReport::Repairable => StorageStats::incr(&self.stats.integrity_repairs),
                    ValidationReport::Corrupted => {
                        StorageStats::incr(&self.stats.integrity_corruptions);
                        warn!(cx, cz, "chunk failed integrity validation");
                    }
                    _ => {}
                }
            }
            StorageStats::incr(&self.stats.chunks_loaded);
            StorageStats::incr(&self.stats.cache_misses);
        }

        Ok(loaded)
    }

    /// Queue a chunk write. The returned future resolves once the batch
    /// containing this write (or a superseding later write) is flushed.
    pub fn save_chunk(&self, cx: i32, cz: i32, payload: Vec<u8>, timestamp_ms: u64) -> PendingResult<Result<()>> {
        let coord = RegionCoord::of_chunk(cx, cz);
        let handle = match self.handle_for(coord) {
            Ok(handle) => handle,
            Err(e) => {
                let (completer, result) = pending();
                completer.complete(Err(e));
                return result;
            }
        };
        StorageStats::incr(&self.stats.chunks_saved);
        handle.saver.submit(ChunkEntry::new(cx, cz, payload, timestamp_ms))
    }

    /// Force-flush a region's pending writes and invalidate/refresh its
    /// cached mmap and backend so subsequent reads see the new bytes.
    pub fn flush_region(&self, coord: RegionCoord) -> Result<()> {
        let handle = {
            let regions = self.regions.lock();
            regions.get(&coord).cloned()
        };
        let Some(handle) = handle else {
            return Ok(());
        };
        handle.saver.flush()?;
        let path = handle.saver.path();
        self.mmap_cache.invalidate(&path);

        let refreshed = RegionBackend::open(&path).ok().map(Arc::new);
        if let Some(backend) = &refreshed {
            let _ = backend.refresh();
        }
        *handle.backend.lock() = refreshed;
        Ok(())
    }

    pub fn validate_region(&self, coord: RegionCoord) -> Result<Vec<(i32, i32, ValidationReport)>> {
        let handle = self.handle_for(coord)?;
        let backend = { handle.backend.lock().clone() };
        let Some(backend) = backend else {
            return Ok(Vec::new());
        };

        let mut reports = Vec::new();
        for (local_cx, local_cz) in backend.live_chunks() {
            let cx = coord.rx * 32 + local_cx;
            let cz = coord.rz * 32 + local_cz;
            if let Some(entry) = backend.read_chunk_entry(&self.codec, cx, cz)? {
                let report = handle.validator.validate(cx, cz, &entry.payload, false);
                reports.push((cx, cz, report));
            }
        }
        Ok(reports)
    }

    /// Flush and drop `coord`'s handle, then mark it closed: subsequent
    /// `load_chunk`/`save_chunk`/`validate_region` calls against it fail
    /// with [`StorageError::Closed`] instead of silently reopening it.
    pub fn close_region(&self, coord: RegionCoord) -> Result<()> {
        self.flush_region(coord)?;
        self.regions.lock().remove(&coord);
        self.closed_regions.lock().insert(coord);
        Ok(())
    }

    /// Flush and drop every open region, then mark the whole manager
    /// closed: every subsequent operation fails with
    /// [`StorageError::Closed`] rather than reopening regions on demand.
    pub fn close(&self) -> Result<()> {
        let coords: Vec<RegionCoord> = self.regions.lock().keys().copied().collect();
        for coord in coords {
            self.flush_region(coord)?;
            self.regions.lock().remove(&coord);
        }
        self.closed.store(true, Ordering::SeqCst);
        info!(root = %self.root.display(), "storage manager closed");
        Ok(())
    }

    /// Whether `close` has been called on this manager.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mmap_cache(&self) -> &MmapReadAhead {
        &self.mmap_cache
    }

    /// Record a viewer's position for movement-based prediction. Call this
    /// on every position update; [`Self::prefetch_for_viewer`] turns the
    /// accumulated history into concrete region read-ahead.
    pub fn observe_viewer(&self, viewer_id: u64, cx: f64, cz: f64, at: std::time::Instant) {
        self.viewer_intent.observe(viewer_id, cx, cz, at);
    }

    /// Map the chunks [`crate::intent::IntentPredictor`] expects `viewer_id`
    /// to need next onto their region files and warm the mmap cache for
    /// them. When the predictor has nothing to offer (no history yet, or
    /// the viewer is judged stationary), falls back to a square of regions
    /// around their last known position. Existing region files only; a
    /// predicted chunk whose region hasn't been created yet is silently
    /// skipped.
    pub fn prefetch_for_viewer(&self, viewer_id: u64) {
        let mut paths: Vec<PathBuf> = match self.viewer_intent.prefetch_targets(viewer_id) {
            Some(targets) => targets
                .into_iter()
                .filter_map(|(cx, cz)| self.existing_region_path(RegionCoord::of_chunk(cx, cz)))
                .collect(),
            None => {
                let Some((cx, cz)) = self.viewer_intent.last_position(viewer_id) else {
                    return;
                };
                let center = RegionCoord::of_chunk(cx, cz);
                let radius = self.mmap_cache.prefetch_radius();
                let mut square = Vec::new();
                for dz in -radius..=radius {
                    for dx in -radius..=radius {
                        let coord = RegionCoord {
                            rx: center.rx + dx,
                            rz: center.rz + dz,
                        };
                        if let Some(path) = self.existing_region_path(coord) {
                            square.push(path);
                        }
                    }
                }
                square
            }
        };
        paths.sort();
        paths.dedup();
        if !paths.is_empty() {
            self.mmap_cache.prefetch(&paths);
        }
    }

    /// Drop a viewer's movement history, e.g. on disconnect.
    pub fn forget_viewer(&self, viewer_id: u64) {
        self.viewer_intent.forget(viewer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::mca::McaWriter;
    use tempfile::tempdir;

    #[test]
    fn closed_region_rejects_further_access() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::open(dir.path(), StorageConfig::default());
        let coord = RegionCoord::of_chunk(3, 4);

        manager.save_chunk(3, 4, vec![9u8; 64], 1_700_000_000_000).wait().unwrap().unwrap();
        manager.close_region(coord).unwrap();

        assert!(matches!(manager.load_chunk(3, 4), Err(crate::error::StorageError::Closed)));
        let result = manager.save_chunk(3, 4, vec![1u8; 8], 1_700_000_000_001);
        assert!(matches!(result.wait().unwrap(), Err(crate::error::StorageError::Closed)));
    }

    #[test]
    fn closed_manager_rejects_every_region() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::open(dir.path(), StorageConfig::default());

        manager.save_chunk(3, 4, vec![9u8; 64], 1_700_000_000_000).wait().unwrap().unwrap();
        manager.close().unwrap();

        assert!(manager.is_closed());
        assert!(matches!(manager.load_chunk(3, 4), Err(crate::error::StorageError::Closed)));
        assert!(matches!(
            manager.load_chunk(100, 100),
            Err(crate::error::StorageError::Closed)
        ));
    }

    #[test]
    fn save_then_load_round_trips_via_pending_buffer() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::open(dir.path(), StorageConfig::default());

        let result = manager.save_chunk(3, 4, vec![9u8; 64], 1_700_000_000_000);
        let loaded = manager.load_chunk(3, 4).unwrap().unwrap();
        assert_eq!(loaded.payload, vec![9u8; 64]);

        manager.flush_region(RegionCoord::of_chunk(3, 4)).unwrap();
        result.wait().unwrap().unwrap();

        let reloaded = manager.load_chunk(3, 4).unwrap().unwrap();
        assert_eq!(reloaded.payload, vec![9u8; 64]);
    }

    #[test]
    fn missing_region_loads_as_none() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::open(dir.path(), StorageConfig::default());
        assert!(manager.load_chunk(0, 0).unwrap().is_none());
    }

    #[test]
    fn reload_after_flush_warms_the_mmap_cache() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::open(dir.path(), StorageConfig::default());

        let result = manager.save_chunk(3, 4, vec![7u8; 64], 1_700_000_000_000);
        manager.flush_region(RegionCoord::of_chunk(3, 4)).unwrap();
        result.wait().unwrap().unwrap();

        assert_eq!(manager.mmap_cache().len(), 0);
        let first = manager.load_chunk(3, 4).unwrap().unwrap();
        assert_eq!(first.payload, vec![7u8; 64]);
        assert_eq!(manager.mmap_cache().len(), 1);

        let before = manager.stats().prefetch_hits;
        let second = manager.load_chunk(3, 4).unwrap().unwrap();
        assert_eq!(second.payload, vec![7u8; 64]);
        assert_eq!(manager.stats().prefetch_hits, before + 1);
    }

    #[test]
    fn viewer_intent_prefetch_warms_regions_ahead_of_movement() {
        let dir = tempdir().unwrap();
        let manager = StorageManager::open(dir.path(), StorageConfig::default());

        let result = manager.save_chunk(40, 40, vec![1u8; 16], 1_700_000_000_000);
        manager.flush_region(RegionCoord::of_chunk(40, 40)).unwrap();
        result.wait().unwrap().unwrap();

        let now = std::time::Instant::now();
        manager.observe_viewer(1, 40.0, 40.0, now);
        manager.observe_viewer(1, 40.0, 40.0, now);
        manager.prefetch_for_viewer(1);
        assert_eq!(manager.mmap_cache().len(), 1);
        manager.forget_viewer(1);
    }

    #[test]
    fn on_demand_conversion_mode_migrates_mca_to_lrf_on_first_open() {
        let dir = tempdir().unwrap();
        let codec = Codec::default();
        McaWriter::flush(
            &dir.path().join("r.0.0.mca"),
            &codec,
            &[ChunkEntry::new(0, 0, vec![5u8; 32], 1_700_000_000_000)],
        )
        .unwrap();

        let mut config = StorageConfig::default();
        config.auto_convert = true;
        config.conversion_mode = ConversionMode::OnDemand;
        let manager = StorageManager::open(dir.path(), config);

        let loaded = manager.load_chunk(0, 0).unwrap().unwrap();
        assert_eq!(loaded.payload, vec![5u8; 32]);
        assert!(dir.path().join("r.0.0.lrf").exists());
        assert!(!dir.path().join("r.0.0.mca").exists());
    }

    #[test]
    fn full_lrf_conversion_mode_migrates_everything_at_startup() {
        let dir = tempdir().unwrap();
        let codec = Codec::default();
        McaWriter::flush(
            &dir.path().join("r.1.1.mca"),
            &codec,
            &[ChunkEntry::new(33, 33, vec![6u8; 32], 1_700_000_000_000)],
        )
        .unwrap();

        let mut config = StorageConfig::default();
        config.auto_convert = true;
        config.conversion_mode = ConversionMode::FullLrf;
        let _manager = StorageManager::open(dir.path(), config);

        assert!(dir.path().join("r.1.1.lrf").exists());
        assert!(!dir.path().join("r.1.1.mca").exists());
    }
}
