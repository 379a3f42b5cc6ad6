//! Runtime configuration, loaded from TOML and falling back to the
//! engine's documented defaults (spec §4/§6) when a field is omitted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::{BatchLoaderConfig, BatchSaverConfig};
use crate::codec::Algorithm;
use crate::error::Result;
use crate::intent::IntentPredictorConfig;
use crate::mmap_cache::MmapReadAheadConfig;

/// Output format for newly-created regions (`storage.format`). Existing
/// files on disk keep whatever format they were found in regardless of
/// this setting; see [`crate::convert::RegionConverter`] for migrating them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FormatPreference {
    #[default]
    Auto,
    Lrf,
    Mca,
}

/// When and how `storage.auto-convert` migrates files between formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConversionMode {
    /// Never convert automatically; callers drive
    /// [`crate::convert::RegionConverter`] themselves.
    #[default]
    Manual,
    /// Convert a region to the preferred format the first time it's opened.
    OnDemand,
    /// Convert opportunistically via [`crate::scheduler::BackgroundScheduler`]
    /// during idle periods.
    Background,
    /// Convert every region under the root to LRF once, at startup.
    FullLrf,
}

fn default_retries() -> u32 {
    2
}

fn default_retries_speculative() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub enabled: bool,
    pub retries: u32,
    pub retries_speculative: u32,
    pub backoff_ms: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retries: default_retries(),
            retries_speculative: default_retries_speculative(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl IntegrityConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub io_threads: usize,
    pub decompress_threads: usize,
    pub max_in_flight: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let d = BatchLoaderConfig::default();
        Self {
            io_threads: d.io_threads,
            decompress_threads: d.decompress_threads,
            max_in_flight: d.max_in_flight,
        }
    }
}

impl From<LoaderConfig> for BatchLoaderConfig {
    fn from(c: LoaderConfig) -> Self {
        Self {
            io_threads: c.io_threads,
            decompress_threads: c.decompress_threads,
            max_in_flight: c.max_in_flight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaverConfig {
    pub compress_threads: usize,
    pub max_batch_size: usize,
    pub flush_delay_ms: u64,
}

impl Default for SaverConfig {
    fn default() -> Self {
        let d = BatchSaverConfig::default();
        Self {
            compress_threads: d.compress_threads,
            max_batch_size: d.max_batch_size,
            flush_delay_ms: d.flush_delay.as_millis() as u64,
        }
    }
}

impl From<SaverConfig> for BatchSaverConfig {
    fn from(c: SaverConfig) -> Self {
        Self {
            compress_threads: c.compress_threads,
            max_batch_size: c.max_batch_size,
            flush_delay: Duration::from_millis(c.flush_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MmapConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub max_resident_bytes: usize,
    pub soft_ttl_secs: u64,
    /// Square radius (in regions) used by a static, non-intent-driven
    /// prefetch around a center region; see `storage.mmap.prefetch-radius`.
    pub prefetch_radius: i32,
}

impl Default for MmapConfig {
    fn default() -> Self {
        let d = MmapReadAheadConfig::default();
        Self {
            enabled: true,
            max_entries: d.max_entries,
            max_resident_bytes: d.max_resident_bytes,
            soft_ttl_secs: d.soft_ttl.as_secs(),
            prefetch_radius: d.prefetch_radius,
        }
    }
}

impl From<MmapConfig> for MmapReadAheadConfig {
    fn from(c: MmapConfig) -> Self {
        Self {
            max_entries: c.max_entries,
            max_resident_bytes: c.max_resident_bytes,
            soft_ttl: Duration::from_secs(c.soft_ttl_secs),
            prefetch_radius: c.prefetch_radius,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    pub max_history: usize,
    pub history_window_ms: u64,
    pub base_lookahead_chunks: f64,
    pub half_width_chunks: f64,
    pub boost_speed_threshold: f64,
    pub boost_multiplier: f64,
    pub base_multiplier: f64,
}

impl Default for IntentConfig {
    fn default() -> Self {
        let d = IntentPredictorConfig::default();
        Self {
            max_history: d.max_history,
            history_window_ms: d.history_window.as_millis() as u64,
            base_lookahead_chunks: d.base_lookahead_chunks,
            half_width_chunks: d.half_width_chunks,
            boost_speed_threshold: d.boost_speed_threshold,
            boost_multiplier: d.boost_multiplier,
            base_multiplier: d.base_multiplier,
        }
    }
}

impl From<IntentConfig> for IntentPredictorConfig {
    fn from(c: IntentConfig) -> Self {
        Self {
            max_history: c.max_history,
            history_window: Duration::from_millis(c.history_window_ms),
            base_lookahead_chunks: c.base_lookahead_chunks,
            half_width_chunks: c.half_width_chunks,
            boost_speed_threshold: c.boost_speed_threshold,
            boost_multiplier: c.boost_multiplier,
            base_multiplier: c.base_multiplier,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub idle_threshold_ms: u64,
    pub tick_interval_ms: u64,
    pub regions_per_tick: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: 2_000,
            tick_interval_ms: 500,
            regions_per_tick: 1,
        }
    }
}

/// Top-level engine configuration. Every field has a documented default so
/// a `StorageConfig::default()` (or an empty TOML document) produces a
/// fully working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    pub format: FormatPreference,
    pub conversion_mode: ConversionMode,
    pub auto_convert: bool,
    pub compression_algorithm: CompressionAlgorithmConfig,
    /// Abandon a stuck LRF lock/seek after this many seconds. Not currently
    /// enforced by `LrfReader`/`LrfWriter`, which don't hold long-lived
    /// locks; kept as an accepted, forward-compatible knob.
    pub lrf_timeout_seconds: u64,
    pub verbose: bool,
    pub integrity: IntegrityConfig,
    pub loader: LoaderConfig,
    pub saver: SaverConfig,
    pub mmap: MmapConfig,
    pub intent: IntentConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            format: FormatPreference::default(),
            conversion_mode: ConversionMode::default(),
            auto_convert: false,
            compression_algorithm: CompressionAlgorithmConfig::default(),
            lrf_timeout_seconds: 30,
            verbose: false,
            integrity: IntegrityConfig::default(),
            loader: LoaderConfig::default(),
            saver: SaverConfig::default(),
            mmap: MmapConfig::default(),
            intent: IntentConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressionAlgorithmConfig(pub Algorithm);

impl Default for CompressionAlgorithmConfig {
    fn default() -> Self {
        Self(Algorithm::Zstd)
    }
}

impl StorageConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| crate::error::StorageError::InvalidFormat(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_all_defaults() {
        let cfg = StorageConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.integrity.retries, 2);
        assert_eq!(cfg.loader.max_in_flight, BatchLoaderConfig::default().max_in_flight);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let cfg = StorageConfig::from_toml_str("[mmap]\nmax_entries = 8\n").unwrap();
        assert_eq!(cfg.mmap.max_entries, 8);
        assert_eq!(cfg.mmap.max_resident_bytes, MmapConfig::default().max_resident_bytes);
    }

    #[test]
    fn top_level_knobs_parse_from_toml() {
        let cfg = StorageConfig::from_toml_str(
            "format = \"mca\"\nconversion-mode = \"full-lrf\"\nauto-convert = true\ncompression-algorithm = \"lz4\"\nverbose = true\n",
        )
        .unwrap();
        assert_eq!(cfg.format, FormatPreference::Mca);
        assert_eq!(cfg.conversion_mode, ConversionMode::FullLrf);
        assert!(cfg.auto_convert);
        assert_eq!(cfg.compression_algorithm.0, Algorithm::Lz4);
        assert!(cfg.verbose);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = StorageConfig::default();
        assert_eq!(cfg.format, FormatPreference::Auto);
        assert_eq!(cfg.conversion_mode, ConversionMode::Manual);
        assert!(!cfg.auto_convert);
        assert_eq!(cfg.compression_algorithm.0, Algorithm::Zstd);
        assert!(cfg.integrity.enabled);
        assert!(cfg.mmap.enabled);
        assert_eq!(cfg.mmap.prefetch_radius, 2);
    }
}
