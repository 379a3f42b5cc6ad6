//! Idle-gated background scheduler driving [`crate::convert::RegionConverter`]
//! in small batches so migration never competes with foreground I/O.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::convert::{ConversionReport, ConversionTarget, RegionConverter};

/// Supplies how long the system has been idle. Injected rather than
/// measured internally so callers can drive it from whatever signal fits
/// their host (player activity, request rate, a test clock).
pub type IdleTimeProvider = Arc<dyn Fn() -> Duration + Send + Sync>;

#[derive(Clone)]
pub struct SchedulerConfig {
    pub idle_threshold: Duration,
    pub tick_interval: Duration,
    pub regions_per_tick: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(2),
            tick_interval: Duration::from_millis(500),
            regions_per_tick: 1,
        }
    }
}

impl From<crate::config::SchedulerConfig> for SchedulerConfig {
    fn from(c: crate::config::SchedulerConfig) -> Self {
        Self {
            idle_threshold: Duration::from_millis(c.idle_threshold_ms),
            tick_interval: Duration::from_millis(c.tick_interval_ms),
            regions_per_tick: c.regions_per_tick,
        }
    }
}

/// Runs migration work on a dedicated thread whenever the injected idle
/// signal reports at least `idle_threshold` of quiet time, processing at
/// most `regions_per_tick` files per wakeup.
pub struct BackgroundScheduler {
    config: SchedulerConfig,
    idle_time: IdleTimeProvider,
    converter: Arc<RegionConverter>,
    dir: PathBuf,
    target: ConversionTarget,
    running: Arc<AtomicBool>,
    handle: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl BackgroundScheduler {
    pub fn new(
        config: SchedulerConfig,
        idle_time: IdleTimeProvider,
        converter: Arc<RegionConverter>,
        dir: PathBuf,
        target: ConversionTarget,
    ) -> Self {
        Self {
            config,
            idle_time,
            converter,
            dir,
            target,
            running: Arc::new(AtomicBool::new(false)),
            handle: std::sync::Mutex::new(None),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = Arc::clone(&self.running);
        let idle_time = Arc::clone(&self.idle_time);
        let converter = Arc::clone(&self.converter);
        let dir = self.dir.clone();
        let target = self.target;
        let config = self.config.clone();

        let join = std::thread::Builder::new()
            .name("turbo-region-scheduler".into())
            .spawn(move || {
                info!(dir = %dir.display(), "background conversion scheduler started");
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(config.tick_interval);
                    if idle_time() < config.idle_threshold {
                        continue;
                    }
                    let report = run_batch(&converter, &dir, target, config.regions_per_tick);
                    if !report.converted.is_empty() || !report.errors.is_empty() {
                        debug!(
                            converted = report.converted.len(),
                            errors = report.errors.len(),
                            "background conversion tick"
                        );
                    }
                }
            })
            .expect("spawning the scheduler thread should not fail");
        *self.handle.lock().unwrap() = Some(join);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for BackgroundScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_batch(
    converter: &RegionConverter,
    dir: &std::path::Path,
    target: ConversionTarget,
    limit: usize,
) -> ConversionReport {
    converter.convert_directory_limited(dir, target, Some(limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkEntry;
    use crate::codec::{Algorithm, Codec};
    use crate::format::mca::McaWriter;
    use crate::stats::StorageStats;
    use tempfile::tempdir;

    #[test]
    fn never_idle_means_no_conversion_runs() {
        let dir = tempdir().unwrap();
        let codec = Arc::new(Codec::default());
        McaWriter::flush(
            &dir.path().join("r.0.0.mca"),
            &codec,
            &[ChunkEntry::new(0, 0, vec![1; 32], 1)],
        )
        .unwrap();

        let converter = Arc::new(RegionConverter::new(codec, Arc::new(StorageStats::default())));
        let scheduler = BackgroundScheduler::new(
            SchedulerConfig {
                idle_threshold: Duration::from_secs(3600),
                tick_interval: Duration::from_millis(20),
                regions_per_tick: 4,
            },
            Arc::new(|| Duration::from_secs(0)),
            converter,
            dir.path().to_path_buf(),
            ConversionTarget::Lrf(Algorithm::Zlib),
        );
        scheduler.start();
        std::thread::sleep(Duration::from_millis(100));
        scheduler.stop();

        assert!(dir.path().join("r.0.0.mca").exists());
    }

    #[test]
    fn idle_signal_triggers_conversion() {
        let dir = tempdir().unwrap();
        let codec = Arc::new(Codec::default());
        McaWriter::flush(
            &dir.path().join("r.0.0.mca"),
            &codec,
            &[ChunkEntry::new(0, 0, vec![1; 32], 1)],
        )
        .unwrap();

        let converter = Arc::new(RegionConverter::new(codec, Arc::new(StorageStats::default())));
        let scheduler = BackgroundScheduler::new(
            SchedulerConfig {
                idle_threshold: Duration::from_millis(1),
                tick_interval: Duration::from_millis(10),
                regions_per_tick: 4,
            },
            Arc::new(|| Duration::from_secs(10)),
            converter,
            dir.path().to_path_buf(),
            ConversionTarget::Lrf(Algorithm::Zlib),
        );
        scheduler.start();
        std::thread::sleep(Duration::from_millis(200));
        scheduler.stop();

        assert!(dir.path().join("r.0.0.lrf").exists());
    }
}
