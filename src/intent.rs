//! Velocity-weighted movement prediction, used by [`crate::mmap_cache::MmapReadAhead`]
//! to prefetch regions ahead of where a viewer is heading rather than just
//! around where they currently are.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A single observed position, chunk coordinates at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct PositionSample {
    pub cx: f64,
    pub cz: f64,
    pub at: Instant,
}

/// A projected rectangle of chunks likely to be visited soon: a band
/// extending `lookahead` chunks ahead of the last sample along the
/// velocity vector, `half_width` chunks wide perpendicular to it.
#[derive(Debug, Clone, Copy)]
pub struct ProbabilityTunnel {
    pub origin_cx: f64,
    pub origin_cz: f64,
    pub dir_x: f64,
    pub dir_z: f64,
    pub lookahead: f64,
    pub half_width: f64,
}

impl ProbabilityTunnel {
    pub fn contains(&self, cx: i32, cz: i32) -> bool {
        let dx = cx as f64 - self.origin_cx;
        let dz = cz as f64 - self.origin_cz;
        let along = dx * self.dir_x + dz * self.dir_z;
        if along < 0.0 || along > self.lookahead {
            return false;
        }
        let perp = (dx * -self.dir_z + dz * self.dir_x).abs();
        perp <= self.half_width
    }
}

/// Speed below which a viewer is judged stationary, in chunks/sec.
const STATIONARY_SPEED: f64 = 0.1;

/// Hard ceiling on the projected lookahead, regardless of speed.
const MAX_LOOKAHEAD_CHUNKS: f64 = 64.0;

#[derive(Debug, Clone, Copy)]
pub struct IntentPredictorConfig {
    /// Hard cap on retained samples, independent of `history_window`.
    pub max_history: usize,
    /// Samples older than this relative to the most recent one are pruned
    /// on every `observe`, so a predictor fed at a steady rate naturally
    /// forgets motion from several seconds ago rather than carrying it
    /// forward until `max_history` fills up.
    pub history_window: Duration,
    pub base_lookahead_chunks: f64,
    pub half_width_chunks: f64,
    /// Speed (chunks/sec) above which the "boost" (elytra/sprint) lookahead
    /// multiplier applies.
    pub boost_speed_threshold: f64,
    pub boost_multiplier: f64,
    /// Multiplier applied below `boost_speed_threshold` but above
    /// `STATIONARY_SPEED` — ordinary walking still warrants a little more
    /// lookahead than the unmultiplied base.
    pub base_multiplier: f64,
}

impl Default for IntentPredictorConfig {
    fn default() -> Self {
        Self {
            max_history: 100,
            history_window: Duration::from_millis(3000),
            base_lookahead_chunks: 6.0,
            half_width_chunks: 2.0,
            boost_speed_threshold: 1.5,
            boost_multiplier: 2.0,
            base_multiplier: 1.2,
        }
    }
}

/// Tracks recent position samples for one viewer and projects a prefetch
/// region from their velocity trend.
pub struct IntentPredictor {
    config: IntentPredictorConfig,
    samples: VecDeque<PositionSample>,
}

impl IntentPredictor {
    pub fn new(config: IntentPredictorConfig) -> Self {
        Self {
            config,
            samples: VecDeque::with_capacity(config.max_history.min(64)),
        }
    }

    pub fn observe(&mut self, cx: f64, cz: f64, at: Instant) {
        self.samples.push_back(PositionSample { cx, cz, at });

        while self.samples.len() > 1 {
            let oldest = self.samples.front().unwrap();
            if at.saturating_duration_since(oldest.at) > self.config.history_window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.config.max_history {
            self.samples.pop_front();
        }
    }

    /// Project where this viewer is heading from a weighted trend over the
    /// whole retained history rather than just the oldest and newest
    /// sample: each consecutive pair's velocity is weighted linearly toward
    /// the most recent pairs, so a viewer who turns mid-history is picked
    /// up faster than a plain first-to-last average would manage. Returns
    /// `None` when there isn't enough history or the viewer is effectively
    /// stationary; callers should fall back to a square radius around the
    /// last sample in that case.
    pub fn predict(&self) -> Option<ProbabilityTunnel> {
        if self.samples.len() < 2 {
            return None;
        }

        let mut weighted_vx = 0.0;
        let mut weighted_vz = 0.0;
        let mut weight_total = 0.0;

        for (i, (prev, cur)) in self.samples.iter().zip(self.samples.iter().skip(1)).enumerate() {
            let dt = cur.at.saturating_duration_since(prev.at).as_secs_f64();
            if dt <= 0.0 {
                continue;
            }
            let weight = (i + 1) as f64;
            weighted_vx += ((cur.cx - prev.cx) / dt) * weight;
            weighted_vz += ((cur.cz - prev.cz) / dt) * weight;
            weight_total += weight;
        }

        if weight_total <= 0.0 {
            return None;
        }

        let vx = weighted_vx / weight_total;
        let vz = weighted_vz / weight_total;
        let speed = (vx * vx + vz * vz).sqrt();
        if speed < STATIONARY_SPEED {
            return None;
        }

        let multiplier = if speed >= self.config.boost_speed_threshold {
            self.config.boost_multiplier
        } else {
            self.config.base_multiplier
        };
        let lookahead = (self.config.base_lookahead_chunks * multiplier).min(MAX_LOOKAHEAD_CHUNKS);

        let last = self.samples.back().unwrap();
        Some(ProbabilityTunnel {
            origin_cx: last.cx,
            origin_cz: last.cz,
            dir_x: vx / speed,
            dir_z: vz / speed,
            lookahead,
            half_width: self.config.half_width_chunks,
        })
    }

    /// Chunk coordinates to prefetch, or `None` when no tunnel can be
    /// projected; the caller (`MmapReadAhead::prefetch_square`) owns the
    /// stationary/no-history fallback.
    pub fn prefetch_targets(&self) -> Option<Vec<(i32, i32)>> {
        let last = self.samples.back()?;
        let tunnel = self.predict()?;

        let span = (tunnel.lookahead.ceil() as i32).max(1) + tunnel.half_width.ceil() as i32;
        let base_cx = last.cx.round() as i32;
        let base_cz = last.cz.round() as i32;
        let mut out = Vec::new();
        for dz in -span..=span {
            for dx in -span..=span {
                let cx = base_cx + dx;
                let cz = base_cz + dz;
                if tunnel.contains(cx, cz) {
                    out.push((cx, cz));
                }
            }
        }
        Some(out)
    }

    /// The last observed position, rounded to a chunk, for callers that
    /// need a center to fall back to when `prefetch_targets` returns `None`.
    pub fn last_position(&self) -> Option<(i32, i32)> {
        self.samples.back().map(|s| (s.cx.round() as i32, s.cz.round() as i32))
    }

    pub fn duration_since_last_sample(&self, now: Instant) -> Option<Duration> {
        self.samples.back().map(|s| now.saturating_duration_since(s.at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_history_returns_none() {
        let mut predictor = IntentPredictor::new(IntentPredictorConfig::default());
        predictor.observe(0.0, 0.0, Instant::now());
        assert!(predictor.predict().is_none());
    }

    #[test]
    fn steady_motion_projects_tunnel_ahead() {
        let mut predictor = IntentPredictor::new(IntentPredictorConfig::default());
        let t0 = Instant::now();
        predictor.observe(0.0, 0.0, t0);
        predictor.observe(5.0, 0.0, t0 + Duration::from_secs(1));
        let tunnel = predictor.predict().unwrap();
        assert!(tunnel.contains(10, 0));
        assert!(!tunnel.contains(-10, 0));
    }

    #[test]
    fn fast_motion_uses_boost_multiplier() {
        let mut predictor = IntentPredictor::new(IntentPredictorConfig::default());
        let t0 = Instant::now();
        predictor.observe(0.0, 0.0, t0);
        predictor.observe(50.0, 0.0, t0 + Duration::from_secs(1));
        let tunnel = predictor.predict().unwrap();
        assert!(tunnel.lookahead > IntentPredictorConfig::default().base_lookahead_chunks);
    }

    #[test]
    fn lookahead_is_capped_even_at_extreme_speed() {
        let mut predictor = IntentPredictor::new(IntentPredictorConfig {
            base_lookahead_chunks: 40.0,
            ..IntentPredictorConfig::default()
        });
        let t0 = Instant::now();
        predictor.observe(0.0, 0.0, t0);
        predictor.observe(10_000.0, 0.0, t0 + Duration::from_secs(1));
        let tunnel = predictor.predict().unwrap();
        assert_eq!(tunnel.lookahead, MAX_LOOKAHEAD_CHUNKS);
    }

    #[test]
    fn recent_samples_are_weighted_more_than_older_ones() {
        // A viewer that moved east then reversed to moving west should
        // have a trend dominated by the more recent, westward leg.
        let mut predictor = IntentPredictor::new(IntentPredictorConfig::default());
        let t0 = Instant::now();
        predictor.observe(0.0, 0.0, t0);
        predictor.observe(5.0, 0.0, t0 + Duration::from_secs(1));
        predictor.observe(0.0, 0.0, t0 + Duration::from_secs(2));
        let tunnel = predictor.predict().unwrap();
        assert!(tunnel.dir_x < 0.0);
    }

    #[test]
    fn stationary_viewer_yields_no_prediction() {
        let mut predictor = IntentPredictor::new(IntentPredictorConfig::default());
        let t0 = Instant::now();
        predictor.observe(4.0, 4.0, t0);
        predictor.observe(4.0, 4.0, t0 + Duration::from_secs(1));
        assert!(predictor.predict().is_none());
        assert!(predictor.prefetch_targets().is_none());
        assert_eq!(predictor.last_position(), Some((4, 4)));
    }

    #[test]
    fn old_samples_are_pruned_outside_the_history_window() {
        let mut predictor = IntentPredictor::new(IntentPredictorConfig {
            history_window: Duration::from_millis(500),
            ..IntentPredictorConfig::default()
        });
        let t0 = Instant::now();
        predictor.observe(0.0, 0.0, t0);
        predictor.observe(100.0, 0.0, t0 + Duration::from_secs(5));
        // The far-future sample's window should have pruned the t0 sample,
        // leaving only one and so no prediction possible.
        assert!(predictor.predict().is_none());
    }

    #[test]
    fn history_never_exceeds_max_history() {
        let mut predictor = IntentPredictor::new(IntentPredictorConfig {
            max_history: 4,
            history_window: Duration::from_secs(3600),
            ..IntentPredictorConfig::default()
        });
        let t0 = Instant::now();
        for i in 0..10 {
            predictor.observe(i as f64, 0.0, t0 + Duration::from_millis(i * 10));
        }
        assert_eq!(predictor.samples.len(), 4);
    }
}
