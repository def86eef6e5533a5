//! Frame health monitor.
//!
//! A failing sensor or a broken MJPEG decode path tends to produce frames
//! with a heavily dominant green channel. The monitor samples a decimated
//! pixel grid per frame and reports degeneracy only after it has been
//! sustained, so a couple of genuinely green frames never trip recovery.

use std::time::{Duration, Instant};

use log::warn;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Green mean must exceed red and blue means by this factor
    pub green_ratio: f32,
    /// Green mean floor; dark frames are not judged
    pub min_green: f32,
    /// Sample every Nth pixel
    pub sample_step: usize,
    /// Degeneracy must persist this long before it is reported
    pub sustain: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            green_ratio: 2.0,
            min_green: 90.0,
            sample_step: 16,
            sustain: Duration::from_millis(2500),
        }
    }
}

/// Tracks green-channel dominance across frames
pub struct FrameHealthMonitor {
    config: HealthConfig,
    degenerate_since: Option<Instant>,
}

impl FrameHealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            degenerate_since: None,
        }
    }

    /// Feed one decoded RGB frame (packed 8-bit triplets). Returns true
    /// once degeneracy has been sustained past the configured window.
    pub fn observe(&mut self, rgb: &[u8], now: Instant) -> bool {
        if !self.frame_is_degenerate(rgb) {
            self.degenerate_since = None;
            return false;
        }
        let since = *self.degenerate_since.get_or_insert(now);
        let sustained = now.duration_since(since) >= self.config.sustain;
        if sustained {
            warn!("health: green-dominant stream sustained past threshold");
        }
        sustained
    }

    /// Forget any in-progress degeneracy window, for use after a stream
    /// reinit
    pub fn reset(&mut self) {
        self.degenerate_since = None;
    }

    fn frame_is_degenerate(&self, rgb: &[u8]) -> bool {
        let pixels = rgb.len() / 3;
        if pixels == 0 {
            return false;
        }
        let mut sums = [0u64; 3];
        let mut count = 0u64;
        for i in (0..pixels).step_by(self.config.sample_step.max(1)) {
            let base = i * 3;
            sums[0] += rgb[base] as u64;
            sums[1] += rgb[base + 1] as u64;
            sums[2] += rgb[base + 2] as u64;
            count += 1;
        }
        let r = sums[0] as f32 / count as f32;
        let g = sums[1] as f32 / count as f32;
        let b = sums[2] as f32 / count as f32;
        g > self.config.min_green && g > r * self.config.green_ratio && g > b * self.config.green_ratio
    }
}
