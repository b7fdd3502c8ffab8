//! Frame timing statistics.

use std::time::{Duration, Instant};

/// FPS tracking over a run.
#[derive(Debug, Clone)]
pub struct FrameStats {
    frames: u64,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
    last_frame: Option<Instant>,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            frames: 0,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
            last_frame: None,
        }
    }
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a frame and return the time since the previous one.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let dt = self
            .last_frame
            .map_or(Duration::ZERO, |last| now.duration_since(last));
        self.last_frame = Some(now);
        self.record(dt);
        dt
    }

    /// Record one frame that took `dt`. Zero-length frames count but carry no rate.
    pub fn record(&mut self, dt: Duration) {
        self.frames += 1;
        let secs = dt.as_secs_f64();
        if secs > 0.0 {
            let fps = 1.0 / secs;
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn min_fps(&self) -> Option<f64> {
        (self.max_fps > 0.0).then_some(self.min_fps)
    }

    pub fn max_fps(&self) -> Option<f64> {
        (self.max_fps > 0.0).then_some(self.max_fps)
    }

    pub fn average_fps(&self) -> Option<f64> {
        (self.frames > 0 && self.fps_sum > 0.0).then(|| self.fps_sum / self.frames as f64)
    }

    /// Log the summary at info level.
    pub fn log_summary(&self) {
        if self.frames == 0 {
            return;
        }
        tracing::info!("FPS Statistics:");
        if let (Some(min), Some(max), Some(avg)) =
            (self.min_fps(), self.max_fps(), self.average_fps())
        {
            tracing::info!("  Min: {min:.1}");
            tracing::info!("  Max: {max:.1}");
            tracing::info!("  Avg: {avg:.1}");
        }
        tracing::info!("  Total frames: {}", self.frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn empty_stats_have_no_rates() {
        let stats = FrameStats::new();
        assert_eq!(stats.frames(), 0);
        assert!(stats.min_fps().is_none());
        assert!(stats.average_fps().is_none());
    }

    #[test]
    fn rates_follow_frame_times() {
        let mut stats = FrameStats::new();
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(20));
        stats.record(Duration::ZERO);
        assert_eq!(stats.frames(), 3);
        assert_relative_eq!(stats.max_fps().unwrap(), 100.0, epsilon = 1e-9);
        assert_relative_eq!(stats.min_fps().unwrap(), 50.0, epsilon = 1e-9);
        assert_relative_eq!(stats.average_fps().unwrap(), 50.0, epsilon = 1e-9);
    }
}
