//! Per-iteration latency and FPS with outlier rejection.
//!
//! Samples at or above the threshold are dropped entirely, so a cold start
//! does not drag the average. A sustained slowdown above the threshold is
//! dropped the same way and will not show up in the report.

use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsReport {
    pub average_latency: Duration,
    pub fps: f64,
    pub samples: u64,
}

impl fmt::Display for FpsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "avg {:.1}ms/frame, {:.1} FPS ({} samples)",
            self.average_latency.as_secs_f64() * 1000.0,
            self.fps,
            self.samples
        )
    }
}

#[derive(Debug, Clone)]
pub struct ThroughputCounter {
    threshold: Duration,
    started: Option<Instant>,
    runtime: Duration,
    frames: u64,
}

impl ThroughputCounter {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            started: None,
            runtime: Duration::ZERO,
            frames: 0,
        }
    }

    pub fn from_secs(threshold_secs: f64) -> Self {
        Self::new(Duration::from_secs_f64(threshold_secs.max(0.0)))
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// 計測開始
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Measure since the last `start`/`count` and re-arm. Returns whether the
    /// sample was counted.
    pub fn count(&mut self) -> bool {
        let counted = match self.started {
            Some(started) => self.record(started.elapsed()),
            None => false,
        };
        self.start();
        counted
    }

    /// Account for an externally measured sample.
    pub fn record(&mut self, elapsed: Duration) -> bool {
        if elapsed < self.threshold {
            self.runtime += elapsed;
            self.frames += 1;
            true
        } else {
            false
        }
    }

    /// `None` until a sample has been counted.
    pub fn fps(&self) -> Option<FpsReport> {
        if self.frames == 0 || self.runtime.is_zero() {
            return None;
        }
        let secs = self.runtime.as_secs_f64();
        Some(FpsReport {
            average_latency: Duration::from_secs_f64(secs / self.frames as f64),
            fps: self.frames as f64 / secs,
            samples: self.frames,
        })
    }

    pub fn reset(&mut self) {
        self.started = None;
        self.runtime = Duration::ZERO;
        self.frames = 0;
    }

    pub fn is_timing(&self) -> bool {
        self.started.is_some()
    }

    pub fn samples(&self) -> u64 {
        self.frames
    }

    pub fn total(&self) -> Duration {
        self.runtime
    }
}
