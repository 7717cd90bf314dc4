//! Real-time loop: acquire → infer → dispatch, one frame at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::camera::{Acquired, FrameSource};
use crate::config::RealtimeConfig;
use crate::frame::Frame;
use crate::inference::{infer_frame, DetectionBatch, InferenceGateway};
use crate::log;
use crate::logging::Logger;
use crate::throughput::{FpsReport, ThroughputCounter};

/// Size of the blank warm-up frames.
pub const WARMUP_FRAME_SIZE: u32 = 512;

/// Pause after the source had no frame.
pub const MISS_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkControl {
    Continue,
    Stop,
}

/// Receives every processed frame.
pub trait FrameSink {
    fn present(&mut self, frame: &Frame, detections: &DetectionBatch) -> Result<SinkControl>;

    /// Inference produced nothing usable for `frame`.
    fn failed(&mut self, frame: &Frame) -> Result<SinkControl>;
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub warmup_frames: usize,
    pub latency_threshold: Duration,
    pub fps_log_interval: Duration,
    pub miss_backoff: Duration,
}

impl From<&RealtimeConfig> for LoopOptions {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            warmup_frames: config.warmup_frames,
            latency_threshold: Duration::from_secs_f64(config.latency_threshold_secs.max(0.0)),
            fps_log_interval: Duration::from_secs_f64(config.fps_log_interval_secs.max(0.0)),
            miss_backoff: MISS_BACKOFF,
        }
    }
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    SourceClosed,
    SinkStopped,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct LoopSummary {
    pub frames: u64,
    pub failures: u64,
    pub misses: u64,
    pub stop_reason: StopReason,
    pub throughput: Option<FpsReport>,
}

pub struct RealtimeLoop<'a, G: InferenceGateway + ?Sized> {
    gateway: &'a mut G,
    options: LoopOptions,
    logger: Logger,
    stop: Option<Arc<AtomicBool>>,
    counter: ThroughputCounter,
}

impl<'a, G: InferenceGateway + ?Sized> RealtimeLoop<'a, G> {
    pub fn new(gateway: &'a mut G, options: LoopOptions, logger: Logger) -> Self {
        let counter = ThroughputCounter::new(options.latency_threshold);
        Self { gateway, options, logger, stop: None, counter }
    }

    /// External stop request (Ctrl-C), checked after every dispatch and every miss.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn counter(&self) -> &ThroughputCounter {
        &self.counter
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(|s| s.load(Ordering::Relaxed))
    }

    /// 初回呼び出しの初期化コストを計測から除外する。失敗したフレームは読み飛ばす
    pub fn warm_up(&mut self) -> Result<()> {
        let mut failed = 0usize;
        for i in 0..self.options.warmup_frames {
            let blank = Frame::blank(WARMUP_FRAME_SIZE, WARMUP_FRAME_SIZE, i as u64);
            if let Err(e) = infer_frame(&mut *self.gateway, &blank) {
                log!(self.logger, "[realtime] warm-up frame {} failed: {:#}", i, e);
                failed += 1;
            }
        }
        self.counter.reset();
        log!(
            self.logger,
            "[realtime] warm-up done ({} frames, {} failed)",
            self.options.warmup_frames,
            failed
        );
        Ok(())
    }

    pub fn run(&mut self, source: &mut dyn FrameSource, sink: &mut dyn FrameSink) -> Result<LoopSummary> {
        let mut frames = 0u64;
        let mut failures = 0u64;
        let mut misses = 0u64;
        let mut last_fps_log = Instant::now();

        let stop_reason = loop {
            let frame = match source.read()? {
                Acquired::Frame(frame) => frame,
                Acquired::Pending => {
                    misses += 1;
                    if self.stop_requested() {
                        break StopReason::Interrupted;
                    }
                    std::thread::sleep(self.options.miss_backoff);
                    continue;
                }
                Acquired::Closed => break StopReason::SourceClosed,
            };

            self.counter.start();
            let output = infer_frame(&mut *self.gateway, &frame);
            self.counter.count();
            frames += 1;

            if last_fps_log.elapsed() >= self.options.fps_log_interval {
                match self.counter.fps() {
                    Some(report) => log!(self.logger, "[fps] {}", report),
                    None => log!(self.logger, "[fps] no data"),
                }
                last_fps_log = Instant::now();
            }

            let control = match &output {
                Ok(out) => match out.successful() {
                    Some(detections) => sink.present(&frame, detections)?,
                    None => {
                        failures += 1;
                        sink.failed(&frame)?
                    }
                },
                Err(e) => {
                    log!(self.logger, "[realtime] inference failed: {:#}", e);
                    failures += 1;
                    sink.failed(&frame)?
                }
            };

            if control == SinkControl::Stop {
                break StopReason::SinkStopped;
            }
            if self.stop_requested() {
                break StopReason::Interrupted;
            }
        };

        let summary = LoopSummary {
            frames,
            failures,
            misses,
            stop_reason,
            throughput: self.counter.fps(),
        };
        log!(
            self.logger,
            "[realtime] stopped ({:?}): {} frames, {} failures, {} misses",
            summary.stop_reason,
            summary.frames,
            summary.failures,
            summary.misses
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::StubGateway;
    use std::collections::VecDeque;

    struct Scripted(VecDeque<Option<Frame>>);

    impl Scripted {
        /// `None` = 取りこぼし
        fn new(items: Vec<Option<Frame>>) -> Self {
            Self(items.into())
        }
    }

    impl FrameSource for Scripted {
        fn read(&mut self) -> Result<Acquired> {
            Ok(match self.0.pop_front() {
                Some(Some(frame)) => Acquired::Frame(frame),
                Some(None) => Acquired::Pending,
                None => Acquired::Closed,
            })
        }
    }

    #[derive(Default)]
    struct Recording {
        presented: Vec<(u32, usize)>,
        failed: Vec<u32>,
        stop_after: Option<usize>,
    }

    impl Recording {
        fn control(&self) -> SinkControl {
            let seen = self.presented.len() + self.failed.len();
            match self.stop_after {
                Some(n) if seen >= n => SinkControl::Stop,
                _ => SinkControl::Continue,
            }
        }
    }

    impl FrameSink for Recording {
        fn present(&mut self, frame: &Frame, detections: &DetectionBatch) -> Result<SinkControl> {
            self.presented.push((frame.width(), detections.len()));
            Ok(self.control())
        }

        fn failed(&mut self, frame: &Frame) -> Result<SinkControl> {
            self.failed.push(frame.width());
            Ok(self.control())
        }
    }

    fn options() -> LoopOptions {
        LoopOptions {
            warmup_frames: 3,
            latency_threshold: Duration::from_secs(10),
            fps_log_interval: Duration::ZERO,
            miss_backoff: Duration::ZERO,
        }
    }

    /// カメラ抜けなど、ずっとフレームが来ないソース
    struct AlwaysMissing {
        reads: u64,
        limit: u64,
    }

    impl FrameSource for AlwaysMissing {
        fn read(&mut self) -> Result<Acquired> {
            self.reads += 1;
            Ok(if self.reads > self.limit { Acquired::Closed } else { Acquired::Pending })
        }
    }

    #[test]
    fn test_misses_are_skipped() {
        let mut gateway = StubGateway::uniform(2);
        let mut source = Scripted::new(vec![
            None,
            Some(Frame::blank(10, 10, 0)),
            None,
            None,
            Some(Frame::blank(20, 10, 1)),
        ]);
        let mut sink = Recording::default();
        let summary = RealtimeLoop::new(&mut gateway, options(), Logger::stderr())
            .run(&mut source, &mut sink)
            .unwrap();

        assert_eq!(summary.stop_reason, StopReason::SourceClosed);
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.misses, 3);
        assert_eq!(gateway.calls, 2);
        assert_eq!(sink.presented, vec![(10, 2), (20, 2)]);
        assert!(sink.failed.is_empty());
    }

    #[test]
    fn test_failures_reach_the_sink() {
        let mut gateway = StubGateway::with_subjects(|_| 0);
        let mut source = Scripted::new(vec![Some(Frame::blank(10, 10, 0))]);
        let mut sink = Recording::default();
        let summary = RealtimeLoop::new(&mut gateway, options(), Logger::stderr())
            .run(&mut source, &mut sink)
            .unwrap();
        assert_eq!(summary.failures, 1);
        assert_eq!(sink.failed, vec![10]);

        let mut gateway = StubGateway::uniform(1);
        gateway.fail_with_error = true;
        let mut source = Scripted::new(vec![Some(Frame::blank(12, 10, 0)), Some(Frame::blank(14, 10, 1))]);
        let mut sink = Recording::default();
        let summary = RealtimeLoop::new(&mut gateway, options(), Logger::stderr())
            .run(&mut source, &mut sink)
            .unwrap();
        assert_eq!(summary.failures, 2);
        assert_eq!(sink.failed, vec![12, 14]);
    }

    #[test]
    fn test_sink_stop_ends_loop() {
        let mut gateway = StubGateway::uniform(1);
        let frames = (0..5).map(|i| Some(Frame::blank(8, 8, i))).collect();
        let mut source = Scripted::new(frames);
        let mut sink = Recording { stop_after: Some(2), ..Recording::default() };
        let summary = RealtimeLoop::new(&mut gateway, options(), Logger::stderr())
            .run(&mut source, &mut sink)
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::SinkStopped);
        assert_eq!(summary.frames, 2);
        assert_eq!(gateway.calls, 2);
    }

    #[test]
    fn test_stop_flag_checked_after_dispatch() {
        let mut gateway = StubGateway::uniform(1);
        let frames = (0..5).map(|i| Some(Frame::blank(8, 8, i))).collect();
        let mut source = Scripted::new(frames);
        let mut sink = Recording::default();
        let stop = Arc::new(AtomicBool::new(true));
        let summary = RealtimeLoop::new(&mut gateway, options(), Logger::stderr())
            .with_stop_flag(stop)
            .run(&mut source, &mut sink)
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::Interrupted);
        assert_eq!(sink.presented.len(), 1);
    }

    #[test]
    fn test_stop_flag_checked_while_source_misses() {
        let mut gateway = StubGateway::uniform(1);
        let mut source = AlwaysMissing { reads: 0, limit: 1_000_000 };
        let mut sink = Recording::default();
        let stop = Arc::new(AtomicBool::new(true));
        let summary = RealtimeLoop::new(&mut gateway, options(), Logger::stderr())
            .with_stop_flag(stop)
            .run(&mut source, &mut sink)
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::Interrupted);
        assert_eq!(summary.misses, 1);
        assert_eq!(source.reads, 1);
        assert_eq!(gateway.calls, 0);
    }

    #[test]
    fn test_misses_back_off() {
        let mut gateway = StubGateway::uniform(1);
        let mut source = AlwaysMissing { reads: 0, limit: 3 };
        let opts = LoopOptions { miss_backoff: Duration::from_millis(10), ..options() };
        let started = Instant::now();
        let summary = RealtimeLoop::new(&mut gateway, opts, Logger::stderr())
            .run(&mut source, &mut Recording::default())
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::SourceClosed);
        assert_eq!(summary.misses, 3);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_warm_up_failures_are_not_fatal() {
        let mut gateway = StubGateway::uniform(1);
        gateway.fail_with_error = true;
        let mut rt = RealtimeLoop::new(&mut gateway, options(), Logger::stderr());
        assert!(rt.warm_up().is_ok());
        assert_eq!(rt.counter().samples(), 0);
        drop(rt);
        assert_eq!(gateway.calls, 3);
    }

    #[test]
    fn test_warm_up_excluded_from_timing() {
        let mut gateway = StubGateway::uniform(1);
        let mut rt = RealtimeLoop::new(&mut gateway, options(), Logger::stderr());
        rt.warm_up().unwrap();
        assert_eq!(rt.counter().samples(), 0);

        let mut source = Scripted::new(vec![Some(Frame::blank(8, 8, 0))]);
        let summary = rt.run(&mut source, &mut Recording::default()).unwrap();
        assert_eq!(summary.frames, 1);
        assert_eq!(rt.counter().samples(), 1);
        drop(rt);
        assert_eq!(gateway.calls, 4);
        assert_eq!(gateway.last_batch_shape, vec![1, 16, 16, 3]);
    }
}
