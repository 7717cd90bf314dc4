//! Local visualizer sink.

#[cfg(feature = "desktop")]
pub mod window;

#[cfg(feature = "desktop")]
pub use window::MinifbRenderer;

use anyhow::Result;
use ndarray::ArrayView2;

use crate::config::DisplayConfig;
use crate::frame::Frame;
use crate::inference::DetectionBatch;
use crate::log;
use crate::logging::Logger;
use crate::realtime::{FrameSink, SinkControl};

/// Display convention applied to vertices before rendering: `v * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayTransform {
    pub scale: f32,
    pub offset: [f32; 3],
}

impl Default for DisplayTransform {
    fn default() -> Self {
        Self::from(&DisplayConfig::default())
    }
}

impl From<&DisplayConfig> for DisplayTransform {
    fn from(config: &DisplayConfig) -> Self {
        Self { scale: config.scale, offset: config.offset }
    }
}

impl DisplayTransform {
    pub fn apply(&self, vertices: ArrayView2<'_, f32>) -> Vec<[f32; 3]> {
        vertices
            .rows()
            .into_iter()
            .map(|v| {
                [
                    v[0] * self.scale + self.offset[0],
                    v[1] * self.scale + self.offset[1],
                    v[2] * self.scale + self.offset[2],
                ]
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationMode {
    /// 先頭の人物を絶対座標で
    Single,
    /// 全員をカメラ相対座標で
    Multi,
}

impl PresentationMode {
    pub fn from_show_single(show_single: bool) -> Self {
        if show_single { Self::Single } else { Self::Multi }
    }
}

/// Rendering collaborator. `meshes` are already display-transformed.
pub trait MeshRenderer {
    /// Returns true when the user asked to stop.
    fn show(&mut self, frame: &Frame, meshes: &[Vec<[f32; 3]>]) -> Result<bool>;
}

impl<R: MeshRenderer + ?Sized> MeshRenderer for Box<R> {
    fn show(&mut self, frame: &Frame, meshes: &[Vec<[f32; 3]>]) -> Result<bool> {
        (**self).show(frame, meshes)
    }
}

/// Renderer without a window: logs what would have been drawn.
pub struct HeadlessRenderer {
    logger: Logger,
    verbose: bool,
    frames: u64,
}

impl HeadlessRenderer {
    pub fn new(logger: Logger, verbose: bool) -> Self {
        Self { logger, verbose, frames: 0 }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl MeshRenderer for HeadlessRenderer {
    fn show(&mut self, frame: &Frame, meshes: &[Vec<[f32; 3]>]) -> Result<bool> {
        self.frames += 1;
        if self.verbose {
            log!(
                self.logger,
                "[render] {:?} {}x{}: {} meshes",
                frame.id,
                frame.width(),
                frame.height(),
                meshes.len()
            );
        }
        Ok(false)
    }
}

pub struct VisualizerSink<R: MeshRenderer> {
    renderer: R,
    mode: PresentationMode,
    transform: DisplayTransform,
}

impl<R: MeshRenderer> VisualizerSink<R> {
    pub fn new(renderer: R, mode: PresentationMode, transform: DisplayTransform) -> Self {
        Self { renderer, mode, transform }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn meshes(&self, detections: &DetectionBatch) -> Vec<Vec<[f32; 3]>> {
        match self.mode {
            PresentationMode::Single => vec![self.transform.apply(detections.vertices(0))],
            PresentationMode::Multi => (0..detections.len())
                .map(|row| self.transform.apply(detections.camera_vertices(row)))
                .collect(),
        }
    }
}

fn control(stop: bool) -> SinkControl {
    if stop { SinkControl::Stop } else { SinkControl::Continue }
}

impl<R: MeshRenderer> FrameSink for VisualizerSink<R> {
    fn present(&mut self, frame: &Frame, detections: &DetectionBatch) -> Result<SinkControl> {
        let meshes = self.meshes(detections);
        Ok(control(self.renderer.show(frame, &meshes)?))
    }

    /// メッシュなしでフレームだけ表示
    fn failed(&mut self, frame: &Frame) -> Result<SinkControl> {
        Ok(control(self.renderer.show(frame, &[])?))
    }
}
