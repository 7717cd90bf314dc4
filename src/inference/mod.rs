//! Boundary to the mesh recovery model.
//!
//! The model is opaque: it takes a batch of letterboxed images and returns one
//! row per detected subject plus a group index mapping every row back to the
//! batch slot it was detected in.

#[cfg(feature = "onnx")]
pub mod onnx;
#[cfg(test)]
pub mod stub;

#[cfg(feature = "onnx")]
pub use onnx::OnnxGateway;

use anyhow::{bail, Result};
use ndarray::{Array2, Array3, Array4, ArrayView2, Axis};

use crate::frame::{letterbox, Frame, FrameId};

/// Letterboxed images, NHWC f32 (0..255).
#[derive(Debug, Clone)]
pub struct FrameBatch {
    pub images: Array4<f32>,
    pub ids: Vec<FrameId>,
}

impl FrameBatch {
    pub fn from_frames(frames: &[Frame], input_size: u32) -> Self {
        let tensors = frames
            .iter()
            .map(|f| letterbox(&f.image, input_size).0)
            .collect();
        let ids = frames.iter().map(|f| f.id.clone()).collect();
        Self::stack(tensors, ids, input_size)
    }

    /// Stack already letterboxed HWC tensors. Every tensor must be
    /// `input_size`², 3 channels.
    pub fn stack(tensors: Vec<Array3<f32>>, ids: Vec<FrameId>, input_size: u32) -> Self {
        let s = input_size as usize;
        let mut images = Array4::<f32>::zeros((tensors.len(), s, s, 3));
        for (mut slot, tensor) in images.axis_iter_mut(Axis(0)).zip(tensors.iter()) {
            slot.assign(tensor);
        }
        Self { images, ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Per-subject model outputs, one row per detection.
#[derive(Debug, Clone)]
pub struct DetectionBatch {
    /// [N, 3] weak-perspective camera
    pub cam: Array2<f32>,
    /// [N, 3]
    pub global_orient: Array2<f32>,
    /// [N, 69]
    pub body_pose: Array2<f32>,
    /// [N, 10]
    pub betas: Array2<f32>,
    /// [N, 24, 3]
    pub j3d_smpl24: Array3<f32>,
    /// [N, 24, 3]
    pub j3d_spin24: Array3<f32>,
    /// [N, 25, 3]
    pub j3d_op25: Array3<f32>,
    /// [N, V, 3]
    pub verts: Array3<f32>,
    /// [N, V, 3] vertices translated by the predicted camera
    pub verts_camed: Array3<f32>,
    /// Batch slot of every row. Not necessarily sorted or contiguous.
    pub group_index: Vec<i64>,
}

impl DetectionBatch {
    /// Number of detections.
    pub fn len(&self) -> usize {
        self.group_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group_index.is_empty()
    }

    /// Every field must have one row per group index entry.
    pub fn validate(&self) -> Result<()> {
        let n = self.len();
        let rows = [
            ("cam", self.cam.nrows()),
            ("global_orient", self.global_orient.nrows()),
            ("body_pose", self.body_pose.nrows()),
            ("betas", self.betas.nrows()),
            ("j3d_smpl24", self.j3d_smpl24.len_of(Axis(0))),
            ("j3d_spin24", self.j3d_spin24.len_of(Axis(0))),
            ("j3d_op25", self.j3d_op25.len_of(Axis(0))),
            ("verts", self.verts.len_of(Axis(0))),
            ("verts_camed", self.verts_camed.len_of(Axis(0))),
        ];
        for (name, count) in rows {
            if count != n {
                bail!("{} has {} rows, group index has {}", name, count, n);
            }
        }
        Ok(())
    }

    /// Vertices of one detection, [V, 3].
    pub fn vertices(&self, row: usize) -> ArrayView2<'_, f32> {
        self.verts.index_axis(Axis(0), row)
    }

    pub fn camera_vertices(&self, row: usize) -> ArrayView2<'_, f32> {
        self.verts_camed.index_axis(Axis(0), row)
    }
}

/// Result of one gateway call.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub success_flag: bool,
    /// `None` when the model produced no parameter payload at all.
    pub detections: Option<DetectionBatch>,
}

impl InferenceOutput {
    pub fn detected(detections: DetectionBatch) -> Self {
        Self {
            success_flag: !detections.is_empty(),
            detections: Some(detections),
        }
    }

    /// No payload, e.g. nobody in frame.
    pub fn missing() -> Self {
        Self { success_flag: false, detections: None }
    }

    /// Detections when the call succeeded with at least one subject.
    pub fn successful(&self) -> Option<&DetectionBatch> {
        match &self.detections {
            Some(d) if self.success_flag && !d.is_empty() => Some(d),
            _ => None,
        }
    }
}

/// The model call. Blocking; a call returns a complete batch or fails.
pub trait InferenceGateway {
    fn infer(&mut self, batch: &FrameBatch) -> Result<InferenceOutput>;

    /// Square input resolution.
    fn input_size(&self) -> u32;

    /// Triangles of the body mesh, 0-based vertex indices.
    fn face_topology(&self) -> &[[u32; 3]];

    fn name(&self) -> &str {
        "mesh-recovery"
    }
}

impl<G: InferenceGateway + ?Sized> InferenceGateway for Box<G> {
    fn infer(&mut self, batch: &FrameBatch) -> Result<InferenceOutput> {
        (**self).infer(batch)
    }

    fn input_size(&self) -> u32 {
        (**self).input_size()
    }

    fn face_topology(&self) -> &[[u32; 3]] {
        (**self).face_topology()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Letterbox one frame and run it through the gateway.
pub fn infer_frame<G: InferenceGateway + ?Sized>(gateway: &mut G, frame: &Frame) -> Result<InferenceOutput> {
    let batch = FrameBatch::from_frames(std::slice::from_ref(frame), gateway.input_size());
    gateway.infer(&batch)
}
