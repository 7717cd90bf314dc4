//! Deterministic stand-in for the model, for tests.

use anyhow::{bail, Result};
use ndarray::{Array2, Array3};

use super::{DetectionBatch, FrameBatch, InferenceGateway, InferenceOutput};
use crate::frame::FrameId;

pub const STUB_INPUT_SIZE: u32 = 16;
pub const STUB_VERTEX_COUNT: usize = 4;

/// Rows filled with values derived from the row number (all exact in f16):
/// every field of row `r` holds `r`, except `global_orient` (`r + 0.5`) and
/// the vertex sets (`r + v * 0.25` for vertex `v`).
pub fn detection_batch(group_index: &[i64], vertex_count: usize) -> DetectionBatch {
    let n = group_index.len();
    let row = |r: usize| r as f32;
    DetectionBatch {
        cam: Array2::from_shape_fn((n, 3), |(r, _)| row(r)),
        global_orient: Array2::from_shape_fn((n, 3), |(r, _)| row(r) + 0.5),
        body_pose: Array2::from_shape_fn((n, 69), |(r, _)| row(r)),
        betas: Array2::from_shape_fn((n, 10), |(r, _)| row(r)),
        j3d_smpl24: Array3::from_shape_fn((n, 24, 3), |(r, _, _)| row(r)),
        j3d_spin24: Array3::from_shape_fn((n, 24, 3), |(r, _, _)| row(r)),
        j3d_op25: Array3::from_shape_fn((n, 25, 3), |(r, _, _)| row(r)),
        verts: Array3::from_shape_fn((n, vertex_count, 3), |(r, v, _)| row(r) + v as f32 * 0.25),
        verts_camed: Array3::from_shape_fn((n, vertex_count, 3), |(r, v, _)| {
            row(r) + v as f32 * 0.25 + 1.0
        }),
        group_index: group_index.to_vec(),
    }
}

type SubjectFn = Box<dyn FnMut(&FrameId) -> usize + Send>;

pub struct StubGateway {
    pub calls: usize,
    pub frames_seen: usize,
    pub last_batch_shape: Vec<usize>,
    /// Return `Err` from every call
    pub fail_with_error: bool,
    /// Return a payload-less output from every call
    pub missing_payload: bool,
    subjects: SubjectFn,
    faces: Vec<[u32; 3]>,
}

impl StubGateway {
    /// `n` subjects in every frame.
    pub fn uniform(n: usize) -> Self {
        Self::with_subjects(move |_| n)
    }

    pub fn with_subjects<F>(subjects: F) -> Self
    where
        F: FnMut(&FrameId) -> usize + Send + 'static,
    {
        Self {
            calls: 0,
            frames_seen: 0,
            last_batch_shape: Vec::new(),
            fail_with_error: false,
            missing_payload: false,
            subjects: Box::new(subjects),
            faces: vec![[0, 1, 2], [0, 2, 3]],
        }
    }
}

impl InferenceGateway for StubGateway {
    fn infer(&mut self, batch: &FrameBatch) -> Result<InferenceOutput> {
        self.calls += 1;
        self.frames_seen += batch.len();
        self.last_batch_shape = batch.images.shape().to_vec();

        if self.fail_with_error {
            bail!("stub inference failure");
        }
        if self.missing_payload {
            return Ok(InferenceOutput::missing());
        }

        let mut group_index = Vec::new();
        for (slot, id) in batch.ids.iter().enumerate() {
            let count = (self.subjects)(id);
            group_index.extend(std::iter::repeat(slot as i64).take(count));
        }
        Ok(InferenceOutput::detected(detection_batch(&group_index, STUB_VERTEX_COUNT)))
    }

    fn input_size(&self) -> u32 {
        STUB_INPUT_SIZE
    }

    fn face_topology(&self) -> &[[u32; 3]] {
        &self.faces
    }

    fn name(&self) -> &str {
        "stub"
    }
}
