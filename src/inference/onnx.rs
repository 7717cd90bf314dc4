use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{Array2, Array3, ArrayViewD, Ix2, Ix3};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionOutputs};
use ort::value::Tensor;

use super::{DetectionBatch, FrameBatch, InferenceGateway, InferenceOutput};
use crate::mesh::load_faces;

pub const INPUT_NAME: &str = "image";
pub const GROUP_INDEX_OUTPUT: &str = "reorganize_idx";

fn build_session(model_path: &Path) -> Result<Session> {
    let builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?;
    builder.commit_from_file(model_path).context("Failed to load ONNX model")
}

/// ONNX Runtime セッションでメッシュ復元モデルを実行
pub struct OnnxGateway {
    session: Session,
    input_size: u32,
    faces: Vec<[u32; 3]>,
}

impl OnnxGateway {
    pub fn new(model_path: &Path, input_size: u32, faces_path: Option<&Path>) -> Result<Self> {
        let session = build_session(model_path)
            .with_context(|| format!("model: {}", model_path.display()))?;
        let faces = match faces_path {
            Some(path) => load_faces(path)?,
            None => Vec::new(),
        };
        Ok(Self { session, input_size, faces })
    }
}

fn view<'a>(outputs: &'a SessionOutputs<'_>, name: &str) -> Result<Option<ArrayViewD<'a, f32>>> {
    match outputs.get(name) {
        Some(value) => Ok(Some(
            value.try_extract_array::<f32>().with_context(|| format!("Failed to extract {}", name))?,
        )),
        None => Ok(None),
    }
}

fn matrix(outputs: &SessionOutputs<'_>, name: &str) -> Result<Option<Array2<f32>>> {
    view(outputs, name)?
        .map(|v| v.into_dimensionality::<Ix2>().map(|a| a.to_owned()))
        .transpose()
        .with_context(|| format!("{} is not 2-D", name))
}

fn tensor3(outputs: &SessionOutputs<'_>, name: &str) -> Result<Option<Array3<f32>>> {
    view(outputs, name)?
        .map(|v| v.into_dimensionality::<Ix3>().map(|a| a.to_owned()))
        .transpose()
        .with_context(|| format!("{} is not 3-D", name))
}

/// Any missing parameter output means the model produced no payload.
fn detection_batch(outputs: &SessionOutputs<'_>) -> Result<Option<DetectionBatch>> {
    let Some(index) = outputs.get(GROUP_INDEX_OUTPUT) else {
        return Ok(None);
    };
    let group_index: Vec<i64> = index
        .try_extract_array::<i64>()
        .context("Failed to extract reorganize_idx")?
        .iter()
        .copied()
        .collect();

    let (
        Some(cam),
        Some(global_orient),
        Some(body_pose),
        Some(betas),
        Some(j3d_smpl24),
        Some(j3d_spin24),
        Some(j3d_op25),
        Some(verts),
        Some(verts_camed),
    ) = (
        matrix(outputs, "cam")?,
        matrix(outputs, "global_orient")?,
        matrix(outputs, "body_pose")?,
        matrix(outputs, "betas")?,
        tensor3(outputs, "j3d_smpl24")?,
        tensor3(outputs, "j3d_spin24")?,
        tensor3(outputs, "j3d_op25")?,
        tensor3(outputs, "verts")?,
        tensor3(outputs, "verts_camed")?,
    )
    else {
        return Ok(None);
    };

    let batch = DetectionBatch {
        cam,
        global_orient,
        body_pose,
        betas,
        j3d_smpl24,
        j3d_spin24,
        j3d_op25,
        verts,
        verts_camed,
        group_index,
    };
    batch.validate()?;
    Ok(Some(batch))
}

impl InferenceGateway for OnnxGateway {
    fn infer(&mut self, batch: &FrameBatch) -> Result<InferenceOutput> {
        let input_tensor = Tensor::from_array(batch.images.clone())?;
        let outputs = self
            .session
            .run(ort::inputs![INPUT_NAME => input_tensor])
            .context("Inference failed")?;
        Ok(match detection_batch(&outputs)? {
            Some(detections) => InferenceOutput::detected(detections),
            None => InferenceOutput::missing(),
        })
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn face_topology(&self) -> &[[u32; 3]] {
        &self.faces
    }

    fn name(&self) -> &str {
        "onnx"
    }
}
