//! Per-image result archive.
//!
//! File layout: `HMRZ` magic, one format version byte, then a gzip stream of a
//! bincode encoded [`ResultArchive`]. Numeric fields are stored as IEEE
//! binary16 together with their shape.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use half::f16;
use ndarray::{ArrayD, ArrayView, Dimension, IxDyn};
use serde::{Deserialize, Serialize};

pub const ARCHIVE_MAGIC: &[u8; 4] = b"HMRZ";
pub const ARCHIVE_VERSION: u8 = 1;
pub const ARCHIVE_EXTENSION: &str = "npz";

/// Half precision n-d array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HalfArray {
    pub shape: Vec<usize>,
    pub data: Vec<f16>,
}

impl HalfArray {
    pub fn from_view<D: Dimension>(view: ArrayView<'_, f32, D>) -> Self {
        Self {
            shape: view.shape().to_vec(),
            data: view.iter().map(|&v| f16::from_f32(v)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data.iter().map(|v| v.to_f32()).collect()
    }

    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        let array = ArrayD::from_shape_vec(IxDyn(&self.shape), self.to_f32_vec())
            .context("shape does not match data length")?;
        Ok(array)
    }

    /// Rows of a [V, 3] array.
    pub fn points(&self) -> Result<Vec<[f32; 3]>> {
        if self.shape.len() != 2 || self.shape[1] != 3 {
            bail!("expected [V, 3], got {:?}", self.shape);
        }
        Ok(self
            .data
            .chunks_exact(3)
            .map(|c| [c[0].to_f32(), c[1].to_f32(), c[2].to_f32()])
            .collect())
    }
}

/// One detected subject. Field order is the archive's key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectResult {
    pub cam: HalfArray,
    /// global orient (3) followed by body pose (69)
    pub pose: HalfArray,
    pub betas: HalfArray,
    pub j3d_smpl24: HalfArray,
    pub j3d_spin24: HalfArray,
    pub j3d_op25: HalfArray,
    pub verts: HalfArray,
    /// Image path relative to the dataset root
    pub img_path: PathBuf,
}

/// All subjects detected in one source image, in detection order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub img_path: PathBuf,
    pub subjects: Vec<SubjectResult>,
}

/// On-disk mapping: image path → subjects.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultArchive {
    pub results: BTreeMap<String, Vec<SubjectResult>>,
}

impl ResultRecord {
    /// `<output_dir>/<path relative to image_root, extension replaced>`.
    pub fn output_path(&self, image_root: &Path, output_dir: &Path) -> PathBuf {
        let relative = self.img_path.strip_prefix(image_root).unwrap_or(&self.img_path);
        output_dir.join(relative).with_extension(ARCHIVE_EXTENSION)
    }

    pub fn to_archive(&self) -> ResultArchive {
        let mut results = BTreeMap::new();
        results.insert(self.img_path.to_string_lossy().into_owned(), self.subjects.clone());
        ResultArchive { results }
    }

    /// Write the archive, creating parent directories. Overwrites.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        write_archive(BufWriter::new(file), &self.to_archive())
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let archive = read_archive(BufReader::new(file))
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut entries = archive.results.into_iter();
        match (entries.next(), entries.next()) {
            (Some((img_path, subjects)), None) => Ok(Self {
                img_path: PathBuf::from(img_path),
                subjects,
            }),
            _ => bail!("{} does not hold exactly one image", path.display()),
        }
    }
}

pub fn write_archive<W: Write>(mut writer: W, archive: &ResultArchive) -> Result<()> {
    writer.write_all(ARCHIVE_MAGIC)?;
    writer.write_all(&[ARCHIVE_VERSION])?;
    let mut encoder = GzEncoder::new(writer, Compression::default());
    bincode::serialize_into(&mut encoder, archive)?;
    encoder.finish()?.flush()?;
    Ok(())
}

pub fn read_archive<R: Read>(mut reader: R) -> Result<ResultArchive> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).context("truncated header")?;
    if &header[..4] != ARCHIVE_MAGIC {
        bail!("not a result archive");
    }
    if header[4] != ARCHIVE_VERSION {
        bail!("unsupported archive version {}", header[4]);
    }
    let archive = bincode::deserialize_from(GzDecoder::new(reader))?;
    Ok(archive)
}
