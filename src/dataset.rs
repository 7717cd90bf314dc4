//! Resumable image-folder dataset.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::frame::{letterbox, Frame, FrameId};
use crate::inference::FrameBatch;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Every regular file under `root`, sorted. Symlinks are not followed.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// `sub/a.jpg` → `sub/a`
pub fn completion_key(relative: &Path) -> PathBuf {
    relative.with_extension("")
}

/// Relative paths (extension stripped) of everything already in `output_dir`.
/// A missing directory is an empty set.
pub fn completion_set(output_dir: &Path) -> Result<HashSet<PathBuf>> {
    if !output_dir.exists() {
        return Ok(HashSet::new());
    }
    let set = list_files(output_dir)?
        .iter()
        .filter_map(|p| p.strip_prefix(output_dir).ok())
        .map(completion_key)
        .collect();
    Ok(set)
}

/// Images under a root, minus the ones already completed.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    root: PathBuf,
    items: Vec<PathBuf>,
    completed: usize,
}

impl ImageDataset {
    pub fn scan(root: &Path, completed: &HashSet<PathBuf>) -> Result<Self> {
        let mut items = Vec::new();
        let mut skipped = 0;
        for path in list_files(root)?.into_iter().filter(|p| is_image(p)) {
            let key = path.strip_prefix(root).map(completion_key).unwrap_or_default();
            if completed.contains(&key) {
                skipped += 1;
            } else {
                items.push(path);
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            items,
            completed: skipped,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn items(&self) -> &[PathBuf] {
        &self.items
    }

    /// Images left out because their result already exists.
    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn batches(&self, batch_size: usize) -> std::slice::Chunks<'_, PathBuf> {
        self.items.chunks(batch_size.max(1))
    }
}

/// Decoded and letterboxed batch. Images that failed to decode are reported in
/// `failed` and left out of `batch`/`paths`.
pub struct LoadedBatch {
    pub batch: FrameBatch,
    pub paths: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, anyhow::Error)>,
}

/// Decode + letterbox in parallel; output keeps input order.
pub fn load_batch(paths: &[PathBuf], input_size: u32) -> LoadedBatch {
    let loaded: Vec<Result<_>> = paths
        .par_iter()
        .map(|path| Frame::open(path).map(|frame| letterbox(&frame.image, input_size).0))
        .collect();

    let mut tensors = Vec::with_capacity(paths.len());
    let mut ok_paths = Vec::with_capacity(paths.len());
    let mut failed = Vec::new();
    for (path, result) in paths.iter().zip(loaded) {
        match result {
            Ok(tensor) => {
                tensors.push(tensor);
                ok_paths.push(path.clone());
            }
            Err(e) => failed.push((path.clone(), e)),
        }
    }

    let ids = ok_paths.iter().cloned().map(FrameId::Path).collect();
    LoadedBatch {
        batch: FrameBatch::stack(tensors, ids, input_size),
        paths: ok_paths,
        failed,
    }
}
