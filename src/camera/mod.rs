#[cfg(feature = "desktop")]
pub mod capture;

#[cfg(feature = "desktop")]
pub use capture::OpenCvCapture;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::dataset::{is_image, list_files};
use crate::frame::Frame;

/// Outcome of one read from a capture source.
#[derive(Debug)]
pub enum Acquired {
    Frame(Frame),
    /// 一時的にフレームなし (再試行する)
    Pending,
    /// End of stream
    Closed,
}

pub trait FrameSource {
    fn read(&mut self) -> Result<Acquired>;
}

/// What `realtime.source` points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSpec {
    Camera(i32),
    VideoFile(PathBuf),
    /// Directory of frame images, played in path order
    Frames(PathBuf),
}

impl CaptureSpec {
    pub fn parse(source: &str) -> Self {
        if let Ok(index) = source.trim().parse::<i32>() {
            return Self::Camera(index);
        }
        let path = PathBuf::from(source);
        if path.is_dir() {
            Self::Frames(path)
        } else {
            Self::VideoFile(path)
        }
    }
}

pub fn open_source(spec: &CaptureSpec) -> Result<Box<dyn FrameSource>> {
    match spec {
        CaptureSpec::Frames(dir) => Ok(Box::new(ImageSequence::open(dir)?)),
        #[cfg(feature = "desktop")]
        CaptureSpec::Camera(index) => Ok(Box::new(OpenCvCapture::open_camera(*index)?)),
        #[cfg(feature = "desktop")]
        CaptureSpec::VideoFile(path) => Ok(Box::new(OpenCvCapture::open_file(path)?)),
        #[cfg(not(feature = "desktop"))]
        other => anyhow::bail!("{:?} needs the `desktop` feature", other),
    }
}

/// Frames read from image files.
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSequence {
    pub fn open(dir: &Path) -> Result<Self> {
        let paths = list_files(dir)
            .with_context(|| format!("failed to list frames in {}", dir.display()))?
            .into_iter()
            .filter(|p| is_image(p))
            .collect();
        Ok(Self::from_paths(paths))
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self { paths, next: 0 }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequence {
    fn read(&mut self) -> Result<Acquired> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(Acquired::Closed);
        };
        self.next += 1;
        // 壊れたフレームは取りこぼし扱い
        match Frame::open(path) {
            Ok(frame) => Ok(Acquired::Frame(frame)),
            Err(_) => Ok(Acquired::Pending),
        }
    }
}
