use anyhow::{bail, Context, Result};
use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureAPIs},
};
use std::path::Path;

use super::{Acquired, FrameSource};
use crate::frame::{Frame, FrameId};

/// OpenCVを使用したカメラ・動画キャプチャ
pub struct OpenCvCapture {
    capture: VideoCapture,
    /// 動画ファイルは読み切ったら終了、カメラは再試行
    is_file: bool,
    width: u32,
    height: u32,
    seq: u64,
}

impl OpenCvCapture {
    /// カメラを開く
    pub fn open_camera(index: i32) -> Result<Self> {
        let mut capture = VideoCapture::new(index, VideoCaptureAPIs::CAP_ANY as i32)
            .with_context(|| format!("failed to open camera {}", index))?;
        if !capture.is_opened()? {
            bail!("Camera {} is not available", index);
        }
        capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;
        Self::from_capture(capture, false)
    }

    /// 動画ファイルを開く
    pub fn open_file(path: &Path) -> Result<Self> {
        let name = path.to_string_lossy();
        let capture = VideoCapture::from_file(&name, VideoCaptureAPIs::CAP_ANY as i32)
            .with_context(|| format!("failed to open {}", path.display()))?;
        if !capture.is_opened()? {
            bail!("{} could not be opened", path.display());
        }
        Self::from_capture(capture, true)
    }

    fn from_capture(capture: VideoCapture, is_file: bool) -> Result<Self> {
        let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
        let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
        eprintln!("[capture] opened {}x{} @ {} FPS", width, height, capture.get(videoio::CAP_PROP_FPS)?);
        Ok(Self { capture, is_file, width, height, seq: 0 })
    }

    /// 解像度を取得
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// 総フレーム数 (動画のみ)
    pub fn frame_count(&self) -> Option<u64> {
        if !self.is_file {
            return None;
        }
        self.capture.get(videoio::CAP_PROP_FRAME_COUNT).ok().map(|n| n as u64)
    }
}

/// BGR Mat → RGB image
fn mat_to_rgb(frame: &Mat) -> Result<RgbImage> {
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;
    let width = rgb.cols() as u32;
    let height = rgb.rows() as u32;
    let bytes = if rgb.is_continuous() {
        rgb.data_bytes()?.to_vec()
    } else {
        rgb.try_clone()?.data_bytes()?.to_vec()
    };
    RgbImage::from_raw(width, height, bytes).context("unexpected frame layout")
}

impl FrameSource for OpenCvCapture {
    fn read(&mut self) -> Result<Acquired> {
        let mut frame = Mat::default();
        let grabbed = self.capture.read(&mut frame).context("Failed to read frame")?;

        if !grabbed || frame.empty() {
            return Ok(if self.is_file { Acquired::Closed } else { Acquired::Pending });
        }

        let image = mat_to_rgb(&frame)?;
        let id = FrameId::Sequence(self.seq);
        self.seq += 1;
        Ok(Acquired::Frame(Frame::new(id, image)))
    }
}
