use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array3;
use std::path::{Path, PathBuf};

/// Where a frame came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameId {
    /// 画像ファイル
    Path(PathBuf),
    /// カメラ・動画・ソケット由来の連番
    Sequence(u64),
}

/// Decoded RGB8 image.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(id: FrameId, image: RgbImage) -> Self {
        Self { id, image }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_rgb8();
        Ok(Self::new(FrameId::Path(path.to_path_buf()), image))
    }

    /// JPEG/PNG などのエンコード済みバイト列から
    pub fn decode(bytes: &[u8], seq: u64) -> Result<Self> {
        let image = image::load_from_memory(bytes)
            .context("failed to decode frame")?
            .to_rgb8();
        Ok(Self::new(FrameId::Sequence(seq), image))
    }

    /// 黒一色のフレーム (ウォームアップ用)
    pub fn blank(width: u32, height: u32, seq: u64) -> Self {
        Self::new(FrameId::Sequence(seq), RgbImage::new(width, height))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
}

/// Placement of the resized image inside the square model input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LetterboxInfo {
    pub input_size: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl LetterboxInfo {
    /// 長辺を `input_size` に合わせ、各辺を偶数に切り下げる
    pub fn compute(width: u32, height: u32, input_size: u32) -> Self {
        let longest = width.max(height).max(1) as f64;
        let even = |v: u32| {
            let scaled = input_size as f64 * v as f64 / longest;
            ((scaled / 2.0).floor() as u32 * 2).clamp(2, input_size)
        };
        let resized_width = even(width);
        let resized_height = even(height);
        Self {
            input_size,
            resized_width,
            resized_height,
            pad_x: (input_size - resized_width) / 2,
            pad_y: (input_size - resized_height) / 2,
        }
    }
}

/// Bicubic resize, zero padding to `input_size`², HWC f32 in 0..255.
pub fn letterbox(image: &RgbImage, input_size: u32) -> (Array3<f32>, LetterboxInfo) {
    let info = LetterboxInfo::compute(image.width(), image.height(), input_size);
    let resized = imageops::resize(
        image,
        info.resized_width,
        info.resized_height,
        FilterType::CatmullRom,
    );

    let size = input_size as usize;
    let mut tensor = Array3::<f32>::zeros((size, size, 3));
    for (x, y, Rgb(px)) in resized.enumerate_pixels() {
        let ty = (y + info.pad_y) as usize;
        let tx = (x + info.pad_x) as usize;
        tensor[[ty, tx, 0]] = px[0] as f32;
        tensor[[ty, tx, 1]] = px[1] as f32;
        tensor[[ty, tx, 2]] = px[2] as f32;
    }

    (tensor, info)
}
