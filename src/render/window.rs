use anyhow::Result;
use minifb::{Key, Window, WindowOptions};

use super::MeshRenderer;
use crate::frame::Frame;

const MESH_COLOR: u32 = 0x00_ff_b0_40;

/// minifbを使用したレンダラー
pub struct MinifbRenderer {
    window: Window,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
    /// 焦点距離 (ピクセル)
    focal: f32,
}

impl MinifbRenderer {
    /// ウィンドウを作成
    pub fn new(title: &str, width: usize, height: usize) -> Result<Self> {
        let window = Window::new(
            title,
            width,
            height,
            WindowOptions {
                resize: false,
                ..WindowOptions::default()
            },
        )?;

        Ok(Self {
            window,
            buffer: vec![0u32; width * height],
            width,
            height,
            focal: width.max(height) as f32,
        })
    }

    /// ウィンドウが開いているか
    pub fn is_open(&self) -> bool {
        self.window.is_open() && !self.window.is_key_down(Key::Escape)
    }

    /// フレームをウィンドウサイズに合わせて (最近傍) コピー
    fn draw_frame(&mut self, frame: &Frame) {
        let (fw, fh) = (frame.width() as usize, frame.height() as usize);
        if fw == 0 || fh == 0 {
            self.buffer.fill(0);
            return;
        }
        for y in 0..self.height {
            let sy = (y * fh / self.height) as u32;
            for x in 0..self.width {
                let sx = (x * fw / self.width) as u32;
                let p = frame.image.get_pixel(sx, sy).0;
                self.buffer[y * self.width + x] = ((p[0] as u32) << 16) | ((p[1] as u32) << 8) | p[2] as u32;
            }
        }
    }

    /// 頂点を透視投影して点で描画
    fn draw_mesh(&mut self, vertices: &[[f32; 3]]) {
        let cx = self.width as f32 / 2.0;
        let cy = self.height as f32 / 2.0;
        for v in vertices {
            if v[2] <= f32::EPSILON {
                continue;
            }
            let px = cx + self.focal * v[0] / v[2];
            let py = cy + self.focal * v[1] / v[2];
            self.set_pixel(px as i32, py as i32, MESH_COLOR);
        }
    }

    /// ピクセルをセット（境界チェック付き）
    fn set_pixel(&mut self, x: i32, y: i32, color: u32) {
        if x >= 0 && x < self.width as i32 && y >= 0 && y < self.height as i32 {
            self.buffer[y as usize * self.width + x as usize] = color;
        }
    }
}

impl MeshRenderer for MinifbRenderer {
    fn show(&mut self, frame: &Frame, meshes: &[Vec<[f32; 3]>]) -> Result<bool> {
        if !self.is_open() {
            return Ok(true);
        }
        self.draw_frame(frame);
        for mesh in meshes {
            self.draw_mesh(mesh);
        }
        self.window.update_with_buffer(&self.buffer, self.width, self.height)?;
        Ok(!self.is_open())
    }
}
