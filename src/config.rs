use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Run mode, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Image directories → per-image result archives
    #[default]
    Batch,
    /// Video file or frame directory → local visualizer
    Video,
    /// Camera → local visualizer
    WebcamLocal,
    /// Frames received over TCP → vertices sent back
    WebcamRemote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

fn default_log_dir() -> String { "logs".to_string() }

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            log_dir: default_log_dir(),
            verbose: false,
            model: ModelConfig::default(),
            batch: BatchConfig::default(),
            realtime: RealtimeConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// 正方形の入力解像度
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_model_path")]
    pub model_path: String,
    /// OBJ template the face topology is read from
    #[serde(default)]
    pub faces_path: Option<String>,
}

fn default_input_size() -> u32 { 512 }
fn default_model_path() -> String { "models/hmr.onnx".to_string() }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            model_path: default_model_path(),
            faces_path: None,
        }
    }
}

/// One input directory and where its results go.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobDirs {
    pub input_dir: PathBuf,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl JobDirs {
    pub fn new<P: Into<PathBuf>>(input_dir: P) -> Self {
        Self { input_dir: input_dir.into(), output_dir: None }
    }

    /// `output_dir`, or `<input_dir>_results` next to the input.
    pub fn resolved_output_dir(&self) -> PathBuf {
        match &self.output_dir {
            Some(dir) => dir.clone(),
            None => {
                let mut name = self.input_dir.as_os_str().to_os_string();
                name.push("_results");
                PathBuf::from(name)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub jobs: Vec<JobDirs>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub save_dict_results: bool,
    #[serde(default)]
    pub save_mesh: bool,
    #[serde(default = "default_latency_threshold")]
    pub latency_threshold_secs: f64,
}

fn default_batch_size() -> usize { 8 }
fn default_true() -> bool { true }
fn default_latency_threshold() -> f64 { 1.0 }

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            batch_size: default_batch_size(),
            save_dict_results: default_true(),
            save_mesh: false,
            latency_threshold_secs: default_latency_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_display_scale")]
    pub scale: f32,
    #[serde(default = "default_display_offset")]
    pub offset: [f32; 3],
}

fn default_display_scale() -> f32 { 50.0 }
fn default_display_offset() -> [f32; 3] { [0.0, 0.0, 100.0] }

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            scale: default_display_scale(),
            offset: default_display_offset(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// カメラ番号 ("0")、動画ファイル、またはフレーム画像ディレクトリ
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: usize,
    /// true: 先頭の人物のみ / false: 全員をカメラ相対で表示
    #[serde(default = "default_true")]
    pub show_single: bool,
    #[serde(default = "default_latency_threshold")]
    pub latency_threshold_secs: f64,
    #[serde(default = "default_fps_log_interval")]
    pub fps_log_interval_secs: f64,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

fn default_source() -> String { "0".to_string() }
fn default_warmup_frames() -> usize { 10 }
fn default_fps_log_interval() -> f64 { 1.0 }
fn default_window_size() -> usize { 1024 }

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            warmup_frames: default_warmup_frames(),
            show_single: default_true(),
            latency_threshold_secs: default_latency_threshold(),
            fps_log_interval_secs: default_fps_log_interval(),
            display: DisplayConfig::default(),
            window_size: default_window_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String { "0.0.0.0:9999".to_string() }

impl Default for RemoteConfig {
    fn default() -> Self {
        Self { listen_addr: default_listen_addr() }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("invalid config")?;
        Ok(config)
    }

    /// 読み込みに失敗した場合はデフォルト設定
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("[config] {:#}, using defaults", e);
                Self::default()
            }
        }
    }
}
