//! Run logging: every line goes to stderr and, when a log file is open, to
//! `<log_dir>/<prefix>_<timestamp>.log`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

/// Cloneable logging handle shared by the pipeline components.
#[derive(Clone, Default)]
pub struct Logger {
    file: Option<Arc<Mutex<BufWriter<File>>>>,
    path: Option<PathBuf>,
}

impl Logger {
    /// stderr only. Used by tests and by callers that do not want a log file.
    pub fn stderr() -> Self {
        Self::default()
    }

    /// Open a fresh timestamped log file under `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, prefix: &str) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log dir {}", dir.display()))?;
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("{}_{}.log", prefix, ts));
        let file = File::create(&path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        eprintln!("Log: {}", path.display());
        Ok(Self {
            file: Some(Arc::new(Mutex::new(BufWriter::new(file)))),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn line(&self, msg: &str) {
        eprintln!("{}", msg);
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{}", msg);
                let _ = f.flush();
            }
        }
    }
}

/// `log!(logger, "[tag] fmt", args...)`
#[macro_export]
macro_rules! log {
    ($logger:expr, $($arg:tt)*) => {{
        $logger.line(&format!($($arg)*));
    }};
}
