//! Batch job: image folder → one result archive per image.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::{BatchConfig, JobDirs};
use crate::dataset::{completion_set, load_batch, ImageDataset};
use crate::demux::{demultiplex, row_paths};
use crate::inference::InferenceGateway;
use crate::log;
use crate::logging::Logger;
use crate::mesh::{mesh_path, save_obj};
use crate::throughput::{FpsReport, ThroughputCounter};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub save_dict_results: bool,
    pub save_mesh: bool,
    pub latency_threshold: Duration,
}

impl From<&BatchConfig> for BatchOptions {
    fn from(config: &BatchConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            save_dict_results: config.save_dict_results,
            save_mesh: config.save_mesh,
            latency_threshold: Duration::from_secs_f64(config.latency_threshold_secs.max(0.0)),
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from(&BatchConfig::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobSummary {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Images still to process at job start
    pub total: usize,
    /// Images skipped because their result already existed
    pub already_complete: usize,
    pub batches_run: usize,
    pub batches_skipped: usize,
    pub unreadable: usize,
    pub records_written: usize,
    pub meshes_written: usize,
    pub elapsed: Duration,
    pub throughput: Option<FpsReport>,
}

pub struct BatchRunner<'a, G: InferenceGateway + ?Sized> {
    gateway: &'a mut G,
    options: BatchOptions,
    logger: Logger,
}

impl<'a, G: InferenceGateway + ?Sized> BatchRunner<'a, G> {
    pub fn new(gateway: &'a mut G, options: BatchOptions, logger: Logger) -> Self {
        Self { gateway, options, logger }
    }

    /// Run every job in order. Stops at the first fatal error.
    pub fn run_all(&mut self, jobs: &[JobDirs]) -> Result<Vec<JobSummary>> {
        jobs.iter().map(|job| self.run(job)).collect()
    }

    pub fn run(&mut self, job: &JobDirs) -> Result<JobSummary> {
        let input_dir = job.input_dir.as_path();
        let output_dir = job.resolved_output_dir();
        log!(self.logger, "[batch] processing {}", input_dir.display());

        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;

        // 開始時に一度だけ計算する
        let completed = completion_set(&output_dir)?;
        let dataset = ImageDataset::scan(input_dir, &completed)?;
        log!(
            self.logger,
            "[batch] {} images to process, {} already done -> {}",
            dataset.len(),
            dataset.completed(),
            output_dir.display()
        );

        let mut summary = JobSummary {
            input_dir: input_dir.to_path_buf(),
            output_dir: output_dir.clone(),
            total: dataset.len(),
            already_complete: dataset.completed(),
            ..JobSummary::default()
        };

        let mut counter = ThroughputCounter::new(self.options.latency_threshold);
        let job_start = Instant::now();
        let mut processed = 0usize;
        let input_size = self.gateway.input_size();

        counter.start();
        for (iter, paths) in dataset.batches(self.options.batch_size).enumerate() {
            let loaded = load_batch(paths, input_size);
            for (path, e) in &loaded.failed {
                log!(self.logger, "[batch] skipping unreadable {}: {:#}", path.display(), e);
            }
            summary.unreadable += loaded.failed.len();
            processed += paths.len();

            if loaded.batch.is_empty() {
                summary.batches_skipped += 1;
                counter.start();
                continue;
            }

            let output = match self.gateway.infer(&loaded.batch) {
                Ok(output) => output,
                Err(e) => {
                    log!(self.logger, "[batch] inference failed for batch {}: {:#}", iter, e);
                    summary.batches_skipped += 1;
                    counter.start();
                    continue;
                }
            };
            let Some(detections) = output.detections else {
                log!(
                    self.logger,
                    "[batch] no params in outputs for batch {} ({})",
                    iter,
                    describe_paths(&loaded.paths)
                );
                summary.batches_skipped += 1;
                counter.start();
                continue;
            };
            counter.count();

            let records = match row_paths(&detections.group_index, &loaded.paths)
                .and_then(|paths| demultiplex(&detections, &paths, input_dir))
            {
                Ok(records) => records,
                Err(e) => {
                    log!(self.logger, "[batch] malformed output for batch {}: {:#}", iter, e);
                    summary.batches_skipped += 1;
                    counter.start();
                    continue;
                }
            };
            summary.batches_run += 1;

            // 書き込み失敗は致命的
            if self.options.save_dict_results {
                for record in &records {
                    record.save(record.output_path(input_dir, &output_dir))?;
                    summary.records_written += 1;
                }
            }
            if self.options.save_mesh {
                let faces = self.gateway.face_topology();
                for record in &records {
                    for (subject_idx, subject) in record.subjects.iter().enumerate() {
                        let vertices = subject.verts.points()?;
                        save_obj(mesh_path(&output_dir, &record.img_path, subject_idx), &vertices, faces)?;
                        summary.meshes_written += 1;
                    }
                }
            }

            let elapsed = job_start.elapsed().as_secs_f64();
            log!(
                self.logger,
                "[batch] {}/{} images, {} records, {:.1} img/s",
                processed,
                summary.total,
                records.len(),
                if elapsed > 0.0 { processed as f64 / elapsed } else { 0.0 }
            );
            counter.start();
        }

        summary.elapsed = job_start.elapsed();
        summary.throughput = counter.fps();
        match &summary.throughput {
            Some(report) => log!(self.logger, "[batch] done in {:.1}s, {}", summary.elapsed.as_secs_f64(), report),
            None => log!(self.logger, "[batch] done in {:.1}s, no timing data", summary.elapsed.as_secs_f64()),
        }
        Ok(summary)
    }
}

fn describe_paths(paths: &[PathBuf]) -> String {
    match paths {
        [] => String::new(),
        [only] => only.display().to_string(),
        [first, ..] => format!("{} +{}", first.display(), paths.len() - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameId;
    use crate::inference::stub::StubGateway;
    use crate::record::ResultRecord;
    use std::path::Path;
    use image::{Rgb, RgbImage};

    fn write_image(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(12, 8, Rgb([90, 60, 30])).save(path).unwrap();
    }

    fn options(batch_size: usize) -> BatchOptions {
        BatchOptions {
            batch_size,
            save_dict_results: true,
            save_mesh: false,
            latency_threshold: Duration::from_secs(10),
        }
    }

    fn file_name(id: &FrameId) -> String {
        match id {
            FrameId::Path(p) => p.file_name().unwrap().to_string_lossy().into_owned(),
            FrameId::Sequence(_) => String::new(),
        }
    }

    /// in/a.jpg (2 subjects), in/b.jpg (none), in/sub/c.png (1 subject)
    fn setup() -> (tempfile::TempDir, JobDirs, StubGateway) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        write_image(&input.join("a.jpg"));
        write_image(&input.join("b.jpg"));
        write_image(&input.join("sub/c.png"));
        let job = JobDirs { input_dir: input, output_dir: Some(dir.path().join("out")) };
        let gateway = StubGateway::with_subjects(|id| match file_name(id).as_str() {
            "a.jpg" => 2,
            "b.jpg" => 0,
            _ => 1,
        });
        (dir, job, gateway)
    }

    #[test]
    fn test_run_writes_one_archive_per_detected_image() {
        let (dir, job, mut gateway) = setup();
        let summary = BatchRunner::new(&mut gateway, options(8), Logger::stderr()).run(&job).unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.batches_run, 1);
        assert_eq!(summary.records_written, 2);
        assert_eq!(gateway.calls, 1);

        let out = dir.path().join("out");
        let a = ResultRecord::load(out.join("a.npz")).unwrap();
        assert_eq!(a.img_path, job.input_dir.join("a.jpg"));
        assert_eq!(a.subjects.len(), 2);
        assert_eq!(a.subjects[0].img_path, PathBuf::from("a.jpg"));

        let c = ResultRecord::load(out.join("sub/c.npz")).unwrap();
        assert_eq!(c.subjects.len(), 1);
        assert_eq!(c.subjects[0].img_path, PathBuf::from("sub/c.png"));
        assert!(!out.join("b.npz").exists());
    }

    #[test]
    fn test_second_run_makes_no_inference_calls() {
        let (_dir, job, mut gateway) = setup();
        // b.jpg は検出なしなので、全件を結果ありにする
        let mut gateway_all = StubGateway::uniform(1);
        BatchRunner::new(&mut gateway_all, options(2), Logger::stderr()).run(&job).unwrap();
        assert_eq!(gateway_all.calls, 2);

        let summary = BatchRunner::new(&mut gateway, options(2), Logger::stderr()).run(&job).unwrap();
        assert_eq!(gateway.calls, 0);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.already_complete, 3);
    }

    #[test]
    fn test_resume_processes_only_missing() {
        let (dir, job, mut gateway) = setup();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("a.npz"), b"done earlier").unwrap();

        let summary = BatchRunner::new(&mut gateway, options(1), Logger::stderr()).run(&job).unwrap();
        assert_eq!(summary.already_complete, 1);
        assert_eq!(summary.total, 2);
        assert_eq!(gateway.frames_seen, 2);
        // 既存ファイルはそのまま
        assert_eq!(std::fs::read(out.join("a.npz")).unwrap(), b"done earlier");
    }

    #[test]
    fn test_resume_reinfers_images_without_detections() {
        let (dir, job, mut gateway) = setup();
        BatchRunner::new(&mut gateway, options(8), Logger::stderr()).run(&job).unwrap();
        assert_eq!(gateway.frames_seen, 3);

        // b.jpg にはアーカイブが無いので毎回推論し直す
        let summary = BatchRunner::new(&mut gateway, options(8), Logger::stderr()).run(&job).unwrap();
        assert_eq!(summary.already_complete, 2);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.records_written, 0);
        assert_eq!(gateway.calls, 2);
        assert_eq!(gateway.frames_seen, 4);
        assert!(!dir.path().join("out/b.npz").exists());
    }

    #[test]
    fn test_mesh_files_count_as_completed_inputs() {
        let (dir, job, mut gateway) = setup();
        let mut opts = options(8);
        opts.save_dict_results = false;
        opts.save_mesh = true;
        BatchRunner::new(&mut gateway, opts.clone(), Logger::stderr()).run(&job).unwrap();
        assert!(dir.path().join("out/a_0.obj").exists());

        // out/a_0.obj と同じキーになる入力は完了扱い
        write_image(&job.input_dir.join("a_0.jpg"));
        let summary = BatchRunner::new(&mut gateway, opts, Logger::stderr()).run(&job).unwrap();
        assert_eq!(summary.already_complete, 1);
        assert_eq!(summary.total, 3);
        assert_eq!(gateway.frames_seen, 6);
    }

    #[test]
    fn test_failed_batches_are_skipped() {
        let (dir, job, _) = setup();
        let mut gateway = StubGateway::uniform(1);
        gateway.missing_payload = true;
        let summary = BatchRunner::new(&mut gateway, options(2), Logger::stderr()).run(&job).unwrap();
        assert_eq!(summary.batches_skipped, 2);
        assert_eq!(summary.records_written, 0);
        assert!(summary.throughput.is_none());

        let mut gateway = StubGateway::uniform(1);
        gateway.fail_with_error = true;
        let summary = BatchRunner::new(&mut gateway, options(2), Logger::stderr()).run(&job).unwrap();
        assert_eq!(summary.batches_skipped, 2);
        assert_eq!(std::fs::read_dir(dir.path().join("out")).unwrap().count(), 0);
    }

    #[test]
    fn test_unreadable_image_does_not_abort() {
        let (dir, job, _) = setup();
        std::fs::write(job.input_dir.join("broken.jpg"), b"nope").unwrap();
        let mut gateway = StubGateway::uniform(1);
        let summary = BatchRunner::new(&mut gateway, options(8), Logger::stderr()).run(&job).unwrap();
        assert_eq!(summary.unreadable, 1);
        assert_eq!(summary.records_written, 3);
        assert!(!dir.path().join("out/broken.npz").exists());
    }

    #[test]
    fn test_save_mesh() {
        let (dir, job, mut gateway) = setup();
        let mut opts = options(8);
        opts.save_dict_results = false;
        opts.save_mesh = true;
        let summary = BatchRunner::new(&mut gateway, opts, Logger::stderr()).run(&job).unwrap();

        assert_eq!(summary.records_written, 0);
        assert_eq!(summary.meshes_written, 3);
        let out = dir.path().join("out");
        assert!(out.join("a_0.obj").exists());
        assert!(out.join("a_1.obj").exists());
        assert!(out.join("c_0.obj").exists());

        let text = std::fs::read_to_string(out.join("a_1.obj")).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("v ")).count(), 4);
        assert_eq!(text.lines().filter(|l| l.starts_with("f ")).count(), 2);
        assert!(text.starts_with("v 1 1 1\n"));
    }

    #[test]
    fn test_write_failure_is_fatal() {
        let (dir, job, mut gateway) = setup();
        // a.npz の位置にディレクトリを置いて書き込みを失敗させる
        std::fs::create_dir_all(dir.path().join("out/a.npz/blocker")).unwrap();
        let result = BatchRunner::new(&mut gateway, options(8), Logger::stderr()).run(&job);
        assert!(result.is_err());
    }
}
