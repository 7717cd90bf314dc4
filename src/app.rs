//! Run modes: wires configuration, gateway and loops together.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::camera::{open_source, CaptureSpec};
use crate::config::{Config, RunMode};
use crate::inference::InferenceGateway;
use crate::log;
use crate::logging::Logger;
use crate::realtime::{LoopOptions, LoopSummary, RealtimeLoop};
use crate::render::{DisplayTransform, MeshRenderer, PresentationMode, VisualizerSink};
use crate::responder::Responder;
use crate::runner::{BatchOptions, BatchRunner, JobSummary};

pub fn run<G: InferenceGateway>(config: &Config, gateway: G, logger: &Logger) -> Result<()> {
    log!(logger, "[app] mode: {:?}, gateway: {}", config.mode, gateway.name());
    match config.mode {
        RunMode::Batch => {
            let mut gateway = gateway;
            run_batch(config, &mut gateway, logger).map(|_| ())
        }
        RunMode::Video | RunMode::WebcamLocal => {
            let mut gateway = gateway;
            run_local(config, &mut gateway, logger).map(|_| ())
        }
        RunMode::WebcamRemote => run_remote(config, gateway, logger),
    }
}

pub fn run_batch<G: InferenceGateway + ?Sized>(
    config: &Config,
    gateway: &mut G,
    logger: &Logger,
) -> Result<Vec<JobSummary>> {
    if config.batch.jobs.is_empty() {
        bail!("no [[batch.jobs]] configured");
    }
    let options = BatchOptions::from(&config.batch);
    BatchRunner::new(gateway, options, logger.clone()).run_all(&config.batch.jobs)
}

/// Video / webcam → local visualizer. Ctrl-C stops after the current frame.
pub fn run_local<G: InferenceGateway + ?Sized>(
    config: &Config,
    gateway: &mut G,
    logger: &Logger,
) -> Result<LoopSummary> {
    let rt = &config.realtime;
    let spec = CaptureSpec::parse(&rt.source);
    if config.mode == RunMode::WebcamLocal && !matches!(spec, CaptureSpec::Camera(_)) {
        log!(logger, "[app] webcam mode with non-camera source {:?}", spec);
    }
    let mut source = open_source(&spec)?;

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))
        .context("failed to register SIGINT handler")?;

    let mode = PresentationMode::from_show_single(rt.show_single);
    let transform = DisplayTransform::from(&rt.display);
    let renderer = local_renderer(config, logger)?;
    let mut sink = VisualizerSink::new(renderer, mode, transform);

    let mut realtime = RealtimeLoop::new(gateway, LoopOptions::from(rt), logger.clone()).with_stop_flag(stop);
    realtime.warm_up()?;
    realtime.run(&mut *source, &mut sink)
}

#[cfg(feature = "desktop")]
fn local_renderer(config: &Config, _logger: &Logger) -> Result<Box<dyn MeshRenderer>> {
    let size = config.realtime.window_size;
    Ok(Box::new(crate::render::MinifbRenderer::new("hmr-pipeline", size, size)?))
}

#[cfg(not(feature = "desktop"))]
fn local_renderer(config: &Config, logger: &Logger) -> Result<Box<dyn MeshRenderer>> {
    log!(logger, "[app] built without `desktop`, rendering headless");
    Ok(Box::new(crate::render::HeadlessRenderer::new(logger.clone(), config.verbose)))
}

/// Frames over TCP → primary subject's vertices back.
pub fn run_remote<G: InferenceGateway>(config: &Config, gateway: G, logger: &Logger) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    let transform = DisplayTransform::from(&config.realtime.display);
    let threshold = Duration::from_secs_f64(config.realtime.latency_threshold_secs.max(0.0));
    let interval = Duration::from_secs_f64(config.realtime.fps_log_interval_secs.max(0.0));
    let addr = config.remote.listen_addr.clone();
    let logger = logger.clone();

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        let mut responder = Responder::new(gateway, transform, threshold, logger).with_fps_log_interval(interval);
        responder.serve(listener).await
    })
}

/// Model gateway for the configured backend.
#[cfg(feature = "onnx")]
pub fn build_gateway(config: &Config) -> Result<Box<dyn InferenceGateway>> {
    let faces = config.model.faces_path.as_deref().map(Path::new);
    let gateway =
        crate::inference::OnnxGateway::new(Path::new(&config.model.model_path), config.model.input_size, faces)?;
    Ok(Box::new(gateway))
}

#[cfg(not(feature = "onnx"))]
pub fn build_gateway(config: &Config) -> Result<Box<dyn InferenceGateway>> {
    bail!(
        "no inference backend for {}: build with the `onnx` feature",
        Path::new(&config.model.model_path).display()
    )
}
