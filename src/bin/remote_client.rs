//! Remote client: streams the images of a directory to a running responder
//! and reports what comes back.
//!
//! Usage: remote_client <addr> <frame_dir>

use std::time::Instant;

use anyhow::{Context, Result};
use hmr_pipeline::dataset::{is_image, list_files};
use hmr_pipeline::log;
use hmr_pipeline::logging::Logger;
use hmr_pipeline::protocol::Response;
use hmr_pipeline::responder::RemoteClient;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:9999".to_string());
    let dir = args.next().context("usage: remote_client <addr> <frame_dir>")?;
    let logger = Logger::open("logs", "remote_client")?;

    log!(logger, "Remote Client ({})", env!("GIT_VERSION"));
    let mut client = RemoteClient::connect(&addr).await?;
    log!(logger, "Connected to {}", addr);

    let frames: Vec<_> = list_files(dir.as_ref())?.into_iter().filter(|p| is_image(p)).collect();
    let start = Instant::now();
    let mut failed = 0usize;
    for path in &frames {
        let Ok((width, height)) = image::image_dimensions(path) else {
            // 読めないフレームは「フレームなし」として送る
            client.send_no_frame().await?;
            continue;
        };
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        match client.send_frame(width, height, bytes).await? {
            Response::Vertices { vertices } => {
                log!(logger, "{}: {} vertices", path.display(), vertices.len());
            }
            Response::Failed => {
                failed += 1;
                log!(logger, "{}: failed", path.display());
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    log!(
        logger,
        "{} frames, {} failed, {:.1} FPS",
        frames.len(),
        failed,
        if elapsed > 0.0 { frames.len() as f64 / elapsed } else { 0.0 }
    );
    Ok(())
}
