use anyhow::Result;
use hmr_pipeline::app;
use hmr_pipeline::config::Config;
use hmr_pipeline::log;
use hmr_pipeline::logging::Logger;

const CONFIG_PATH: &str = "hmr_pipeline.toml";

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| CONFIG_PATH.to_string());
    let config = Config::load_or_default(&config_path);
    let logger = Logger::open(&config.log_dir, "hmr_pipeline")?;

    log!(logger, "HMR Pipeline ({})", env!("GIT_VERSION"));
    log!(logger, "Config: {}", config_path);
    log!(logger, "Model: {} (input {})", config.model.model_path, config.model.input_size);
    if config.verbose { log!(logger, "Verbose mode: ON"); }

    let gateway = app::build_gateway(&config)?;
    log!(logger, "Model loaded");

    if let Err(e) = app::run(&config, gateway, &logger) {
        log!(logger, "[app] fatal: {:#}", e);
        return Err(e);
    }
    log!(logger, "Done");
    Ok(())
}
