use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::AppResult;
use crate::modules::config::get_data_dir;

/// `<data_dir>/logs`
pub fn default_log_dir() -> AppResult<PathBuf> {
    Ok(get_data_dir()?.join("logs"))
}

/// Initialize logger system
pub fn init_logger(log_dir: &Path) -> AppResult<()> {
    // Capture log macro logs
    let _ = tracing_log::LogTracer::init();

    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // 1. Daily rolling file appender
    let file_appender = tracing_appender::rolling::daily(log_dir, "proxy.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // 2. Console output layer
    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    // 3. File output layer (disable ANSI formatting)
    let file_layer = fmt::Layer::new()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_level(true);

    // 4. Filter layer (default to INFO and above)
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // 5. Use try_init so a second initialization is a no-op
    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    // The worker must outlive every log call; keep it until exit
    std::mem::forget(guard);

    info!("Logger initialized (console + {:?})", log_dir);
    Ok(())
}
