use std::fs;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes console + daily-rotating-file logging. `format` selects
/// between a human-readable console layer and a JSON one; the file layer
/// is always JSON so downstream log shippers don't need to re-parse it.
pub fn init_logging(config: &LoggingConfig) {
    let _ = fs::create_dir_all(&config.directory);

    let file_appender = tracing_appender::rolling::daily(&config.directory, "catalog_sync.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("catalog_sync={}", config.level)));

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    if config.format == "json" {
        registry.with(fmt::layer().json().with_writer(std::io::stdout)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stdout)).init();
    }

    // Leak the guard: it must live for the process lifetime to flush buffered logs.
    std::mem::forget(guard);
}
