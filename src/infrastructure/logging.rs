//! Tracing subscriber initialization.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use super::config::LoggingConfig;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. When file logging is
/// enabled the returned guard must be held for the process lifetime so
/// buffered lines get flushed.
pub fn init(config: &LoggingConfig, data_dir: &Path) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    if config.file {
        std::fs::create_dir_all(data_dir)?;
        let appender = tracing_appender::rolling::never(data_dir, "workfarm.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false);
        if config.format == "json" {
            builder.json().init();
        } else {
            builder.init();
        }
        Ok(Some(guard))
    } else {
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        if config.format == "json" {
            builder.json().init();
        } else {
            builder.init();
        }
        Ok(None)
    }
}
