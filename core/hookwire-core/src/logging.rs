//! Structured logging using tracing.
//!
//! Logs to `<log_dir>/hookwire.{date}.log` with daily rotation, keeping 7 days.
//! Level is controlled via `RUST_LOG`. Falls back to stderr if the file
//! appender cannot be created. Never logs to stdout, which carries the
//! protocol response.

use fs_err as fs;
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::EngineConfig;

const DEFAULT_FILTER: &str = "hookwire_core=info,hookwire_hook=debug";

pub fn init(config: &EngineConfig) {
    let _ = fs::create_dir_all(&config.log_dir);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let result = match create_file_appender(&config.log_dir) {
        Ok(file_appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // Short-lived process: keep the guard alive until exit so the
            // buffered lines are flushed.
            std::mem::forget(guard);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_timer(fmt::time::UtcTime::rfc_3339())
                        .with_ansi(false),
                )
                .try_init()
        }
        Err(_) => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .with_ansi(true),
            )
            .try_init(),
    };

    // A subscriber is already installed (embedding app, tests); keep it.
    let _ = result;
}

fn create_file_appender(
    log_dir: &Path,
) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("hookwire")
        .filename_suffix("log")
        .max_log_files(7)
        .build(log_dir)
}
