//! Tracing setup for the `prearc` binary.
//!
//! Human-readable output goes to stderr so stdout stays clean for JSON.
//! `RUST_LOG` picks the filter (default `info`); `PREARC_DEBUG_LOG=1` forces
//! `debug`. When `PREARC_LOG_DIR` is set, a daily-rolling file under it gets a
//! copy of every event through a non-blocking writer.

use std::env;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEBUG_ENV: &str = "PREARC_DEBUG_LOG";
const LOG_DIR_ENV: &str = "PREARC_LOG_DIR";
const LOG_FILE_PREFIX: &str = "prearc.log";

fn debug_enabled() -> bool {
    env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

/// Installs the global subscriber. Keep the returned guard alive until exit
/// or buffered file output is lost.
pub fn init() -> Option<WorkerGuard> {
    let filter = if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (file_layer, guard) = match env::var_os(LOG_DIR_ENV) {
        Some(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    guard
}
