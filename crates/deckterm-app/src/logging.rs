use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_FILE_NAME: &str = "deckterm.log";

/// Send logs to `<data_dir>/deckterm.log`.
///
/// The host terminal is in raw mode and shows the shell, so nothing is ever
/// logged to stdout or stderr. `log` records from the library crates are
/// picked up too. Keep the returned guard alive until exit or buffered lines
/// are lost.
pub fn init(data_dir: &Path) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;

    let file_appender = tracing_appender::rolling::never(data_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Defaults to "info" if RUST_LOG is not set.
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false),
        )
        .try_init()?;

    Ok(guard)
}
