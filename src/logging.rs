use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding the log filter, e.g. `TETHER_LOG=tether=debug`.
pub const LOG_ENV: &str = "TETHER_LOG";

/// Initialize the tracing subscriber.
///
/// Logs go to a daily rolling file under `log_dir`, and to stderr as well
/// when `to_stderr` is set. The returned guard flushes the file writer on
/// drop and must be held until exit.
pub fn init(log_dir: &Path, to_stderr: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

  let file_appender = tracing_appender::rolling::daily(log_dir, "tether.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let stderr_layer = to_stderr.then(|| fmt::layer().with_writer(io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
