//! Log setup for the binary. Output goes to a daily file so the terminal
//! stays clean.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Directory logs are written to: `log.dir`, else `$XDG_DATA_HOME/flowto/logs`.
pub fn log_dir(config: &LogConfig) -> Result<PathBuf> {
  if let Some(dir) = &config.dir {
    return Ok(dir.clone());
  }
  let data_dir = dirs::data_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(data_dir.join("flowto").join("logs"))
}

/// Install the global subscriber. `FLOWTO_LOG` takes precedence over
/// `log.level`.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the writer.
pub fn init(config: &LogConfig) -> Result<WorkerGuard> {
  let dir = log_dir(config)?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "flowto.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env("FLOWTO_LOG").unwrap_or_else(|_| EnvFilter::new(&config.level));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
