use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize file logging under the data directory.
///
/// Logging is optional: if the directory cannot be resolved or created the
/// program runs without a log file. The returned guard must be held until
/// exit so buffered lines are flushed.
pub fn init() -> Option<WorkerGuard> {
  match log_dir().and_then(|dir| init_at(&dir)) {
    Ok(guard) => Some(guard),
    Err(e) => {
      eprintln!("warning: {} (file logging disabled)", e);
      None
    }
  }
}

fn log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("innerorder"))
}

/// Write daily log files into `log_dir`.
///
/// Uses `RUST_LOG`, defaulting to info. Stdout stays free for response
/// bodies.
pub fn init_at(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "innerorder.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unusable_log_dir_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, "").unwrap();

    assert!(init_at(&file.join("logs")).is_err());
  }
}
