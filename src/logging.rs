use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";
const LOG_FILE_PREFIX: &str = "docsync.log";

/// `DOCSYNC_LOG` wins over `RUST_LOG`.
fn env_directive() -> Option<String> {
  std::env::var("DOCSYNC_LOG")
    .or_else(|_| std::env::var("RUST_LOG"))
    .ok()
    .filter(|d| !d.trim().is_empty())
}

fn build_filter(directive: Option<&str>) -> EnvFilter {
  directive
    .and_then(|d| EnvFilter::try_new(d).ok())
    .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

pub fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|d| d.join("docsync"))
}

/// Install the global subscriber. Logs go to a daily file under `dir` when
/// given so stdout stays reserved for command output; otherwise to stderr.
///
/// The returned guard flushes the file writer and must outlive the run.
pub fn init(dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = build_filter(env_directive().as_deref());

  let Some(dir) = dir else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    return Ok(None);
  };

  std::fs::create_dir_all(dir)?;
  let appender = RollingFileAppender::builder()
    .rotation(Rotation::DAILY)
    .filename_prefix(LOG_FILE_PREFIX)
    .build(dir)
    .map_err(|e| eyre!("Failed to open log directory {}: {}", dir.display(), e))?;
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_ansi(false)
    .with_writer(writer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
  Ok(Some(guard))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_directive_falls_back_to_info() {
    assert_eq!(build_filter(None).to_string(), DEFAULT_DIRECTIVE);
    assert_eq!(build_filter(Some("docsync=debug")).to_string(), "docsync=debug");
  }
}
