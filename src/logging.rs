//! Log setup for the maintenance binary.
//!
//! Logs go to a daily rolling file in the data directory so stdout stays
//! clean for command output. `SOCIALSYNC_LOG` overrides the configured
//! level with a full `EnvFilter` directive.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_ENV: &str = "SOCIALSYNC_LOG";

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the program or buffered lines are lost.
pub fn init(log_dir: &Path, default_level: &str) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "socialsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter(default_level))
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to set global subscriber: {}", e))?;

  Ok(guard)
}

fn filter(default_level: &str) -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_level_used_without_env() {
    std::env::remove_var(LOG_ENV);
    assert_eq!(filter("debug").to_string(), "debug");
  }
}
