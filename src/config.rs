use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::record::Collection;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Per-collection TTL overrides, in seconds
  pub ttl: BTreeMap<Collection, u64>,
  /// Age after which a fresh hit also triggers a background refresh, as a
  /// fraction of the collection TTL. Unset: fresh hits never refresh.
  pub stale_fraction: Option<f64>,
  pub remote_timeout_ms: u64,
  /// Pause before reopening a transport stream that ended
  pub reconnect_backoff_ms: u64,
  /// Default log filter when SOCIALSYNC_LOG is not set
  pub log_level: String,
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Cache database (defaults to $XDG_DATA_HOME/socialsync/cache.db)
  pub path: Option<PathBuf>,
  pub max_bytes: Option<u64>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      ttl: BTreeMap::new(),
      stale_fraction: None,
      remote_timeout_ms: 10_000,
      reconnect_backoff_ms: 1_000,
      log_level: "info".to_string(),
      storage: StorageConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./socialsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/socialsync/config.yaml
  ///
  /// Without a file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("socialsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("socialsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty document is valid and means "all defaults"
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }

    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if let Some(fraction) = config.stale_fraction {
      if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(eyre!("stale_fraction must be in (0, 1], got {}", fraction));
      }
    }
    Ok(config)
  }

  pub fn ttl_for(&self, collection: Collection) -> Duration {
    self
      .ttl
      .get(&collection)
      .map(|secs| Duration::from_secs(*secs))
      .unwrap_or_else(|| collection.default_ttl())
  }

  pub fn remote_timeout(&self) -> Duration {
    Duration::from_millis(self.remote_timeout_ms)
  }

  pub fn reconnect_backoff(&self) -> Duration {
    Duration::from_millis(self.reconnect_backoff_ms)
  }

  /// Directory for the cache database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("socialsync"))
  }

  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_without_file() {
    let config = Config::from_yaml("").unwrap();
    assert_eq!(config.stale_fraction, None);
    assert_eq!(config.ttl_for(Collection::Posts), Duration::from_secs(300));
    assert_eq!(config.remote_timeout(), Duration::from_secs(10));
  }

  #[test]
  fn test_ttl_overrides() {
    let config = Config::from_yaml(
      r#"
ttl:
  messages: 30
  groups: 1200
stale_fraction: 0.25
storage:
  max_bytes: 1048576
"#,
    )
    .unwrap();
    assert_eq!(config.ttl_for(Collection::Messages), Duration::from_secs(30));
    assert_eq!(config.ttl_for(Collection::Groups), Duration::from_secs(1200));
    assert_eq!(config.ttl_for(Collection::Profiles), Duration::from_secs(1800));
    assert_eq!(config.storage.max_bytes, Some(1_048_576));
    assert_eq!(config.stale_fraction, Some(0.25));
  }

  #[test]
  fn test_rejects_bad_stale_fraction() {
    assert!(Config::from_yaml("stale_fraction: 0").is_err());
    assert!(Config::from_yaml("stale_fraction: 1.5").is_err());
  }

  #[test]
  fn test_rejects_unknown_collection() {
    assert!(Config::from_yaml("ttl:\n  likes: 10\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let missing = Path::new("/nonexistent/socialsync.yaml");
    assert!(Config::load(Some(missing)).is_err());
  }
}
