use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::DEFAULT_PAGE_SIZE;
use crate::error::{Error, Result};
use crate::observer::Strategy;
use crate::pagination::PaginationMode;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(flatten)]
  pub sync: SyncConfig,
  /// SQLite cache location (defaults to the user data directory)
  pub cache_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub url: String,
  /// How often the HTTP store is re-read to emulate a push feed
  #[serde(default = "default_watch_interval_secs")]
  pub watch_interval_secs: u64,
}

/// Engine settings for one collection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
  #[serde(default = "default_collection")]
  pub collection: String,
  #[serde(default = "default_page_size")]
  pub page_size: usize,
  #[serde(default)]
  pub strategy: StrategySetting,
  #[serde(default = "default_poll_interval_secs")]
  pub poll_interval_secs: u64,
  #[serde(default)]
  pub pagination: PaginationSetting,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StrategySetting {
  /// Standing subscription, filtered by fingerprint
  #[default]
  Push,
  /// Periodic newest-timestamp probe
  Pull,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaginationSetting {
  #[default]
  Flat,
  Cursor,
}

impl From<PaginationSetting> for PaginationMode {
  fn from(setting: PaginationSetting) -> Self {
    match setting {
      PaginationSetting::Flat => PaginationMode::FlatSlice,
      PaginationSetting::Cursor => PaginationMode::CursorPaged,
    }
  }
}

fn default_collection() -> String {
  "products".to_string()
}

fn default_page_size() -> usize {
  DEFAULT_PAGE_SIZE
}

fn default_poll_interval_secs() -> u64 {
  30
}

fn default_watch_interval_secs() -> u64 {
  5
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      collection: default_collection(),
      page_size: default_page_size(),
      strategy: StrategySetting::default(),
      poll_interval_secs: default_poll_interval_secs(),
      pagination: PaginationSetting::default(),
    }
  }
}

impl SyncConfig {
  pub fn strategy(&self) -> Strategy {
    match self.strategy {
      StrategySetting::Push => Strategy::Push,
      StrategySetting::Pull => Strategy::Pull {
        interval: Duration::from_secs(self.poll_interval_secs),
      },
    }
  }

  pub fn validate(&self) -> Result<()> {
    if self.collection.trim().is_empty() {
      return Err(Error::InvalidConfig("collection must not be empty".into()));
    }
    if self.page_size == 0 {
      return Err(Error::InvalidConfig("page_size must be positive".into()));
    }
    if self.poll_interval_secs == 0 {
      return Err(Error::InvalidConfig(
        "poll_interval_secs must be positive".into(),
      ));
    }
    Ok(())
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./docsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/docsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::InvalidConfig(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(Error::InvalidConfig(
        "No configuration file found. Create one at ~/.config/docsync/config.yaml".into(),
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("docsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("docsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      Error::InvalidConfig(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    Self::from_yaml(&contents)
      .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)
      .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
    config.sync.validate()?;
    Ok(config)
  }

  /// Bearer token for the remote store, from `DOCSYNC_TOKEN`.
  pub fn get_token() -> Option<String> {
    std::env::var("DOCSYNC_TOKEN").ok().filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn minimal_config_uses_defaults() {
    let config = Config::from_yaml("remote:\n  url: http://localhost:8080\n").unwrap();
    assert_eq!(config.sync, SyncConfig::default());
    assert_eq!(config.remote.watch_interval_secs, 5);
    assert_eq!(config.sync.strategy(), Strategy::Push);
    assert!(config.cache_path.is_none());
  }

  #[test]
  fn full_config() {
    let yaml = r#"
remote:
  url: https://store.example.com/api
  watch_interval_secs: 2
collection: inventory
page_size: 3
strategy: pull
poll_interval_secs: 12
pagination: cursor
cache_path: /tmp/docsync.db
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.sync.collection, "inventory");
    assert_eq!(config.sync.page_size, 3);
    assert_eq!(
      config.sync.strategy(),
      Strategy::Pull {
        interval: Duration::from_secs(12)
      }
    );
    assert_eq!(
      PaginationMode::from(config.sync.pagination),
      PaginationMode::CursorPaged
    );
    assert_eq!(config.cache_path, Some(PathBuf::from("/tmp/docsync.db")));
  }

  #[test]
  fn rejects_zero_page_size() {
    let err = Config::from_yaml("remote:\n  url: http://x\npage_size: 0\n").unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
  }
}
